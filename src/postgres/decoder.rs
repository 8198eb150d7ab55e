//! Decoder for the `test_decoding` output plugin's text format.
//!
//! Each slot row carries one line such as
//!
//! ```text
//! BEGIN 529
//! table public.users: INSERT: id[integer]:1 name[text]:'O''Brien'
//! table public.users: UPDATE: old-key: id[integer]:1 new-tuple: id[integer]:2 name[text]:'x'
//! table public.users: DELETE: id[integer]:2
//! table public.a, public.b: TRUNCATE: cascade
//! COMMIT 529
//! ```
//!
//! The decoder is stateless; commit positions come from the row's `lsn`
//! column rather than the text.

use tracing::trace;

use super::types::{
    Change, ChangeOperation, ChangeRecord, Column, Datum, DecodedMessage, RawChange, TableName,
    Truncate,
};
use crate::error::DecodeError;

const NO_TUPLE: &str = " (no-tuple data)";
const OLD_KEY: &str = " old-key:";
const NEW_TUPLE: &str = " new-tuple:";

#[derive(Debug, Default, Clone, Copy)]
pub struct TestDecodingDecoder;

impl TestDecodingDecoder {
    pub fn new() -> Self {
        Self
    }

    pub fn decode(&self, raw: &RawChange) -> Result<DecodedMessage, DecodeError> {
        let fail = |reason: String| DecodeError {
            lsn: raw.lsn,
            reason,
            payload: raw.data.clone(),
        };

        let mut scanner = Scanner::new(&raw.data);
        let message = if scanner.eat("BEGIN") {
            let xid = parse_xid(&mut scanner).map_err(fail)?;
            expect_end(&scanner).map_err(fail)?;
            DecodedMessage::Begin { xid: xid.or(raw.xid) }
        } else if scanner.eat("COMMIT") {
            let xid = parse_xid(&mut scanner).map_err(fail)?;
            if scanner.eat(" (at ") {
                let rest = scanner.rest();
                if !rest.ends_with(')') || rest.len() < 2 {
                    return Err(fail("unterminated commit timestamp".to_string()));
                }
                scanner.skip_to_end();
            }
            expect_end(&scanner).map_err(fail)?;
            DecodedMessage::Commit {
                xid: xid.or(raw.xid),
                lsn: raw.lsn,
            }
        } else if scanner.eat("table ") {
            decode_table_change(&mut scanner).map_err(fail)?
        } else if scanner.eat("message: ") {
            decode_message(&mut scanner).map_err(fail)?
        } else {
            return Err(fail("unrecognized statement".to_string()));
        };

        trace!(lsn = %raw.lsn, "decoded {:?}", message);
        Ok(message)
    }
}

fn parse_xid(scanner: &mut Scanner<'_>) -> Result<Option<u32>, String> {
    if !scanner.peek_is(' ') || scanner.rest().starts_with(" (") {
        return Ok(None);
    }
    scanner.bump();
    let digits = scanner.take_while(|c| c.is_ascii_digit());
    if digits.is_empty() {
        return Err(format!("expected transaction id, found {:?}", scanner.rest()));
    }
    digits
        .parse::<u32>()
        .map(Some)
        .map_err(|e| format!("invalid transaction id {:?}: {}", digits, e))
}

fn expect_end(scanner: &Scanner<'_>) -> Result<(), String> {
    if scanner.is_empty() {
        Ok(())
    } else {
        Err(format!("unexpected trailing input {:?}", scanner.rest()))
    }
}

fn decode_table_change(scanner: &mut Scanner<'_>) -> Result<DecodedMessage, String> {
    let mut tables = vec![scanner.qualified_name()?];
    while scanner.eat(", ") {
        tables.push(scanner.qualified_name()?);
    }
    scanner.expect(": ")?;

    let action = scanner.take_while(|c| c.is_ascii_uppercase());
    scanner.expect(":")?;

    if action == "TRUNCATE" {
        return decode_truncate(scanner, tables);
    }

    if tables.len() != 1 {
        return Err(format!("{} names {} tables", action, tables.len()));
    }
    let table = tables.remove(0);

    let (op, columns) = match action {
        "INSERT" => {
            let new = tuple_or_none(scanner)?;
            (ChangeOperation::Insert, merge_columns(None, new))
        }
        "UPDATE" => {
            let old = if scanner.eat(OLD_KEY) {
                let old = scanner.columns(Some(NEW_TUPLE))?;
                scanner.expect(NEW_TUPLE)?;
                Some(old)
            } else {
                None
            };
            let new = tuple_or_none(scanner)?;
            (ChangeOperation::Update, merge_columns(old, new))
        }
        "DELETE" => {
            let old = tuple_or_none(scanner)?;
            (ChangeOperation::Delete, merge_columns(old, None))
        }
        other => return Err(format!("unknown action {:?}", other)),
    };

    Ok(DecodedMessage::Change(Change::Row(ChangeRecord {
        op,
        table,
        columns,
    })))
}

fn decode_truncate(
    scanner: &mut Scanner<'_>,
    tables: Vec<TableName>,
) -> Result<DecodedMessage, String> {
    let mut restart_identity = false;
    let mut cascade = false;

    if !scanner.eat(" (no-flags)") {
        loop {
            if scanner.eat(" restart_seqs") {
                restart_identity = true;
            } else if scanner.eat(" cascade") {
                cascade = true;
            } else {
                break;
            }
        }
        if !restart_identity && !cascade {
            return Err(format!("unknown TRUNCATE flags {:?}", scanner.rest()));
        }
    }
    expect_end(scanner)?;

    Ok(DecodedMessage::Change(Change::Truncate(Truncate {
        tables,
        restart_identity,
        cascade,
    })))
}

fn decode_message(scanner: &mut Scanner<'_>) -> Result<DecodedMessage, String> {
    scanner.expect("transactional: ")?;
    let transactional = match scanner.take_while(|c| c.is_ascii_digit()) {
        "0" => false,
        "1" => true,
        other => return Err(format!("invalid transactional flag {:?}", other)),
    };
    scanner.expect(" prefix: ")?;
    let prefix = scanner.take_until(", sz: ")?.to_string();
    scanner.expect(", sz: ")?;
    let size = scanner.take_while(|c| c.is_ascii_digit());
    let size: usize = size
        .parse()
        .map_err(|_| format!("invalid message size {:?}", size))?;
    scanner.expect(" content:")?;
    let content = scanner.rest().to_string();
    scanner.skip_to_end();
    if content.len() != size {
        return Err(format!(
            "message content is {} bytes but header says {}",
            content.len(),
            size
        ));
    }

    Ok(DecodedMessage::Message {
        transactional,
        prefix,
        content,
    })
}

fn tuple_or_none(scanner: &mut Scanner<'_>) -> Result<Option<Vec<(String, String, Datum)>>, String> {
    if scanner.eat(NO_TUPLE) {
        expect_end(scanner)?;
        return Ok(None);
    }
    let columns = scanner.columns(None)?;
    expect_end(scanner)?;
    Ok(Some(columns))
}

/// Folds the old-key and new tuples into one ordered column list: new-tuple
/// order first, then old-only columns.
fn merge_columns(
    old: Option<Vec<(String, String, Datum)>>,
    new: Option<Vec<(String, String, Datum)>>,
) -> Vec<Column> {
    let mut columns: Vec<Column> = new
        .unwrap_or_default()
        .into_iter()
        .map(|(name, type_name, value)| Column {
            name,
            type_name,
            old: None,
            new: Some(value),
        })
        .collect();

    for (name, type_name, value) in old.unwrap_or_default() {
        match columns.iter_mut().find(|c| c.name == name) {
            Some(column) => column.old = Some(value),
            None => columns.push(Column {
                name,
                type_name,
                old: Some(value),
                new: None,
            }),
        }
    }

    columns
}

struct Scanner<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Scanner<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn rest(&self) -> &'a str {
        &self.input[self.pos..]
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.input.len()
    }

    fn skip_to_end(&mut self) {
        self.pos = self.input.len();
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn peek_is(&self, c: char) -> bool {
        self.peek() == Some(c)
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn eat(&mut self, literal: &str) -> bool {
        if self.rest().starts_with(literal) {
            self.pos += literal.len();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, literal: &str) -> Result<(), String> {
        if self.eat(literal) {
            Ok(())
        } else {
            Err(format!("expected {:?}, found {:?}", literal, truncate(self.rest())))
        }
    }

    fn take_while(&mut self, pred: impl Fn(char) -> bool) -> &'a str {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if !pred(c) {
                break;
            }
            self.pos += c.len_utf8();
        }
        &self.input[start..self.pos]
    }

    fn take_until(&mut self, delimiter: &str) -> Result<&'a str, String> {
        let rest = self.rest();
        let end = rest
            .find(delimiter)
            .ok_or_else(|| format!("missing {:?}", delimiter))?;
        self.pos += end;
        Ok(&rest[..end])
    }

    /// A possibly double-quoted identifier.
    fn identifier(&mut self) -> Result<String, String> {
        if self.peek_is('"') {
            self.bump();
            let mut ident = String::new();
            loop {
                match self.bump() {
                    Some('"') if self.peek_is('"') => {
                        self.bump();
                        ident.push('"');
                    }
                    Some('"') => return Ok(ident),
                    Some(c) => ident.push(c),
                    None => return Err("unterminated quoted identifier".to_string()),
                }
            }
        }

        let ident = self.take_while(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$');
        if ident.is_empty() {
            return Err(format!("expected identifier, found {:?}", truncate(self.rest())));
        }
        Ok(ident.to_string())
    }

    fn qualified_name(&mut self) -> Result<TableName, String> {
        let first = self.identifier()?;
        if self.eat(".") {
            let table = self.identifier()?;
            Ok(TableName::new(first, table))
        } else {
            Ok(TableName::new("public", first))
        }
    }

    /// Space-prefixed `name[type]:value` entries until the end of input or
    /// `stop`.
    fn columns(&mut self, stop: Option<&str>) -> Result<Vec<(String, String, Datum)>, String> {
        let mut columns = Vec::new();
        loop {
            if self.is_empty() {
                break;
            }
            if let Some(stop) = stop {
                if self.rest().starts_with(stop) {
                    break;
                }
            }
            self.expect(" ")?;
            let name = self.identifier()?;
            self.expect("[")?;
            let type_name = self.take_until("]:")?.to_string();
            if type_name.is_empty() {
                return Err(format!("column {:?} has an empty type", name));
            }
            self.expect("]:")?;
            let value = self.value()?;
            columns.push((name, type_name, value));
        }
        Ok(columns)
    }

    fn value(&mut self) -> Result<Datum, String> {
        if self.peek_is('\'') {
            return self.quoted().map(Datum::Text);
        }
        if self.rest().starts_with("B'") {
            self.bump();
            let bits = self.quoted()?;
            if !bits.chars().all(|c| c == '0' || c == '1') {
                return Err(format!("invalid bit string {:?}", bits));
            }
            return Ok(Datum::Bits(bits));
        }

        let token = self.take_while(|c| c != ' ');
        match token {
            "null" => Ok(Datum::Null),
            "unchanged-toast-datum" => Ok(Datum::UnchangedToast),
            "true" => Ok(Datum::Bool(true)),
            "false" => Ok(Datum::Bool(false)),
            t if is_numeric_literal(t) => Ok(Datum::Number(t.to_string())),
            "" => Err("missing value".to_string()),
            t => Err(format!("unrecognized value token {:?}", t)),
        }
    }

    /// Single-quoted literal with `''` as the escaped quote.
    fn quoted(&mut self) -> Result<String, String> {
        self.expect("'")?;
        let mut value = String::new();
        loop {
            match self.bump() {
                Some('\'') if self.peek_is('\'') => {
                    self.bump();
                    value.push('\'');
                }
                Some('\'') => break,
                Some(c) => value.push(c),
                None => return Err("unterminated quoted value".to_string()),
            }
        }
        if !(self.is_empty() || self.peek_is(' ')) {
            return Err(format!(
                "unexpected input after quoted value: {:?}",
                truncate(self.rest())
            ));
        }
        Ok(value)
    }
}

fn is_numeric_literal(token: &str) -> bool {
    if matches!(token, "NaN" | "Infinity" | "-Infinity") {
        return true;
    }
    token.chars().any(|c| c.is_ascii_digit())
        && token
            .chars()
            .all(|c| c.is_ascii_digit() || matches!(c, '-' | '+' | '.' | 'e' | 'E'))
}

fn truncate(s: &str) -> &str {
    match s.char_indices().nth(40) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
