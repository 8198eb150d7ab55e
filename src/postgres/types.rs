use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A position in the source's write-ahead log.
///
/// Ordered numerically; the canonical text form is PostgreSQL's `X/Y`
/// hexadecimal notation (e.g. `16/B374D848`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Lsn(pub u64);

impl Lsn {
    pub const ZERO: Lsn = Lsn(0);
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 & 0xFFFF_FFFF)
    }
}

impl FromStr for Lsn {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (hi, lo) = s
            .split_once('/')
            .ok_or_else(|| format!("invalid LSN '{}': missing '/'", s))?;
        let hi = u32::from_str_radix(hi, 16).map_err(|e| format!("invalid LSN '{}': {}", s, e))?;
        let lo = u32::from_str_radix(lo, 16).map_err(|e| format!("invalid LSN '{}': {}", s, e))?;
        Ok(Lsn(((hi as u64) << 32) | lo as u64))
    }
}

impl TryFrom<String> for Lsn {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Lsn> for String {
    fn from(lsn: Lsn) -> Self {
        lsn.to_string()
    }
}

/// Schema-qualified table name, stored unquoted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableName {
    pub schema: String,
    pub table: String,
}

impl TableName {
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
        }
    }

    /// `"schema"."table"` with embedded quotes doubled.
    pub fn quoted(&self) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(&self.table))
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.table)
    }
}

pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// A single decoded column value.
#[derive(Debug, Clone, PartialEq)]
pub enum Datum {
    Null,
    /// TOASTed value the source did not re-send because it did not change.
    UnchangedToast,
    Bool(bool),
    /// Unquoted numeric literal, kept verbatim (`42`, `-1.5e3`, `NaN`).
    Number(String),
    /// Quoted literal with escaping removed. Covers text, bytea (`\x..`),
    /// arrays, json and every other type the plugin quotes.
    Text(String),
    /// Bit string from a `B'...'` literal, without the wrapper.
    Bits(String),
}

impl Datum {
    /// Text representation suitable for a `::text::<type>` cast, `None` for
    /// SQL NULL. Unchanged TOAST values have no representation.
    pub fn to_sql_text(&self) -> Option<String> {
        match self {
            Datum::Null | Datum::UnchangedToast => None,
            Datum::Bool(b) => Some(b.to_string()),
            Datum::Number(n) => Some(n.clone()),
            Datum::Text(s) => Some(s.clone()),
            Datum::Bits(b) => Some(b.clone()),
        }
    }

    pub fn is_unchanged(&self) -> bool {
        matches!(self, Datum::UnchangedToast)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub type_name: String,
    pub old: Option<Datum>,
    pub new: Option<Datum>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeOperation {
    Insert,
    Update,
    Delete,
}

impl fmt::Display for ChangeOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeOperation::Insert => f.write_str("INSERT"),
            ChangeOperation::Update => f.write_str("UPDATE"),
            ChangeOperation::Delete => f.write_str("DELETE"),
        }
    }
}

/// One row-level mutation.
///
/// Deletes only carry old values, inserts only new values, updates carry new
/// values plus old values for whatever the source sent as the old key.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeRecord {
    pub op: ChangeOperation,
    pub table: TableName,
    pub columns: Vec<Column>,
}

impl ChangeRecord {
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn has_old_values(&self) -> bool {
        self.columns.iter().any(|c| c.old.is_some())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Truncate {
    pub tables: Vec<TableName>,
    pub restart_identity: bool,
    pub cascade: bool,
}

/// Anything that mutates target rows, in the order it was decoded.
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    Row(ChangeRecord),
    Truncate(Truncate),
}

impl fmt::Display for Change {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Change::Row(record) => write!(f, "{} on {}", record.op, record.table),
            Change::Truncate(t) => {
                let names: Vec<String> = t.tables.iter().map(|t| t.to_string()).collect();
                write!(f, "TRUNCATE of {}", names.join(", "))
            }
        }
    }
}

/// Output of decoding one payload.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedMessage {
    Begin { xid: Option<u32> },
    Commit { xid: Option<u32>, lsn: Lsn },
    Change(Change),
    /// `pg_logical_emit_message` output; carries no row data.
    Message {
        transactional: bool,
        prefix: String,
        content: String,
    },
}

/// The changes of one source transaction, in source order.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeBatch {
    pub xid: Option<u32>,
    pub commit_lsn: Lsn,
    pub changes: Vec<Change>,
}

/// One row returned by the slot: its position, transaction and payload.
#[derive(Debug, Clone, PartialEq)]
pub struct RawChange {
    pub lsn: Lsn,
    pub xid: Option<u32>,
    pub data: String,
}

impl RawChange {
    pub fn new(lsn: Lsn, xid: Option<u32>, data: impl Into<String>) -> Self {
        Self {
            lsn,
            xid,
            data: data.into(),
        }
    }

    pub fn is_commit(&self) -> bool {
        self.data == "COMMIT" || self.data.starts_with("COMMIT ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lsn_parse_and_format() {
        let lsn: Lsn = "16/B374D848".parse().unwrap();
        assert_eq!(lsn.0, 0x16_B374_D848);
        assert_eq!(lsn.to_string(), "16/B374D848");
        assert_eq!(Lsn(100).to_string(), "0/64");
    }

    #[test]
    fn test_lsn_ordering() {
        let a: Lsn = "0/FFFFFFFF".parse().unwrap();
        let b: Lsn = "1/0".parse().unwrap();
        assert!(a < b);
    }

    #[test]
    fn test_lsn_rejects_garbage() {
        assert!("1234".parse::<Lsn>().is_err());
        assert!("G/1".parse::<Lsn>().is_err());
        assert!("1/".parse::<Lsn>().is_err());
    }

    #[test]
    fn test_lsn_serde_as_string() {
        let json = serde_json::to_string(&Lsn(0x1_0000_0010)).unwrap();
        assert_eq!(json, "\"1/10\"");
        let back: Lsn = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Lsn(0x1_0000_0010));
    }

    #[test]
    fn test_quoted_table_name() {
        let name = TableName::new("public", "we\"ird");
        assert_eq!(name.quoted(), "\"public\".\"we\"\"ird\"");
    }
}
