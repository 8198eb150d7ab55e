#[cfg(test)]
mod tests {
    use super::super::decoder::*;
    use super::super::types::*;

    fn decode(line: &str) -> DecodedMessage {
        TestDecodingDecoder::new()
            .decode(&RawChange::new(Lsn(0x10), Some(99), line))
            .unwrap_or_else(|e| panic!("failed to decode {:?}: {}", line, e))
    }

    fn decode_err(line: &str) -> crate::error::DecodeError {
        match TestDecodingDecoder::new().decode(&RawChange::new(Lsn(0x10), None, line)) {
            Ok(msg) => panic!("expected decode error for {:?}, got {:?}", line, msg),
            Err(e) => e,
        }
    }

    fn record(msg: DecodedMessage) -> ChangeRecord {
        match msg {
            DecodedMessage::Change(Change::Row(record)) => record,
            other => panic!("Expected row change, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_begin_message() {
        assert_eq!(decode("BEGIN 529"), DecodedMessage::Begin { xid: Some(529) });
    }

    #[test]
    fn test_begin_without_xid_uses_row_xid() {
        assert_eq!(decode("BEGIN"), DecodedMessage::Begin { xid: Some(99) });
    }

    #[test]
    fn test_decode_commit_message() {
        assert_eq!(
            decode("COMMIT 529"),
            DecodedMessage::Commit {
                xid: Some(529),
                lsn: Lsn(0x10)
            }
        );
    }

    #[test]
    fn test_decode_commit_with_timestamp() {
        assert_eq!(
            decode("COMMIT 530 (at 2024-05-01 10:00:00.123456+00)"),
            DecodedMessage::Commit {
                xid: Some(530),
                lsn: Lsn(0x10)
            }
        );
    }

    #[test]
    fn test_decode_insert_message() {
        let record = record(decode(
            "table public.users: INSERT: id[integer]:42 name[text]:'John Doe' active[boolean]:true",
        ));

        assert_eq!(record.op, ChangeOperation::Insert);
        assert_eq!(record.table, TableName::new("public", "users"));
        assert_eq!(record.columns.len(), 3);

        let id = record.column("id").unwrap();
        assert_eq!(id.type_name, "integer");
        assert_eq!(id.new, Some(Datum::Number("42".into())));
        assert_eq!(id.old, None);
        assert_eq!(
            record.column("name").unwrap().new,
            Some(Datum::Text("John Doe".into()))
        );
        assert_eq!(record.column("active").unwrap().new, Some(Datum::Bool(true)));
    }

    #[test]
    fn test_insert_keeps_column_order() {
        let record = record(decode(
            "table public.t: INSERT: c[integer]:3 a[integer]:1 b[integer]:2",
        ));
        let names: Vec<&str> = record.columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["c", "a", "b"]);
    }

    #[test]
    fn test_decode_update_without_old_key() {
        let record = record(decode(
            "table public.contacts: UPDATE: id[integer]:10 email[character varying]:'new@example.com'",
        ));

        assert_eq!(record.op, ChangeOperation::Update);
        assert!(!record.has_old_values());
        let email = record.column("email").unwrap();
        assert_eq!(email.type_name, "character varying");
        assert_eq!(email.new, Some(Datum::Text("new@example.com".into())));
    }

    #[test]
    fn test_decode_update_with_old_key() {
        let record = record(decode(
            "table public.contacts: UPDATE: old-key: id[integer]:10 new-tuple: id[integer]:11 name[text]:'New Name'",
        ));

        let id = record.column("id").unwrap();
        assert_eq!(id.old, Some(Datum::Number("10".into())));
        assert_eq!(id.new, Some(Datum::Number("11".into())));
        let name = record.column("name").unwrap();
        assert_eq!(name.old, None);
        assert_eq!(name.new, Some(Datum::Text("New Name".into())));
    }

    #[test]
    fn test_old_only_columns_are_appended() {
        let record = record(decode(
            "table public.t: UPDATE: old-key: a[integer]:1 b[integer]:2 new-tuple: b[integer]:3",
        ));
        let names: Vec<&str> = record.columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["b", "a"]);
        assert_eq!(record.column("a").unwrap().new, None);
    }

    #[test]
    fn test_decode_delete_message() {
        let record = record(decode("table public.users: DELETE: id[integer]:2"));

        assert_eq!(record.op, ChangeOperation::Delete);
        let id = record.column("id").unwrap();
        assert_eq!(id.old, Some(Datum::Number("2".into())));
        assert_eq!(id.new, None);
    }

    #[test]
    fn test_no_tuple_data() {
        let record = record(decode("table public.logs: DELETE: (no-tuple data)"));
        assert_eq!(record.op, ChangeOperation::Delete);
        assert!(record.columns.is_empty());
    }

    #[test]
    fn test_escaped_quotes_in_text() {
        let record = record(decode(
            "table public.users: INSERT: id[integer]:1 name[text]:'O''Brien says ''hi'''",
        ));
        assert_eq!(
            record.column("name").unwrap().new,
            Some(Datum::Text("O'Brien says 'hi'".into()))
        );
    }

    #[test]
    fn test_text_that_looks_like_grammar() {
        // Values containing delimiters and keywords must not confuse the tokenizer.
        let record = record(decode(
            "table public.notes: UPDATE: old-key: id[integer]:1 new-tuple: id[integer]:1 body[text]:'x new-tuple: y[int]:2 table public.z: DELETE:'",
        ));
        assert_eq!(record.columns.len(), 2);
        assert_eq!(
            record.column("body").unwrap().new,
            Some(Datum::Text("x new-tuple: y[int]:2 table public.z: DELETE:".into()))
        );
    }

    #[test]
    fn test_quoted_identifiers() {
        let record = record(decode(
            "table \"My Schema\".\"Order \"\"Items\"\"\": INSERT: \"Line No\"[integer]:1",
        ));
        assert_eq!(record.table, TableName::new("My Schema", "Order \"Items\""));
        assert_eq!(record.columns[0].name, "Line No");
    }

    #[test]
    fn test_binary_and_bit_values() {
        let record = record(decode(
            "table public.blobs: INSERT: id[integer]:1 data[bytea]:'\\x0001ff' flags[bit varying]:B'1010'",
        ));
        assert_eq!(
            record.column("data").unwrap().new,
            Some(Datum::Text("\\x0001ff".into()))
        );
        assert_eq!(
            record.column("flags").unwrap().new,
            Some(Datum::Bits("1010".into()))
        );
    }

    #[test]
    fn test_null_unchanged_toast_and_special_numbers() {
        let record = record(decode(
            "table public.m: UPDATE: id[bigint]:-7 doc[jsonb]:unchanged-toast-datum note[text]:null ratio[double precision]:-Infinity n[numeric]:NaN",
        ));
        assert_eq!(record.column("id").unwrap().new, Some(Datum::Number("-7".into())));
        assert_eq!(record.column("doc").unwrap().new, Some(Datum::UnchangedToast));
        assert_eq!(record.column("note").unwrap().new, Some(Datum::Null));
        assert_eq!(
            record.column("ratio").unwrap().new,
            Some(Datum::Number("-Infinity".into()))
        );
        assert_eq!(record.column("n").unwrap().new, Some(Datum::Number("NaN".into())));
    }

    #[test]
    fn test_array_and_timestamp_types() {
        let record = record(decode(
            "table public.ev: INSERT: tags[text[]]:'{a,b}' at[timestamp with time zone]:'2024-01-01 00:00:00+00'",
        ));
        let tags = record.column("tags").unwrap();
        assert_eq!(tags.type_name, "text[]");
        assert_eq!(tags.new, Some(Datum::Text("{a,b}".into())));
        assert_eq!(
            record.column("at").unwrap().type_name,
            "timestamp with time zone"
        );
    }

    #[test]
    fn test_decode_truncate() {
        match decode("table public.a, public.b: TRUNCATE: restart_seqs cascade") {
            DecodedMessage::Change(Change::Truncate(t)) => {
                assert_eq!(
                    t.tables,
                    vec![TableName::new("public", "a"), TableName::new("public", "b")]
                );
                assert!(t.restart_identity);
                assert!(t.cascade);
            }
            other => panic!("Expected truncate, got {:?}", other),
        }

        match decode("table public.a: TRUNCATE: (no-flags)") {
            DecodedMessage::Change(Change::Truncate(t)) => {
                assert!(!t.restart_identity);
                assert!(!t.cascade);
            }
            other => panic!("Expected truncate, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_logical_message() {
        assert_eq!(
            decode("message: transactional: 1 prefix: audit, sz: 5 content:hello"),
            DecodedMessage::Message {
                transactional: true,
                prefix: "audit".into(),
                content: "hello".into(),
            }
        );
    }

    #[test]
    fn test_unrecognized_statement() {
        let err = decode_err("INSERT INTO users VALUES (1)");
        assert_eq!(err.reason, "unrecognized statement");
        assert_eq!(err.lsn, Lsn(0x10));
        assert_eq!(err.payload, "INSERT INTO users VALUES (1)");
    }

    #[test]
    fn test_unknown_action() {
        let err = decode_err("table public.users: MERGE: id[integer]:1");
        assert!(err.reason.contains("MERGE"));
    }

    #[test]
    fn test_unrecognized_value_token_is_an_error() {
        let err = decode_err("table public.users: INSERT: id[integer]:1 name[text]:unquoted");
        assert!(err.reason.contains("unquoted"));
    }

    #[test]
    fn test_unterminated_string() {
        let err = decode_err("table public.users: INSERT: id[integer]:1 name[text]:'oops");
        assert!(err.reason.contains("unterminated"));
    }

    #[test]
    fn test_missing_type_brackets() {
        decode_err("table public.users: INSERT: id:1");
    }

    #[test]
    fn test_garbage_after_quoted_value() {
        decode_err("table public.users: INSERT: name[text]:'a'b");
    }

    #[test]
    fn test_truncate_with_unknown_flag() {
        decode_err("table public.a: TRUNCATE: only");
    }

    #[test]
    fn test_commit_with_trailing_garbage() {
        decode_err("COMMIT 5 extra");
    }

    #[test]
    fn test_message_size_mismatch() {
        decode_err("message: transactional: 0 prefix: p, sz: 10 content:short");
    }

    #[test]
    fn test_multiple_tables_for_row_change() {
        decode_err("table public.a, public.b: INSERT: id[integer]:1");
    }
}
