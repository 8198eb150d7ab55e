//! Translation of decoded changes into keyed target mutations.
//!
//! Every mutation that can be keyed on the table's identity columns is, so
//! replaying a transaction leaves the target unchanged.

use crate::postgres::{Change, ChangeOperation, ChangeRecord, Column, Datum, TableName, Truncate};

/// A column value in the text form it is bound with; `None` is SQL NULL.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnValue {
    pub name: String,
    pub type_name: String,
    pub value: Option<String>,
}

impl ColumnValue {
    fn from_datum(column: &Column, datum: &Datum) -> Self {
        Self {
            name: column.name.clone(),
            type_name: column.type_name.clone(),
            value: datum.to_sql_text(),
        }
    }
}

/// A single statement against the target.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    Insert {
        table: TableName,
        values: Vec<ColumnValue>,
    },
    /// Insert, or overwrite the row whose `key` columns match.
    Upsert {
        table: TableName,
        key: Vec<String>,
        values: Vec<ColumnValue>,
    },
    /// Set `values` on the rows matching every `key` value.
    Update {
        table: TableName,
        key: Vec<ColumnValue>,
        values: Vec<ColumnValue>,
    },
    Delete {
        table: TableName,
        key: Vec<ColumnValue>,
    },
    /// Move the row at `old_key` to the identity carried in `values`.
    ///
    /// Runs as: drop any row already holding the new identity while the old
    /// row still exists, update the old row, then upsert `values` on `key`.
    /// Replaying it after it committed leaves the target unchanged.
    Rekey {
        table: TableName,
        old_key: Vec<ColumnValue>,
        key: Vec<String>,
        values: Vec<ColumnValue>,
    },
    Truncate(Truncate),
}

impl Mutation {
    pub fn kind(&self) -> &'static str {
        match self {
            Mutation::Insert { .. } => "insert",
            Mutation::Upsert { .. } => "upsert",
            Mutation::Update { .. } => "update",
            Mutation::Delete { .. } => "delete",
            Mutation::Rekey { .. } => "rekey",
            Mutation::Truncate(_) => "truncate",
        }
    }
}

/// Values of the `key` columns among `values`, in key order.
pub fn key_values(values: &[ColumnValue], key: &[String]) -> Vec<ColumnValue> {
    key.iter()
        .filter_map(|k| values.iter().find(|v| &v.name == k).cloned())
        .collect()
}

/// Plans the mutation for one change given the identity columns of its
/// table (empty when the table declares none).
///
/// Returns `Ok(None)` when the change leaves the row as it is, and an error
/// message when the row cannot be located on the target.
pub fn plan(change: &Change, identity: &[String]) -> Result<Option<Mutation>, String> {
    match change {
        Change::Truncate(truncate) => Ok(Some(Mutation::Truncate(truncate.clone()))),
        Change::Row(record) => match record.op {
            ChangeOperation::Insert => Ok(Some(plan_insert(record, identity))),
            ChangeOperation::Update => plan_update(record, identity),
            ChangeOperation::Delete => plan_delete(record, identity).map(Some),
        },
    }
}

fn plan_insert(record: &ChangeRecord, identity: &[String]) -> Mutation {
    let values = new_values(record);
    if !identity.is_empty() && key_present(&values, identity) {
        Mutation::Upsert {
            table: record.table.clone(),
            key: identity.to_vec(),
            values,
        }
    } else {
        Mutation::Insert {
            table: record.table.clone(),
            values,
        }
    }
}

fn plan_update(record: &ChangeRecord, identity: &[String]) -> Result<Option<Mutation>, String> {
    let values = new_values(record);
    if values.is_empty() {
        return Ok(None);
    }

    if !identity.is_empty() {
        if let Some(key) = old_identity(record, identity) {
            if key_present(&values, identity) && key_values(&values, identity) != key {
                return Ok(Some(Mutation::Rekey {
                    table: record.table.clone(),
                    old_key: key,
                    key: identity.to_vec(),
                    values,
                }));
            }
            return Ok(Some(Mutation::Update {
                table: record.table.clone(),
                key,
                values,
            }));
        }
        // Old key omitted: the key did not change, so the new tuple holds it.
        if key_present(&values, identity) {
            return Ok(Some(Mutation::Upsert {
                table: record.table.clone(),
                key: identity.to_vec(),
                values,
            }));
        }
        return Err(format!(
            "update carries no values for identity columns ({}) of {}",
            identity.join(", "),
            record.table
        ));
    }

    let key = old_values(record);
    if key.is_empty() {
        return Err(format!(
            "{} has no identity columns and the update carries no old values",
            record.table
        ));
    }
    Ok(Some(Mutation::Update {
        table: record.table.clone(),
        key,
        values,
    }))
}

fn plan_delete(record: &ChangeRecord, identity: &[String]) -> Result<Mutation, String> {
    let key = match old_identity(record, identity) {
        Some(key) if !identity.is_empty() => key,
        _ => old_values(record),
    };
    if key.is_empty() {
        return Err(format!("delete on {} carries no old values", record.table));
    }
    Ok(Mutation::Delete {
        table: record.table.clone(),
        key,
    })
}

/// New values, leaving out unchanged TOAST columns.
fn new_values(record: &ChangeRecord) -> Vec<ColumnValue> {
    record
        .columns
        .iter()
        .filter_map(|c| match &c.new {
            Some(datum) if !datum.is_unchanged() => Some(ColumnValue::from_datum(c, datum)),
            _ => None,
        })
        .collect()
}

fn old_values(record: &ChangeRecord) -> Vec<ColumnValue> {
    record
        .columns
        .iter()
        .filter_map(|c| match &c.old {
            Some(datum) if !datum.is_unchanged() => Some(ColumnValue::from_datum(c, datum)),
            _ => None,
        })
        .collect()
}

/// Old values of every identity column, in identity order.
fn old_identity(record: &ChangeRecord, identity: &[String]) -> Option<Vec<ColumnValue>> {
    identity
        .iter()
        .map(|name| {
            let column = record.column(name)?;
            match &column.old {
                Some(datum) if !datum.is_unchanged() => Some(ColumnValue::from_datum(column, datum)),
                _ => None,
            }
        })
        .collect()
}

fn key_present(values: &[ColumnValue], key: &[String]) -> bool {
    key.iter()
        .all(|k| values.iter().any(|v| &v.name == k && v.value.is_some()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn column(name: &str, old: Option<Datum>, new: Option<Datum>) -> Column {
        Column {
            name: name.to_string(),
            type_name: "integer".to_string(),
            old,
            new,
        }
    }

    fn num(n: i64) -> Option<Datum> {
        Some(Datum::Number(n.to_string()))
    }

    fn record(op: ChangeOperation, columns: Vec<Column>) -> Change {
        Change::Row(ChangeRecord {
            op,
            table: TableName::new("public", "accounts"),
            columns,
        })
    }

    fn id() -> Vec<String> {
        vec!["id".to_string()]
    }

    #[test]
    fn test_insert_with_identity_is_upsert() {
        let change = record(
            ChangeOperation::Insert,
            vec![column("id", None, num(1)), column("balance", None, num(10))],
        );
        let mutation = plan(&change, &id()).unwrap().unwrap();
        assert_eq!(mutation.kind(), "upsert");
        if let Mutation::Upsert { key, values, .. } = mutation {
            assert_eq!(key, id());
            assert_eq!(values[1].value.as_deref(), Some("10"));
        }
    }

    #[test]
    fn test_insert_without_identity_is_plain_insert() {
        let change = record(ChangeOperation::Insert, vec![column("id", None, num(1))]);
        assert_eq!(plan(&change, &[]).unwrap().unwrap().kind(), "insert");
    }

    #[test]
    fn test_insert_with_null_key_is_plain_insert() {
        let change = record(
            ChangeOperation::Insert,
            vec![column("id", None, Some(Datum::Null))],
        );
        assert_eq!(plan(&change, &id()).unwrap().unwrap().kind(), "insert");
    }

    #[test]
    fn test_update_uses_old_key_when_present() {
        // Replica identity full: the old key is sent although it is unchanged.
        let change = record(
            ChangeOperation::Update,
            vec![column("id", num(1), num(1)), column("balance", num(4), num(5))],
        );
        match plan(&change, &id()).unwrap().unwrap() {
            Mutation::Update { key, values, .. } => {
                assert_eq!(key.len(), 1);
                assert_eq!(key[0].value.as_deref(), Some("1"));
                assert_eq!(values[1].value.as_deref(), Some("5"));
            }
            other => panic!("expected update, got {:?}", other),
        }
    }

    #[test]
    fn test_key_change_is_rekey() {
        let change = record(
            ChangeOperation::Update,
            vec![column("id", num(1), num(2)), column("balance", None, num(5))],
        );
        match plan(&change, &id()).unwrap().unwrap() {
            Mutation::Rekey {
                old_key,
                key,
                values,
                ..
            } => {
                assert_eq!(old_key[0].value.as_deref(), Some("1"));
                assert_eq!(key, id());
                assert_eq!(key_values(&values, &key)[0].value.as_deref(), Some("2"));
            }
            other => panic!("expected rekey, got {:?}", other),
        }
    }

    #[test]
    fn test_key_change_without_new_key_is_update() {
        let change = record(
            ChangeOperation::Update,
            vec![
                column("id", num(1), Some(Datum::UnchangedToast)),
                column("balance", None, num(5)),
            ],
        );
        assert_eq!(plan(&change, &id()).unwrap().unwrap().kind(), "update");
    }

    #[test]
    fn test_update_without_old_key_upserts_by_new_key() {
        let change = record(
            ChangeOperation::Update,
            vec![column("id", None, num(1)), column("balance", None, num(5))],
        );
        assert_eq!(plan(&change, &id()).unwrap().unwrap().kind(), "upsert");
    }

    #[test]
    fn test_update_skips_unchanged_toast() {
        let change = record(
            ChangeOperation::Update,
            vec![
                column("id", None, num(1)),
                column("doc", None, Some(Datum::UnchangedToast)),
            ],
        );
        match plan(&change, &id()).unwrap().unwrap() {
            Mutation::Upsert { values, .. } => {
                assert_eq!(values.len(), 1);
                assert_eq!(values[0].name, "id");
            }
            other => panic!("expected upsert, got {:?}", other),
        }
    }

    #[test]
    fn test_update_of_only_toast_columns_is_noop() {
        let change = record(
            ChangeOperation::Update,
            vec![column("doc", None, Some(Datum::UnchangedToast))],
        );
        assert_eq!(plan(&change, &id()).unwrap(), None);
    }

    #[test]
    fn test_update_without_identity_matches_old_tuple() {
        let change = record(
            ChangeOperation::Update,
            vec![column("a", num(1), num(2)), column("b", num(3), num(3))],
        );
        match plan(&change, &[]).unwrap().unwrap() {
            Mutation::Update { key, .. } => assert_eq!(key.len(), 2),
            other => panic!("expected update, got {:?}", other),
        }
    }

    #[test]
    fn test_update_without_any_key_is_error() {
        let change = record(ChangeOperation::Update, vec![column("a", None, num(2))]);
        let err = plan(&change, &[]).unwrap_err();
        assert!(err.contains("no old values"));

        let err = plan(&change, &id()).unwrap_err();
        assert!(err.contains("identity columns (id)"));
    }

    #[test]
    fn test_delete_by_old_identity() {
        let change = record(
            ChangeOperation::Delete,
            vec![column("id", num(7), None), column("balance", num(1), None)],
        );
        match plan(&change, &id()).unwrap().unwrap() {
            Mutation::Delete { key, .. } => {
                assert_eq!(key.len(), 1);
                assert_eq!(key[0].name, "id");
            }
            other => panic!("expected delete, got {:?}", other),
        }
    }

    #[test]
    fn test_delete_falls_back_to_old_tuple() {
        let change = record(ChangeOperation::Delete, vec![column("other", num(7), None)]);
        match plan(&change, &id()).unwrap().unwrap() {
            Mutation::Delete { key, .. } => assert_eq!(key[0].name, "other"),
            other => panic!("expected delete, got {:?}", other),
        }
    }

    #[test]
    fn test_delete_without_old_values_is_error() {
        let change = record(ChangeOperation::Delete, vec![]);
        assert!(plan(&change, &id()).is_err());
    }
}
