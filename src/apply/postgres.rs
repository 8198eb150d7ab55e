//! Applies mutations to a PostgreSQL target.
//!
//! Values travel as text parameters and are cast back to the column type
//! decoded from the slot, e.g. `$1::text::integer`. This keeps statement
//! building independent of the Rust type of each column.
//!
//! The plugin prints type names without their modifiers, so `char(5)`
//! arrives as `character`, which PostgreSQL reads as `character(1)`. Such
//! names are cast to their unbounded form and the column's own type
//! coerces the value on assignment.

use std::borrow::Cow;
use tokio_postgres::types::ToSql;
use tracing::trace;

use super::mutation::{key_values, ColumnValue, Mutation};
use super::Target;
use crate::postgres::{quote_ident, SharedClient, TableName};
use crate::{Error, Result};

/// Columns of the primary key, or of the first unique index when there is
/// none. Partial and expression indexes cannot back `ON CONFLICT` and are
/// ignored.
const IDENTITY_QUERY: &str = "\
    SELECT a.attname::text \
    FROM pg_index i \
    CROSS JOIN LATERAL unnest(i.indkey::int2[]) WITH ORDINALITY AS k(attnum, ord) \
    JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = k.attnum \
    WHERE i.indexrelid = ( \
        SELECT ix.indexrelid FROM pg_index ix \
        WHERE ix.indrelid = $1::text::regclass \
          AND (ix.indisprimary OR ix.indisunique) \
          AND ix.indpred IS NULL AND ix.indexprs IS NULL \
        ORDER BY ix.indisprimary DESC, ix.indexrelid \
        LIMIT 1) \
    ORDER BY k.ord";

/// A SQL statement with its text parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<Option<String>>,
}

impl Statement {
    fn new() -> Self {
        Self {
            sql: String::new(),
            params: Vec::new(),
        }
    }

    /// Adds a parameter and returns its cast placeholder.
    fn bind(&mut self, value: &ColumnValue) -> std::result::Result<String, String> {
        check_type_name(&value.type_name)?;
        self.params.push(value.value.clone());
        Ok(format!(
            "${}::text::{}",
            self.params.len(),
            cast_type(&value.type_name)
        ))
    }

    /// `"col" = $n::text::type` joined by AND, with `IS NULL` for null keys.
    fn bind_key(&mut self, key: &[ColumnValue]) -> std::result::Result<String, String> {
        let mut conditions = Vec::with_capacity(key.len());
        for value in key {
            let column = quote_ident(&value.name);
            if value.value.is_none() {
                conditions.push(format!("{} IS NULL", column));
            } else {
                let placeholder = self.bind(value)?;
                conditions.push(format!("{} = {}", column, placeholder));
            }
        }
        Ok(conditions.join(" AND "))
    }
}

/// Builds the statements executing `mutation`, to be run in order.
pub fn build_statements(mutation: &Mutation) -> std::result::Result<Vec<Statement>, String> {
    let statements = match mutation {
        Mutation::Insert { table, values } => {
            let mut stmt = Statement::new();
            stmt.sql = insert_sql(&mut stmt, table, values)?;
            vec![stmt]
        }
        Mutation::Upsert { table, key, values } => vec![upsert_statement(table, key, values)?],
        Mutation::Update { table, key, values } => vec![update_statement(table, key, values)?],
        Mutation::Delete { table, key } => {
            let mut stmt = Statement::new();
            let condition = stmt.bind_key(key)?;
            stmt.sql = format!("DELETE FROM {} WHERE {}", table.quoted(), condition);
            vec![stmt]
        }
        Mutation::Rekey {
            table,
            old_key,
            key,
            values,
        } => {
            let mut clear = Statement::new();
            let new_condition = clear.bind_key(&key_values(values, key))?;
            let old_condition = clear.bind_key(old_key)?;
            clear.sql = format!(
                "DELETE FROM {t} WHERE {} AND EXISTS (SELECT 1 FROM {t} WHERE {})",
                new_condition,
                old_condition,
                t = table.quoted()
            );
            vec![
                clear,
                update_statement(table, old_key, values)?,
                upsert_statement(table, key, values)?,
            ]
        }
        Mutation::Truncate(truncate) => {
            let tables: Vec<String> = truncate.tables.iter().map(TableName::quoted).collect();
            let mut sql = format!("TRUNCATE {}", tables.join(", "));
            if truncate.restart_identity {
                sql.push_str(" RESTART IDENTITY");
            }
            if truncate.cascade {
                sql.push_str(" CASCADE");
            }
            vec![Statement {
                sql,
                params: Vec::new(),
            }]
        }
    };
    Ok(statements)
}

fn upsert_statement(
    table: &TableName,
    key: &[String],
    values: &[ColumnValue],
) -> std::result::Result<Statement, String> {
    let mut stmt = Statement::new();
    let insert = insert_sql(&mut stmt, table, values)?;
    let conflict: Vec<String> = key.iter().map(|k| quote_ident(k)).collect();
    let updates: Vec<String> = values
        .iter()
        .filter(|v| !key.contains(&v.name))
        .map(|v| {
            let column = quote_ident(&v.name);
            format!("{} = EXCLUDED.{}", column, column)
        })
        .collect();
    let action = if updates.is_empty() {
        "DO NOTHING".to_string()
    } else {
        format!("DO UPDATE SET {}", updates.join(", "))
    };
    stmt.sql = format!("{} ON CONFLICT ({}) {}", insert, conflict.join(", "), action);
    Ok(stmt)
}

fn update_statement(
    table: &TableName,
    key: &[ColumnValue],
    values: &[ColumnValue],
) -> std::result::Result<Statement, String> {
    let mut stmt = Statement::new();
    let mut assignments = Vec::with_capacity(values.len());
    for value in values {
        let placeholder = stmt.bind(value)?;
        assignments.push(format!("{} = {}", quote_ident(&value.name), placeholder));
    }
    let condition = stmt.bind_key(key)?;
    stmt.sql = format!(
        "UPDATE {} SET {} WHERE {}",
        table.quoted(),
        assignments.join(", "),
        condition
    );
    Ok(stmt)
}

fn insert_sql(
    stmt: &mut Statement,
    table: &TableName,
    values: &[ColumnValue],
) -> std::result::Result<String, String> {
    if values.is_empty() {
        return Ok(format!("INSERT INTO {} DEFAULT VALUES", table.quoted()));
    }
    let columns: Vec<String> = values.iter().map(|v| quote_ident(&v.name)).collect();
    let mut placeholders = Vec::with_capacity(values.len());
    for value in values {
        placeholders.push(stmt.bind(value)?);
    }
    Ok(format!(
        "INSERT INTO {} ({}) VALUES ({})",
        table.quoted(),
        columns.join(", "),
        placeholders.join(", ")
    ))
}

/// Cast target for a printed type name. Bare `character` and `bit` mean
/// length 1 in a cast, so they become `bpchar` and `varbit`, arrays
/// included.
fn cast_type(type_name: &str) -> Cow<'_, str> {
    let (base, dims) = match type_name.find('[') {
        Some(i) => type_name.split_at(i),
        None => (type_name, ""),
    };
    match base {
        "character" | "bpchar" => Cow::Owned(format!("bpchar{}", dims)),
        "bit" => Cow::Owned(format!("varbit{}", dims)),
        _ => Cow::Borrowed(type_name),
    }
}

/// Type names are spliced into SQL, so only the shapes the decoding plugin
/// prints are accepted: words, qualified or quoted names, `[]` suffixes and
/// numeric modifiers such as `numeric(10,2)`.
fn check_type_name(type_name: &str) -> std::result::Result<(), String> {
    let mut in_modifier = false;
    let mut in_quotes = false;
    let valid = !type_name.trim().is_empty()
        && type_name.chars().all(|c| {
            if in_quotes {
                if c == '"' {
                    in_quotes = false;
                }
                return c != '\0';
            }
            if in_modifier {
                if c == ')' {
                    in_modifier = false;
                    return true;
                }
                return c.is_ascii_digit() || c == ',' || c == ' ';
            }
            match c {
                '"' => {
                    in_quotes = true;
                    true
                }
                '(' => {
                    in_modifier = true;
                    true
                }
                c => c.is_alphanumeric() || matches!(c, '_' | ' ' | '.' | '[' | ']'),
            }
        })
        && !in_modifier
        && !in_quotes;

    if valid {
        Ok(())
    } else {
        Err(format!("unsupported column type name {:?}", type_name))
    }
}

/// Writes to PostgreSQL through a shared connection, so a
/// [`crate::checkpoint::PostgresCheckpointStore`] on the same client joins
/// the transaction opened here.
pub struct PostgresTarget {
    client: SharedClient,
}

impl PostgresTarget {
    pub fn new(client: SharedClient) -> Self {
        Self { client }
    }
}

impl Target for PostgresTarget {
    async fn identity_columns(&mut self, table: &TableName) -> Result<Vec<String>> {
        let name = table.quoted();
        let mut conn = self.client.lock().await;
        let rows = conn.client().await?.query(IDENTITY_QUERY, &[&name]).await?;
        Ok(rows.iter().map(|row| row.get(0)).collect())
    }

    async fn begin(&mut self) -> Result<()> {
        self.client.lock().await.begin().await
    }

    async fn execute(&mut self, mutation: &Mutation) -> Result<()> {
        let statements = build_statements(mutation).map_err(Error::Target)?;
        let mut conn = self.client.lock().await;
        let client = conn.client().await?;
        for stmt in &statements {
            trace!(sql = %stmt.sql, params = stmt.params.len(), "Executing {}", mutation.kind());
            let params: Vec<&(dyn ToSql + Sync)> = stmt
                .params
                .iter()
                .map(|p| p as &(dyn ToSql + Sync))
                .collect();
            client.execute(stmt.sql.as_str(), &params).await?;
        }
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        self.client.lock().await.commit().await
    }

    async fn rollback(&mut self) -> Result<()> {
        self.client.lock().await.rollback().await
    }
}
