//! Builders for `test_decoding` slot rows, used by tests and local runs with
//! the in-memory source.
//!
//! Nothing on the replication path uses this module. It stays public because
//! the integration tests under `tests/` link the library without `cfg(test)`.

use super::types::{Lsn, RawChange};

/// Builds a stream of slot rows with increasing LSNs.
///
/// ```rust
/// use pg_cdc::postgres::test_utils::SlotStreamBuilder;
///
/// let rows = SlotStreamBuilder::new(100)
///     .begin(7)
///     .insert("public.users", &[("id", "integer", "1"), ("name", "text", "'ann'")])
///     .commit()
///     .build();
/// assert_eq!(rows.len(), 3);
/// assert_eq!(rows[2].data, "COMMIT 7");
/// ```
pub struct SlotStreamBuilder {
    next_lsn: u64,
    xid: Option<u32>,
    rows: Vec<RawChange>,
}

impl SlotStreamBuilder {
    pub fn new(start_lsn: u64) -> Self {
        Self {
            next_lsn: start_lsn,
            xid: None,
            rows: Vec::new(),
        }
    }

    /// Next row is placed at exactly `lsn`.
    pub fn at(mut self, lsn: u64) -> Self {
        self.next_lsn = lsn;
        self
    }

    pub fn begin(mut self, xid: u32) -> Self {
        self.xid = Some(xid);
        self.push(format!("BEGIN {}", xid))
    }

    pub fn insert(self, table: &str, columns: &[(&str, &str, &str)]) -> Self {
        let line = format!("table {}: INSERT:{}", table, tuple(columns));
        self.push(line)
    }

    pub fn update(self, table: &str, columns: &[(&str, &str, &str)]) -> Self {
        let line = format!("table {}: UPDATE:{}", table, tuple(columns));
        self.push(line)
    }

    pub fn update_key(
        self,
        table: &str,
        old_key: &[(&str, &str, &str)],
        columns: &[(&str, &str, &str)],
    ) -> Self {
        let line = format!(
            "table {}: UPDATE: old-key:{} new-tuple:{}",
            table,
            tuple(old_key),
            tuple(columns)
        );
        self.push(line)
    }

    pub fn delete(self, table: &str, key: &[(&str, &str, &str)]) -> Self {
        let line = format!("table {}: DELETE:{}", table, tuple(key));
        self.push(line)
    }

    pub fn raw(self, line: &str) -> Self {
        self.push(line.to_string())
    }

    pub fn commit(mut self) -> Self {
        let xid = self.xid.take();
        let line = match xid {
            Some(xid) => format!("COMMIT {}", xid),
            None => "COMMIT".to_string(),
        };
        let lsn = self.next_lsn;
        self.rows.push(RawChange::new(Lsn(lsn), xid, line));
        self.next_lsn += 1;
        self
    }

    pub fn build(self) -> Vec<RawChange> {
        self.rows
    }

    fn push(mut self, line: String) -> Self {
        let lsn = self.next_lsn;
        self.rows.push(RawChange::new(Lsn(lsn), self.xid, line));
        self.next_lsn += 1;
        self
    }
}

/// ` name[type]:value` entries; values are passed through verbatim so callers
/// quote text themselves.
fn tuple(columns: &[(&str, &str, &str)]) -> String {
    columns
        .iter()
        .map(|(name, type_name, value)| format!(" {}[{}]:{}", name, type_name, value))
        .collect()
}
