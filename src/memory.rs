//! In-memory source, target and checkpoint store.
//!
//! These implement the same traits as the PostgreSQL collaborators and are
//! meant for tests and local experiments. All state lives behind an
//! `Arc<Mutex<..>>`, so clones share it and can be inspected while a
//! [`crate::Replicator`] owns the originals.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::apply::mutation::key_values;
use crate::apply::{ColumnValue, Mutation, Target};
use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::error::CheckpointError;
use crate::postgres::{Lsn, RawChange, TableName};
use crate::replicator::ChangeSource;
use crate::shutdown::ShutdownTx;
use crate::{Error, Result};

/// A stored row: column name to text value, `None` for NULL.
pub type Row = BTreeMap<String, Option<String>>;

#[derive(Debug, Clone, Default)]
struct Table {
    identity: Vec<String>,
    rows: Vec<Row>,
}

#[derive(Debug, Default)]
struct TargetInner {
    tables: HashMap<TableName, Table>,
    /// Working copy of `tables` while a transaction is open.
    pending: Option<HashMap<TableName, Table>>,
    checkpoint: Option<Checkpoint>,
    staged_checkpoint: Option<Checkpoint>,
    checkpoint_history: Vec<Lsn>,
    fail_execute_in: Option<usize>,
    fail_checkpoint: bool,
    executed: usize,
    commits: usize,
    rollbacks: usize,
}

/// Transactional in-memory target.
///
/// Tables must be created up front with their identity columns. Statements
/// run against a copy of the tables that replaces them on commit.
#[derive(Debug, Clone, Default)]
pub struct MemoryTarget {
    inner: Arc<Mutex<TargetInner>>,
}

impl MemoryTarget {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create_table(&self, table: TableName, identity: &[&str]) {
        let mut inner = self.inner.lock().await;
        inner.tables.insert(
            table,
            Table {
                identity: identity.iter().map(|c| c.to_string()).collect(),
                rows: Vec::new(),
            },
        );
    }

    /// Committed rows of `table`, in insertion order.
    pub async fn rows(&self, table: &TableName) -> Vec<Row> {
        let inner = self.inner.lock().await;
        inner
            .tables
            .get(table)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    /// Makes the `n`th statement executed from now on fail (1-based).
    pub async fn fail_execute_at(&self, n: usize) {
        self.inner.lock().await.fail_execute_in = Some(n);
    }

    /// Makes every checkpoint write through [`Self::checkpoint_store`] fail.
    pub async fn fail_checkpoint_writes(&self, fail: bool) {
        self.inner.lock().await.fail_checkpoint = fail;
    }

    /// A checkpoint store written inside this target's transactions.
    pub fn checkpoint_store(&self) -> MemoryCheckpointStore {
        MemoryCheckpointStore {
            backing: Backing::Target(self.inner.clone()),
        }
    }

    /// Checkpoint committed together with the data.
    pub async fn committed_checkpoint(&self) -> Option<Checkpoint> {
        self.inner.lock().await.checkpoint.clone()
    }

    /// Every committed checkpoint LSN, oldest first.
    pub async fn checkpoint_history(&self) -> Vec<Lsn> {
        self.inner.lock().await.checkpoint_history.clone()
    }

    pub async fn commits(&self) -> usize {
        self.inner.lock().await.commits
    }

    pub async fn rollbacks(&self) -> usize {
        self.inner.lock().await.rollbacks
    }

    pub async fn in_transaction(&self) -> bool {
        self.inner.lock().await.pending.is_some()
    }
}

impl Target for MemoryTarget {
    async fn identity_columns(&mut self, table: &TableName) -> Result<Vec<String>> {
        let inner = self.inner.lock().await;
        inner
            .tables
            .get(table)
            .map(|t| t.identity.clone())
            .ok_or_else(|| missing(table))
    }

    async fn begin(&mut self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.pending.is_some() {
            return Err(Error::Target("transaction already open".into()));
        }
        inner.pending = Some(inner.tables.clone());
        inner.staged_checkpoint = None;
        Ok(())
    }

    async fn execute(&mut self, mutation: &Mutation) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.executed += 1;
        if let Some(n) = inner.fail_execute_in {
            if n <= 1 {
                inner.fail_execute_in = None;
                return Err(Error::Target(format!(
                    "injected failure on {} #{}",
                    mutation.kind(),
                    inner.executed
                )));
            }
            inner.fail_execute_in = Some(n - 1);
        }

        let tables = inner
            .pending
            .as_mut()
            .ok_or_else(|| Error::Target("statement outside of a transaction".into()))?;
        execute_on(tables, mutation)
    }

    async fn commit(&mut self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let tables = inner
            .pending
            .take()
            .ok_or_else(|| Error::Target("commit without transaction".into()))?;
        inner.tables = tables;
        if let Some(checkpoint) = inner.staged_checkpoint.take() {
            inner.checkpoint_history.push(checkpoint.lsn);
            inner.checkpoint = Some(checkpoint);
        }
        inner.commits += 1;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.pending = None;
        inner.staged_checkpoint = None;
        inner.rollbacks += 1;
        Ok(())
    }
}

impl Table {
    fn update(&mut self, key: &[ColumnValue], values: &[ColumnValue]) {
        for row in self.rows.iter_mut().filter(|r| matches_key(r, key)) {
            row.extend(to_row(values));
        }
    }

    /// Rows must not share a non-null identity, as under a primary key.
    fn check_unique(&self, table: &TableName) -> Result<()> {
        if self.identity.is_empty() {
            return Ok(());
        }
        let mut seen = HashSet::new();
        for row in &self.rows {
            let key = row_key(row, &self.identity);
            if key.iter().all(Option::is_some) && !seen.insert(key) {
                return Err(Error::Target(format!(
                    "duplicate key value violates unique constraint on {}",
                    table
                )));
            }
        }
        Ok(())
    }
}

fn missing(table: &TableName) -> Error {
    Error::Target(format!("relation {} does not exist", table.quoted()))
}

fn execute_on(tables: &mut HashMap<TableName, Table>, mutation: &Mutation) -> Result<()> {
    match mutation {
        Mutation::Insert { table, values } => {
            let target = tables.get_mut(table).ok_or_else(|| missing(table))?;
            target.rows.push(to_row(values));
            target.check_unique(table)?;
        }
        Mutation::Upsert { table, key, values } => {
            let target = tables.get_mut(table).ok_or_else(|| missing(table))?;
            let row = to_row(values);
            let wanted = row_key(&row, key);
            match target.rows.iter_mut().find(|r| row_key(r, key) == wanted) {
                Some(existing) => existing.extend(row),
                None => target.rows.push(row),
            }
        }
        Mutation::Update { table, key, values } => {
            let target = tables.get_mut(table).ok_or_else(|| missing(table))?;
            target.update(key, values);
            target.check_unique(table)?;
        }
        Mutation::Delete { table, key } => {
            let target = tables.get_mut(table).ok_or_else(|| missing(table))?;
            target.rows.retain(|r| !matches_key(r, key));
        }
        Mutation::Rekey {
            table,
            old_key,
            key,
            values,
        } => {
            let target = tables.get_mut(table).ok_or_else(|| missing(table))?;
            if target.rows.iter().any(|r| matches_key(r, old_key)) {
                let new_key = key_values(values, key);
                target.rows.retain(|r| !matches_key(r, &new_key));
            }
            target.update(old_key, values);
            target.check_unique(table)?;
            execute_on(
                tables,
                &Mutation::Upsert {
                    table: table.clone(),
                    key: key.clone(),
                    values: values.clone(),
                },
            )?;
        }
        Mutation::Truncate(truncate) => {
            for table in &truncate.tables {
                tables.get_mut(table).ok_or_else(|| missing(table))?.rows.clear();
            }
        }
    }
    Ok(())
}

fn to_row(values: &[ColumnValue]) -> Row {
    values
        .iter()
        .map(|v| (v.name.clone(), v.value.clone()))
        .collect()
}

fn row_key(row: &Row, key: &[String]) -> Vec<Option<String>> {
    key.iter()
        .map(|k| row.get(k).cloned().flatten())
        .collect()
}

fn matches_key(row: &Row, key: &[ColumnValue]) -> bool {
    key.iter()
        .all(|k| row.get(&k.name).cloned().flatten() == k.value)
}

#[derive(Debug, Default)]
struct StoreInner {
    checkpoint: Option<Checkpoint>,
    history: Vec<Lsn>,
    fail_saves: bool,
}

#[derive(Debug, Clone)]
enum Backing {
    Standalone(Arc<Mutex<StoreInner>>),
    Target(Arc<Mutex<TargetInner>>),
}

/// In-memory checkpoint store, either standalone (saved after commit) or
/// part of a [`MemoryTarget`] (saved inside its transaction).
#[derive(Debug, Clone)]
pub struct MemoryCheckpointStore {
    backing: Backing,
}

impl Default for MemoryCheckpointStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self {
            backing: Backing::Standalone(Arc::new(Mutex::new(StoreInner::default()))),
        }
    }

    /// A standalone store that already holds `lsn`.
    pub fn with_checkpoint(lsn: Lsn) -> Self {
        let inner = StoreInner {
            checkpoint: Some(Checkpoint::new(lsn)),
            ..StoreInner::default()
        };
        Self {
            backing: Backing::Standalone(Arc::new(Mutex::new(inner))),
        }
    }

    pub async fn fail_saves(&self, fail: bool) {
        match &self.backing {
            Backing::Standalone(inner) => inner.lock().await.fail_saves = fail,
            Backing::Target(inner) => inner.lock().await.fail_checkpoint = fail,
        }
    }

    pub async fn current(&self) -> Option<Checkpoint> {
        match &self.backing {
            Backing::Standalone(inner) => inner.lock().await.checkpoint.clone(),
            Backing::Target(inner) => inner.lock().await.checkpoint.clone(),
        }
    }

    /// Every durably saved LSN, oldest first.
    pub async fn history(&self) -> Vec<Lsn> {
        match &self.backing {
            Backing::Standalone(inner) => inner.lock().await.history.clone(),
            Backing::Target(inner) => inner.lock().await.checkpoint_history.clone(),
        }
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&mut self) -> std::result::Result<Option<Checkpoint>, CheckpointError> {
        Ok(self.current().await)
    }

    async fn save(&mut self, checkpoint: &Checkpoint) -> std::result::Result<(), CheckpointError> {
        match &self.backing {
            Backing::Standalone(inner) => {
                let mut inner = inner.lock().await;
                if inner.fail_saves {
                    return Err(CheckpointError::new("injected checkpoint failure"));
                }
                inner.history.push(checkpoint.lsn);
                inner.checkpoint = Some(checkpoint.clone());
            }
            Backing::Target(inner) => {
                let mut inner = inner.lock().await;
                if inner.fail_checkpoint {
                    return Err(CheckpointError::new("injected checkpoint failure"));
                }
                if inner.pending.is_none() {
                    return Err(CheckpointError::new(
                        "checkpoint must be written inside the target transaction",
                    ));
                }
                inner.staged_checkpoint = Some(checkpoint.clone());
            }
        }
        Ok(())
    }

    fn joins_target_transaction(&self) -> bool {
        matches!(self.backing, Backing::Target(_))
    }
}

#[derive(Debug, Default)]
struct SourceInner {
    rows: Vec<RawChange>,
    acknowledged: Option<Lsn>,
    fetch_times: Vec<Instant>,
    fail_fetches: usize,
    shutdown_after: Option<(usize, ShutdownTx)>,
}

/// In-memory replication slot.
///
/// Fetches peek at pending rows without consuming them; acknowledging a
/// commit LSN drops every row up to that transaction's COMMIT.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    inner: Arc<Mutex<SourceInner>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push(&self, rows: impl IntoIterator<Item = RawChange>) {
        self.inner.lock().await.rows.extend(rows);
    }

    pub async fn pending(&self) -> Vec<RawChange> {
        self.inner.lock().await.rows.clone()
    }

    pub async fn acknowledged(&self) -> Option<Lsn> {
        self.inner.lock().await.acknowledged
    }

    /// When each fetch started.
    pub async fn fetch_times(&self) -> Vec<Instant> {
        self.inner.lock().await.fetch_times.clone()
    }

    /// Makes the next `n` fetches fail with a connection error.
    pub async fn fail_next_fetches(&self, n: usize) {
        self.inner.lock().await.fail_fetches = n;
    }

    /// Signals shutdown once the `n`th fetch has returned its rows.
    pub async fn shutdown_after_fetches(&self, n: usize, tx: ShutdownTx) {
        self.inner.lock().await.shutdown_after = Some((n, tx));
    }

    fn consume_through(inner: &mut SourceInner, lsn: Lsn) {
        let last_commit = inner
            .rows
            .iter()
            .rposition(|r| r.is_commit() && r.lsn <= lsn);
        if let Some(position) = last_commit {
            inner.rows.drain(..=position);
        }
        if inner.acknowledged.map_or(true, |a| a < lsn) {
            inner.acknowledged = Some(lsn);
        }
    }
}

impl ChangeSource for MemorySource {
    async fn resume_after(&mut self, lsn: Lsn) -> Result<()> {
        let mut inner = self.inner.lock().await;
        Self::consume_through(&mut inner, lsn);
        Ok(())
    }

    async fn fetch(&mut self, limit: usize) -> Result<Vec<RawChange>> {
        let mut inner = self.inner.lock().await;
        inner.fetch_times.push(Instant::now());
        let fetches = inner.fetch_times.len();

        if let Some((n, tx)) = &inner.shutdown_after {
            if fetches >= *n {
                let _ = tx.send(true);
            }
        }

        if inner.fail_fetches > 0 {
            inner.fail_fetches -= 1;
            return Err(Error::Connection("injected fetch failure".into()));
        }

        // Like the server, only stop at a transaction boundary.
        let mut end = 0;
        for (i, row) in inner.rows.iter().enumerate() {
            end = i + 1;
            if row.is_commit() && end >= limit {
                break;
            }
        }
        debug!(count = end, "Memory source fetch");
        Ok(inner.rows[..end].to_vec())
    }

    async fn acknowledge(&mut self, lsn: Lsn) -> Result<()> {
        let mut inner = self.inner.lock().await;
        Self::consume_through(&mut inner, lsn);
        Ok(())
    }
}
