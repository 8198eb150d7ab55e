//! Transactional application of change batches to the target.
//!
//! Each [`ChangeBatch`] runs in one target transaction. The checkpoint is
//! written in that same transaction when the store lives on the target, or
//! right after the commit otherwise; in both cases it only ever records
//! batches whose data committed.

pub mod mutation;
pub mod postgres;

use std::collections::HashMap;
use std::future::Future;
use tracing::{debug, error, info, warn};

use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::error::ApplyError;
use crate::postgres::{Change, ChangeBatch, Lsn, TableName};
use crate::{Error, Result};

pub use mutation::{plan, ColumnValue, Mutation};
pub use postgres::PostgresTarget;

/// A transactional store receiving replicated changes.
///
/// Calls arrive as `begin`, any number of `execute`, then exactly one of
/// `commit` or `rollback`. Implementations must make the effects of a
/// transaction visible all at once, or not at all.
pub trait Target {
    /// Identity columns of `table`: its primary key, else the columns of its
    /// first unique index, else empty.
    fn identity_columns(
        &mut self,
        table: &TableName,
    ) -> impl Future<Output = Result<Vec<String>>> + Send;

    fn begin(&mut self) -> impl Future<Output = Result<()>> + Send;

    fn execute(&mut self, mutation: &Mutation) -> impl Future<Output = Result<()>> + Send;

    fn commit(&mut self) -> impl Future<Output = Result<()>> + Send;

    fn rollback(&mut self) -> impl Future<Output = Result<()>> + Send;
}

/// Result of offering a batch to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The batch committed and the checkpoint now points at its commit LSN.
    Applied { changes: usize },
    /// The batch was at or before the checkpoint and left untouched.
    Skipped,
}

pub struct ApplyEngine<T, C> {
    target: T,
    checkpoints: C,
    last_applied: Option<Lsn>,
    identity: HashMap<TableName, Vec<String>>,
}

impl<T, C> ApplyEngine<T, C>
where
    T: Target + Send,
    C: CheckpointStore + Send,
{
    pub fn new(target: T, checkpoints: C) -> Self {
        Self {
            target,
            checkpoints,
            last_applied: None,
            identity: HashMap::new(),
        }
    }

    /// Reads the stored checkpoint; called once before the first batch.
    pub async fn load_checkpoint(&mut self) -> Result<Option<Lsn>> {
        let checkpoint = self.checkpoints.load().await?;
        self.last_applied = checkpoint.map(|c| c.lsn);
        Ok(self.last_applied)
    }

    pub fn last_applied(&self) -> Option<Lsn> {
        self.last_applied
    }

    pub fn is_applied(&self, batch: &ChangeBatch) -> bool {
        self.last_applied.is_some_and(|lsn| batch.commit_lsn <= lsn)
    }

    pub fn target(&self) -> &T {
        &self.target
    }

    /// Applies `batch` atomically and advances the checkpoint to its commit
    /// LSN. Nothing is persisted when an error is returned.
    pub async fn apply(&mut self, batch: &ChangeBatch) -> Result<ApplyOutcome> {
        if self.is_applied(batch) {
            debug!(xid = ?batch.xid, lsn = %batch.commit_lsn, "Skipping already applied transaction");
            return Ok(ApplyOutcome::Skipped);
        }

        self.target.begin().await?;

        let result = self.apply_in_transaction(batch).await;
        if let Err(e) = result {
            self.abort(batch).await;
            return Err(e);
        }

        if let Err(e) = self.target.commit().await {
            self.identity.clear();
            return Err(e);
        }

        if !self.checkpoints.joins_target_transaction() {
            // Data is committed; losing this write only means the batch is
            // replayed after a restart.
            self.checkpoints
                .save(&Checkpoint::new(batch.commit_lsn))
                .await?;
        }

        self.last_applied = Some(batch.commit_lsn);
        info!(
            xid = ?batch.xid,
            lsn = %batch.commit_lsn,
            changes = batch.changes.len(),
            "Applied transaction"
        );
        Ok(ApplyOutcome::Applied {
            changes: batch.changes.len(),
        })
    }

    async fn apply_in_transaction(&mut self, batch: &ChangeBatch) -> Result<()> {
        for (position, change) in batch.changes.iter().enumerate() {
            self.apply_change(change).await.map_err(|message| {
                Error::Apply(ApplyError {
                    xid: batch.xid,
                    commit_lsn: batch.commit_lsn,
                    position: Some(position),
                    change: Some(Box::new(change.clone())),
                    message,
                })
            })?;
        }

        if self.checkpoints.joins_target_transaction() {
            self.checkpoints
                .save(&Checkpoint::new(batch.commit_lsn))
                .await?;
        }
        Ok(())
    }

    async fn apply_change(&mut self, change: &Change) -> std::result::Result<(), String> {
        let identity = match change {
            Change::Row(record) => self
                .identity_columns(&record.table)
                .await
                .map_err(|e| format!("cannot look up identity of {}: {}", record.table, e))?,
            Change::Truncate(_) => Vec::new(),
        };

        match plan(change, &identity)? {
            Some(mutation) => {
                debug!(change = %change, kind = mutation.kind(), "Applying change");
                self.target
                    .execute(&mutation)
                    .await
                    .map_err(|e| e.to_string())
            }
            None => {
                debug!(change = %change, "Change leaves the row unchanged");
                Ok(())
            }
        }
    }

    async fn identity_columns(&mut self, table: &TableName) -> Result<Vec<String>> {
        if let Some(columns) = self.identity.get(table) {
            return Ok(columns.clone());
        }
        let columns = self.target.identity_columns(table).await?;
        if columns.is_empty() {
            warn!(table = %table, "Table has no primary key or unique index, matching on old values");
        }
        self.identity.insert(table.clone(), columns.clone());
        Ok(columns)
    }

    async fn abort(&mut self, batch: &ChangeBatch) {
        // Schema may have changed under us.
        self.identity.clear();
        if let Err(e) = self.target.rollback().await {
            error!(xid = ?batch.xid, lsn = %batch.commit_lsn, "Rollback failed: {}", e);
        }
    }
}
