//! Durable replication progress.
//!
//! A [`Checkpoint`] records the commit LSN of the last source transaction
//! applied to the target. It is read once at startup to position the slot
//! and written only after a batch has been applied.
//!
//! Two stores are provided:
//!
//! - [`PostgresCheckpointStore`] keeps one row per slot in a table on the
//!   target and is written inside the batch's own target transaction, so
//!   data and progress commit together.
//! - [`FileCheckpointStore`] keeps a JSON file, replaced atomically right
//!   after the target commit.
//!
//! # Example
//!
//! ```rust,no_run
//! use pg_cdc::checkpoint::{Checkpoint, CheckpointStore, FileCheckpointStore};
//! use pg_cdc::postgres::Lsn;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut store = FileCheckpointStore::new("checkpoint.json");
//!
//!     if let Some(checkpoint) = store.load().await? {
//!         println!("Resuming after LSN: {}", checkpoint.lsn);
//!     }
//!
//!     store.save(&Checkpoint::new(Lsn(0x1234_5678))).await?;
//!     Ok(())
//! }
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::error::CheckpointError;
use crate::postgres::{Lsn, SharedClient, TableName};

/// The last successfully applied source position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Commit LSN of the last applied transaction
    pub lsn: Lsn,
    /// When this checkpoint was written
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    /// Creates a checkpoint stamped with the current time.
    ///
    /// ```rust
    /// use pg_cdc::checkpoint::Checkpoint;
    /// use pg_cdc::postgres::Lsn;
    ///
    /// let checkpoint = Checkpoint::new("16/B374D848".parse::<Lsn>().unwrap());
    /// assert_eq!(checkpoint.lsn.to_string(), "16/B374D848");
    /// ```
    pub fn new(lsn: Lsn) -> Self {
        Self {
            lsn,
            updated_at: Utc::now(),
        }
    }
}

/// Durable storage for the replication position.
pub trait CheckpointStore {
    /// Returns the stored checkpoint, or `None` on first run.
    fn load(&mut self) -> impl Future<Output = Result<Option<Checkpoint>, CheckpointError>> + Send;

    /// Persists `checkpoint`; must never be observable as a partial write.
    fn save(
        &mut self,
        checkpoint: &Checkpoint,
    ) -> impl Future<Output = Result<(), CheckpointError>> + Send;

    /// `true` when [`save`](Self::save) runs on the target's connection and
    /// must therefore be called inside the batch's target transaction.
    fn joins_target_transaction(&self) -> bool;
}

/// Stores the checkpoint as a JSON file.
///
/// Writes go to a temporary file which is synced and then renamed over the
/// checkpoint, so a crash leaves either the old or the new checkpoint.
pub struct FileCheckpointStore {
    file_path: PathBuf,
}

impl FileCheckpointStore {
    /// Creates a store backed by `checkpoint_path`.
    ///
    /// ```rust
    /// use pg_cdc::checkpoint::FileCheckpointStore;
    ///
    /// let store = FileCheckpointStore::new("checkpoint.json");
    /// assert!(store.path().ends_with("checkpoint.json"));
    /// ```
    pub fn new(checkpoint_path: impl AsRef<Path>) -> Self {
        Self {
            file_path: checkpoint_path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.file_path
    }
}

impl CheckpointStore for FileCheckpointStore {
    async fn load(&mut self) -> Result<Option<Checkpoint>, CheckpointError> {
        let content = match fs::read_to_string(&self.file_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No checkpoint file found at {:?}", self.file_path);
                return Ok(None);
            }
            Err(e) => {
                return Err(CheckpointError::with_source(
                    format!("cannot read {:?}", self.file_path),
                    e,
                ))
            }
        };

        let checkpoint: Checkpoint = serde_json::from_str(&content).map_err(|e| {
            CheckpointError::with_source(format!("invalid checkpoint file {:?}", self.file_path), e)
        })?;
        info!(
            "Loaded checkpoint: LSN={}, updated_at={}",
            checkpoint.lsn, checkpoint.updated_at
        );
        Ok(Some(checkpoint))
    }

    async fn save(&mut self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        debug!("Saving checkpoint: LSN={}", checkpoint.lsn);
        let fail = |what: &str, e: std::io::Error| {
            CheckpointError::with_source(format!("cannot {} {:?}", what, self.file_path), e)
        };

        let temp_path = self.file_path.with_extension("tmp");
        let json = serde_json::to_string_pretty(checkpoint)
            .map_err(|e| CheckpointError::with_source("cannot serialize checkpoint", e))?;

        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|e| fail("create temporary file for", e))?;
        file.write_all(json.as_bytes())
            .await
            .map_err(|e| fail("write", e))?;
        file.sync_all().await.map_err(|e| fail("sync", e))?;
        drop(file);

        fs::rename(&temp_path, &self.file_path)
            .await
            .map_err(|e| fail("rename temporary file onto", e))?;

        // Persist the rename itself.
        #[cfg(unix)]
        if let Some(dir) = self.file_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            let dir = fs::File::open(dir).await.map_err(|e| fail("open directory of", e))?;
            dir.sync_all().await.map_err(|e| fail("sync directory of", e))?;
        }

        debug!("Checkpoint saved successfully");
        Ok(())
    }

    fn joins_target_transaction(&self) -> bool {
        false
    }
}

/// Stores one checkpoint row per replication slot in a table on the target.
pub struct PostgresCheckpointStore {
    client: SharedClient,
    table: TableName,
    slot_name: String,
}

impl PostgresCheckpointStore {
    pub fn new(client: SharedClient, table: TableName, slot_name: impl Into<String>) -> Self {
        Self {
            client,
            table,
            slot_name: slot_name.into(),
        }
    }

    /// Creates the checkpoint table if it does not exist.
    pub async fn ensure_table(&self) -> Result<(), CheckpointError> {
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {} (\
                slot_name text PRIMARY KEY, \
                lsn pg_lsn NOT NULL, \
                updated_at timestamptz NOT NULL)",
            self.table.quoted()
        );
        let mut conn = self.client.lock().await;
        let client = conn
            .client()
            .await
            .map_err(|e| CheckpointError::with_source("cannot reach target", e))?;
        client
            .batch_execute(&ddl)
            .await
            .map_err(|e| CheckpointError::with_source(format!("cannot create {}", self.table), e))?;
        Ok(())
    }

    fn upsert_sql(&self) -> String {
        // Never move the stored position backwards.
        format!(
            "INSERT INTO {} AS cp (slot_name, lsn, updated_at) \
             VALUES ($1, $2::text::pg_lsn, $3) \
             ON CONFLICT (slot_name) DO UPDATE \
             SET lsn = EXCLUDED.lsn, updated_at = EXCLUDED.updated_at \
             WHERE cp.lsn <= EXCLUDED.lsn",
            self.table.quoted()
        )
    }
}

impl CheckpointStore for PostgresCheckpointStore {
    async fn load(&mut self) -> Result<Option<Checkpoint>, CheckpointError> {
        let sql = format!(
            "SELECT lsn::text, updated_at FROM {} WHERE slot_name = $1",
            self.table.quoted()
        );
        let mut conn = self.client.lock().await;
        let client = conn
            .client()
            .await
            .map_err(|e| CheckpointError::with_source("cannot reach target", e))?;
        let row = client
            .query_opt(&sql, &[&self.slot_name])
            .await
            .map_err(|e| CheckpointError::with_source(format!("cannot read {}", self.table), e))?;

        let Some(row) = row else {
            debug!("No checkpoint row for slot '{}'", self.slot_name);
            return Ok(None);
        };

        let lsn: String = row.get(0);
        let lsn: Lsn = lsn
            .parse()
            .map_err(|e: String| CheckpointError::new(format!("stored LSN is invalid: {}", e)))?;
        let checkpoint = Checkpoint {
            lsn,
            updated_at: row.get(1),
        };
        info!(
            "Loaded checkpoint: LSN={}, updated_at={}",
            checkpoint.lsn, checkpoint.updated_at
        );
        Ok(Some(checkpoint))
    }

    async fn save(&mut self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let sql = self.upsert_sql();
        let lsn = checkpoint.lsn.to_string();
        let mut conn = self.client.lock().await;
        if !conn.in_transaction() {
            return Err(CheckpointError::new(
                "checkpoint table must be written inside the target transaction",
            ));
        }
        let client = conn
            .client()
            .await
            .map_err(|e| CheckpointError::with_source("cannot reach target", e))?;
        client
            .execute(&sql, &[&self.slot_name, &lsn, &checkpoint.updated_at])
            .await
            .map_err(|e| CheckpointError::with_source(format!("cannot write {}", self.table), e))?;
        debug!("Checkpoint staged: LSN={}", checkpoint.lsn);
        Ok(())
    }

    fn joins_target_transaction(&self) -> bool {
        true
    }
}

/// Checkpoint store selected by configuration.
pub enum CheckpointBackend {
    Postgres(PostgresCheckpointStore),
    File(FileCheckpointStore),
}

impl CheckpointStore for CheckpointBackend {
    async fn load(&mut self) -> Result<Option<Checkpoint>, CheckpointError> {
        match self {
            CheckpointBackend::Postgres(store) => store.load().await,
            CheckpointBackend::File(store) => store.load().await,
        }
    }

    async fn save(&mut self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        match self {
            CheckpointBackend::Postgres(store) => store.save(checkpoint).await,
            CheckpointBackend::File(store) => store.save(checkpoint).await,
        }
    }

    fn joins_target_transaction(&self) -> bool {
        match self {
            CheckpointBackend::Postgres(store) => store.joins_target_transaction(),
            CheckpointBackend::File(store) => store.joins_target_transaction(),
        }
    }
}
