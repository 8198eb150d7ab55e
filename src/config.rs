use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::postgres::TableName;
use crate::{Error, Result};

/// Prefix of the environment variables overlaying the config file,
/// e.g. `CDC_SOURCE__PASSWORD` or `CDC_REPLICATION__BATCH_SIZE`.
pub const ENV_PREFIX: &str = "CDC";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub source: DatabaseConfig,
    pub target: DatabaseConfig,
    #[serde(default)]
    pub replication: ReplicationConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_database")]
    pub database: String,
    #[serde(default = "default_username")]
    pub username: String,
    pub password: String,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReplicationConfig {
    #[serde(default = "default_slot_name")]
    pub slot_name: String,
    #[serde(default = "default_publication")]
    pub publication: String,
    /// Maximum number of slot rows requested per fetch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Consecutive failures of the same window before it is reported as stuck
    #[serde(default = "default_stuck_alert_threshold")]
    pub stuck_alert_threshold: u32,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointStoreKind {
    /// A table on the target, written in the same transaction as the data
    #[default]
    Target,
    File,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CheckpointConfig {
    #[serde(default)]
    pub store: CheckpointStoreKind,
    #[serde(default = "default_checkpoint_schema")]
    pub schema: String,
    #[serde(default = "default_checkpoint_table")]
    pub table: String,
    #[serde(default = "default_checkpoint_file")]
    pub file_path: String,
}

impl Config {
    /// Loads an optional TOML file overlaid by `CDC_*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_prefix(path, ENV_PREFIX)
    }

    pub fn load_with_prefix(path: Option<&Path>, env_prefix: &str) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path));
        }
        let settings = builder
            .add_source(
                ::config::Environment::with_prefix(env_prefix)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| Error::Config(e.to_string()))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let replication = &self.replication;
        if replication.batch_size == 0 {
            return Err(Error::Config("replication.batch_size must be at least 1".into()));
        }
        if i32::try_from(replication.batch_size).is_err() {
            return Err(Error::Config(format!(
                "replication.batch_size {} is too large",
                replication.batch_size
            )));
        }
        if replication.stuck_alert_threshold == 0 {
            return Err(Error::Config(
                "replication.stuck_alert_threshold must be at least 1".into(),
            ));
        }
        // PostgreSQL only accepts lower-case letters, digits and underscores.
        let slot = &replication.slot_name;
        if slot.is_empty()
            || slot.len() > 63
            || !slot
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        {
            return Err(Error::Config(format!(
                "invalid replication slot name '{}'",
                slot
            )));
        }
        if replication.publication.is_empty() {
            return Err(Error::Config("replication.publication must not be empty".into()));
        }
        for (name, db) in [("source", &self.source), ("target", &self.target)] {
            if db.password.is_empty() {
                return Err(Error::Config(format!("{}.password must be set", name)));
            }
        }
        Ok(())
    }

    pub fn checkpoint_table(&self) -> TableName {
        TableName::new(&self.checkpoint.schema, &self.checkpoint.table)
    }
}

impl DatabaseConfig {
    pub fn pg_config(&self) -> tokio_postgres::Config {
        let mut config = tokio_postgres::Config::new();
        config
            .host(&self.host)
            .port(self.port)
            .dbname(&self.database)
            .user(&self.username)
            .password(&self.password)
            .connect_timeout(Duration::from_secs(self.connect_timeout_secs))
            .application_name("pg-cdc");
        config
    }
}

impl ReplicationConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            slot_name: default_slot_name(),
            publication: default_publication(),
            batch_size: default_batch_size(),
            poll_interval_ms: default_poll_interval_ms(),
            retry_backoff_ms: default_retry_backoff_ms(),
            stuck_alert_threshold: default_stuck_alert_threshold(),
        }
    }
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            store: CheckpointStoreKind::default(),
            schema: default_checkpoint_schema(),
            table: default_checkpoint_table(),
            file_path: default_checkpoint_file(),
        }
    }
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    5432
}

fn default_database() -> String {
    "postgres".to_string()
}

fn default_username() -> String {
    "postgres".to_string()
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_slot_name() -> String {
    "cdc_slot".to_string()
}

fn default_publication() -> String {
    "db_changes".to_string()
}

fn default_batch_size() -> usize {
    1000
}

fn default_poll_interval_ms() -> u64 {
    10
}

fn default_retry_backoff_ms() -> u64 {
    1000
}

fn default_stuck_alert_threshold() -> u32 {
    5
}

fn default_checkpoint_schema() -> String {
    "public".to_string()
}

fn default_checkpoint_table() -> String {
    "cdc_checkpoint".to_string()
}

fn default_checkpoint_file() -> String {
    "checkpoint.json".to_string()
}
