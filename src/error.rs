//! Error types and result handling for pg-cdc.
//!
//! This module defines the main error type [`Error`], the per-stage errors it
//! wraps, and a convenience [`Result`] type alias used throughout the crate.
//!
//! # Example
//!
//! ```rust
//! use pg_cdc::{Error, Result};
//!
//! fn connect_to_database() -> Result<()> {
//!     // Simulating a connection error
//!     Err(Error::Connection("Failed to connect".to_string()))
//! }
//!
//! match connect_to_database() {
//!     Ok(()) => println!("Connected"),
//!     Err(e) if e.is_fatal() => eprintln!("Fatal: {}", e),
//!     Err(e) => eprintln!("Will retry: {}", e),
//! }
//! ```

use crate::postgres::{Change, Lsn};
use thiserror::Error;

/// The main error type for pg-cdc operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error, typically from missing or invalid environment variables.
    #[error("Configuration error: {0}")]
    Config(String),

    /// PostgreSQL client or protocol error.
    #[error("PostgreSQL error: {}", postgres_reason(.0))]
    Postgres(#[from] tokio_postgres::Error),

    /// Source or target unreachable, or a connection lost mid-transaction.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Creating the publication or replication slot failed.
    #[error("Provisioning error: {0}")]
    Provision(String),

    /// A target other than PostgreSQL rejected a statement.
    #[error("Target error: {0}")]
    Target(String),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    OutOfOrder(#[from] OutOfOrderChange),

    #[error(transparent)]
    Apply(#[from] ApplyError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}

impl Error {
    /// Fatal errors terminate the process; everything else is retried by the
    /// replicator after its backoff.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Config(_) | Error::Provision(_) | Error::Checkpoint(_)
        )
    }

    /// Short name of the pipeline stage that produced the error, for logs.
    pub fn stage(&self) -> &'static str {
        match self {
            Error::Decode(_) => "decode",
            Error::OutOfOrder(_) => "assemble",
            Error::Apply(_) => "apply",
            Error::Checkpoint(_) => "checkpoint",
            Error::Config(_) => "config",
            Error::Provision(_) => "provision",
            Error::Target(_) => "target",
            Error::Postgres(_) | Error::Connection(_) => "io",
        }
    }
}

/// A slot payload that does not match the decoding plugin's grammar.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("cannot decode change at {lsn}: {reason} (payload: {payload:?})")]
pub struct DecodeError {
    pub lsn: Lsn,
    pub reason: String,
    pub payload: String,
}

/// A change or commit arrived with no open transaction, or a transaction
/// started while another was still open.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("out-of-order change at {lsn}: {reason}")]
pub struct OutOfOrderChange {
    pub lsn: Lsn,
    pub reason: String,
}

/// A change could not be applied to the target. The batch's target
/// transaction was rolled back and not checkpointed.
#[derive(Error, Debug)]
#[error("failed to apply transaction {xid:?} (commit {commit_lsn}){}: {message}", describe(.position, .change))]
pub struct ApplyError {
    pub xid: Option<u32>,
    pub commit_lsn: Lsn,
    /// Index of the offending change within its batch.
    pub position: Option<usize>,
    pub change: Option<Box<Change>>,
    pub message: String,
}

fn describe(position: &Option<usize>, change: &Option<Box<Change>>) -> String {
    match (position, change) {
        (Some(p), Some(c)) => format!(" at change #{} ({})", p, c),
        (Some(p), None) => format!(" at change #{}", p),
        _ => String::new(),
    }
}

/// Server-side reason for a PostgreSQL error. The client error displays
/// only "db error" when the server rejected a statement.
pub fn postgres_reason(e: &tokio_postgres::Error) -> String {
    let Some(db) = e.as_db_error() else {
        let mut text = e.to_string();
        let mut source = std::error::Error::source(e);
        while let Some(cause) = source {
            let cause_text = cause.to_string();
            if !text.ends_with(&cause_text) {
                text.push_str(": ");
                text.push_str(&cause_text);
            }
            source = cause.source();
        }
        return text;
    };

    let mut text = format!("{} {}: {}", db.severity(), db.code().code(), db.message());
    if let Some(detail) = db.detail() {
        text.push_str(&format!(" (detail: {})", detail));
    }
    if let Some(hint) = db.hint() {
        text.push_str(&format!(" (hint: {})", hint));
    }
    if let Some(constraint) = db.constraint() {
        text.push_str(&format!(" (constraint: {})", constraint));
    }
    text
}

fn source_reason(source: &Option<Box<dyn std::error::Error + Send + Sync>>) -> String {
    match source {
        Some(cause) => match cause.downcast_ref::<tokio_postgres::Error>() {
            Some(pg) => format!(": {}", postgres_reason(pg)),
            None => format!(": {}", cause),
        },
        None => String::new(),
    }
}

/// Progress could not be durably recorded or read back.
#[derive(Error, Debug)]
#[error("checkpoint error: {message}{}", source_reason(.source))]
pub struct CheckpointError {
    pub message: String,
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl CheckpointError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

/// A convenient Result type alias for pg-cdc operations.
///
/// This is equivalent to `std::result::Result<T, pg_cdc::Error>`.
pub type Result<T> = std::result::Result<T, Error>;
