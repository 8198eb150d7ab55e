#![allow(dead_code)]

use pg_cdc::config::DatabaseConfig;
use pg_cdc::memory::{MemoryTarget, Row};
use pg_cdc::postgres::{ChangeBatch, RawChange, TableName, TestDecodingDecoder};
use pg_cdc::{ReplicatorSettings, TransactionAssembler};
use std::env;
use std::time::Duration;

/// Source database for the live tests, from `TEST_PG_*` variables.
pub fn source_config() -> DatabaseConfig {
    DatabaseConfig {
        host: env::var("TEST_PG_HOST").unwrap_or_else(|_| "localhost".to_string()),
        port: env::var("TEST_PG_PORT")
            .unwrap_or_else(|_| "5432".to_string())
            .parse()
            .unwrap_or(5432),
        database: env::var("TEST_PG_DATABASE").unwrap_or_else(|_| "postgres".to_string()),
        username: env::var("TEST_PG_USERNAME").unwrap_or_else(|_| "postgres".to_string()),
        password: env::var("TEST_PG_PASSWORD").unwrap_or_else(|_| "postgres".to_string()),
        connect_timeout_secs: 10,
    }
}

/// Target database on the same server; it must differ from the source or
/// the slot would decode the replicator's own writes.
pub fn target_config() -> DatabaseConfig {
    DatabaseConfig {
        database: env::var("TEST_PG_TARGET_DATABASE")
            .unwrap_or_else(|_| "cdc_test_target".to_string()),
        ..source_config()
    }
}

pub fn test_slot_name() -> String {
    format!("test_slot_{}", std::process::id())
}

pub fn accounts() -> TableName {
    TableName::new("public", "accounts")
}

/// Short intervals so paused-clock tests read naturally.
pub fn settings() -> ReplicatorSettings {
    ReplicatorSettings {
        batch_size: 100,
        poll_interval: Duration::from_millis(250),
        retry_backoff: Duration::from_secs(1),
        stuck_alert_threshold: 3,
    }
}

pub async fn accounts_target() -> MemoryTarget {
    let target = MemoryTarget::new();
    target.create_table(accounts(), &["id"]).await;
    target
}

pub fn account(id: &str, balance: &str) -> Row {
    let mut row = Row::new();
    row.insert("id".to_string(), Some(id.to_string()));
    row.insert("balance".to_string(), Some(balance.to_string()));
    row
}

/// Decodes and assembles slot rows that are known to be well formed.
pub fn assemble(rows: &[RawChange]) -> Vec<ChangeBatch> {
    let decoder = TestDecodingDecoder::new();
    let mut assembler = TransactionAssembler::new();
    assembler
        .assemble(rows.iter().map(|r| (r.lsn, decoder.decode(r).unwrap())))
        .unwrap()
}
