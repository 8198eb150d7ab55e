use tracing::{debug, info};

use super::connection::ManagedClient;
use super::provision::OUTPUT_PLUGIN;
use super::types::{Lsn, RawChange};
use crate::error::DecodeError;
use crate::replicator::ChangeSource;
use crate::{Error, Result};

// Peek rather than get: rows stay in the slot until acknowledged, so a cycle
// that fails is redelivered in full on the next fetch.
const PEEK_CHANGES: &str = "SELECT lsn::text, xid::text, data \
     FROM pg_logical_slot_peek_changes($1, NULL, $2, \
     'include-xids', '1', 'skip-empty-xacts', '1')";

const CONFIRMED_FLUSH: &str =
    "SELECT confirmed_flush_lsn::text FROM pg_replication_slots WHERE slot_name = $1";

const ADVANCE_SLOT: &str = "SELECT end_lsn::text FROM pg_replication_slot_advance($1, $2::text::pg_lsn)";

/// Reads decoded changes from a `test_decoding` logical replication slot
/// through the SQL-level slot functions.
pub struct PostgresSlotSource {
    client: ManagedClient,
    slot_name: String,
    confirmed: Option<Lsn>,
}

impl PostgresSlotSource {
    pub fn new(client: ManagedClient, slot_name: impl Into<String>) -> Self {
        Self {
            client,
            slot_name: slot_name.into(),
            confirmed: None,
        }
    }

    pub fn slot_name(&self) -> &str {
        &self.slot_name
    }

    /// The position up to which the slot has been acknowledged.
    pub async fn confirmed_flush(&mut self) -> Result<Option<Lsn>> {
        let row = self
            .client
            .client()
            .await?
            .query_opt(CONFIRMED_FLUSH, &[&self.slot_name])
            .await?
            .ok_or_else(|| {
                Error::Connection(format!(
                    "replication slot '{}' does not exist (expected a {} slot)",
                    self.slot_name, OUTPUT_PLUGIN
                ))
            })?;

        let lsn: Option<String> = row.get(0);
        lsn.map(|s| parse_lsn(&s)).transpose()
    }

    async fn advance(&mut self, lsn: Lsn) -> Result<()> {
        let target = lsn.to_string();
        self.client
            .client()
            .await?
            .query_one(ADVANCE_SLOT, &[&self.slot_name, &target])
            .await?;
        self.confirmed = Some(lsn);
        Ok(())
    }
}

impl ChangeSource for PostgresSlotSource {
    async fn resume_after(&mut self, lsn: Lsn) -> Result<()> {
        let confirmed = self.confirmed_flush().await?;
        self.confirmed = confirmed;
        match confirmed {
            Some(current) if current >= lsn => {
                info!(slot = %self.slot_name, confirmed = %current, checkpoint = %lsn, "Slot already past checkpoint");
                Ok(())
            }
            _ => {
                info!(slot = %self.slot_name, checkpoint = %lsn, "Advancing slot to checkpoint");
                self.advance(lsn).await
            }
        }
    }

    async fn fetch(&mut self, limit: usize) -> Result<Vec<RawChange>> {
        let limit = i32::try_from(limit).unwrap_or(i32::MAX);
        let rows = self
            .client
            .client()
            .await?
            .query(PEEK_CHANGES, &[&self.slot_name, &limit])
            .await?;

        let mut changes = Vec::with_capacity(rows.len());
        for row in rows {
            let lsn: String = row.get(0);
            let xid: Option<String> = row.get(1);
            let data: String = row.get(2);
            let lsn = parse_lsn(&lsn)?;
            changes.push(RawChange {
                lsn,
                xid: xid.and_then(|x| x.parse().ok()),
                data,
            });
        }

        debug!(slot = %self.slot_name, count = changes.len(), "Fetched slot changes");
        Ok(changes)
    }

    async fn acknowledge(&mut self, lsn: Lsn) -> Result<()> {
        if self.confirmed.is_some_and(|c| c >= lsn) {
            return Ok(());
        }
        debug!(slot = %self.slot_name, lsn = %lsn, "Acknowledging slot position");
        self.advance(lsn).await
    }
}

fn parse_lsn(text: &str) -> Result<Lsn> {
    text.parse().map_err(|reason| {
        Error::Decode(DecodeError {
            lsn: Lsn::ZERO,
            reason,
            payload: text.to_string(),
        })
    })
}
