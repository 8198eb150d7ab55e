//! Idempotent creation of the publication and logical replication slot on
//! the source.

use tokio_postgres::Client;
use tracing::info;

use super::types::quote_ident;
use crate::error::postgres_reason;
use crate::{Error, Result};

/// Output plugin whose text format [`super::TestDecodingDecoder`] understands.
pub const OUTPUT_PLUGIN: &str = "test_decoding";

pub async fn ensure_publication(client: &Client, publication: &str) -> Result<()> {
    let existing = client
        .query_opt(
            "SELECT 1 FROM pg_publication WHERE pubname = $1",
            &[&publication],
        )
        .await
        .map_err(|e| Error::Provision(format!("cannot look up publication: {}", postgres_reason(&e))))?;

    if existing.is_some() {
        info!("Publication '{}' already exists", publication);
        return Ok(());
    }

    let query = format!(
        "CREATE PUBLICATION {} FOR ALL TABLES",
        quote_ident(publication)
    );
    match client.batch_execute(&query).await {
        Ok(()) => {
            info!("Created publication '{}'", publication);
            Ok(())
        }
        Err(e) if e.to_string().contains("already exists") => {
            info!("Publication '{}' already exists", publication);
            Ok(())
        }
        Err(e) => Err(Error::Provision(format!(
            "cannot create publication '{}': {}",
            publication, e
        ))),
    }
}

pub async fn ensure_slot(client: &Client, slot_name: &str) -> Result<()> {
    let existing = client
        .query_opt(
            "SELECT plugin::text, slot_type::text FROM pg_replication_slots WHERE slot_name = $1",
            &[&slot_name],
        )
        .await
        .map_err(|e| Error::Provision(format!("cannot look up replication slot: {}", postgres_reason(&e))))?;

    if let Some(row) = existing {
        let plugin: Option<String> = row.get(0);
        let slot_type: String = row.get(1);
        if slot_type != "logical" || plugin.as_deref() != Some(OUTPUT_PLUGIN) {
            return Err(Error::Provision(format!(
                "replication slot '{}' exists as a {} slot using plugin {:?}, expected a logical slot using '{}'",
                slot_name, slot_type, plugin, OUTPUT_PLUGIN
            )));
        }
        info!("Replication slot '{}' already exists", slot_name);
        return Ok(());
    }

    match client
        .query_one(
            "SELECT lsn::text FROM pg_create_logical_replication_slot($1, $2)",
            &[&slot_name, &OUTPUT_PLUGIN],
        )
        .await
    {
        Ok(row) => {
            let lsn: String = row.get(0);
            info!("Created replication slot '{}' at LSN {}", slot_name, lsn);
            Ok(())
        }
        Err(e) if e.to_string().contains("already exists") => {
            info!("Replication slot '{}' already exists", slot_name);
            Ok(())
        }
        Err(e) => Err(Error::Provision(format!(
            "cannot create replication slot '{}': {}",
            slot_name, e
        ))),
    }
}
