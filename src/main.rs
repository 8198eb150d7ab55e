use clap::Parser;
use pg_cdc::apply::{ApplyEngine, PostgresTarget};
use pg_cdc::checkpoint::{CheckpointBackend, FileCheckpointStore, PostgresCheckpointStore};
use pg_cdc::config::CheckpointStoreKind;
use pg_cdc::postgres::{provision, ManagedClient, PostgresSlotSource};
use pg_cdc::shutdown::{shutdown_channel, ShutdownTx};
use pg_cdc::{Config, Replicator, ReplicatorSettings, Result};
use std::path::PathBuf;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Parser, Debug)]
#[command(name = "pg-cdc")]
#[command(about = "PostgreSQL logical decoding CDC replicator", long_about = None)]
struct Args {
    #[arg(short, long, value_name = "FILE", help = "Optional TOML config file, overlaid by CDC_* variables")]
    config: Option<PathBuf>,

    #[arg(short, long, help = "Enable JSON output for logs")]
    json_logs: bool,

    #[arg(short, long, help = "Verbose logging")]
    verbose: bool,

    #[arg(long, env = "LOG_LEVEL", default_value = "info", help = "Log level when RUST_LOG is unset")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(args.json_logs, args.verbose, &args.log_level);

    info!("Starting pg-cdc");
    if let Some(path) = &args.config {
        info!("Loading configuration from {:?}", path);
    }

    let config = match Config::load(args.config.as_deref()) {
        Ok(cfg) => {
            info!("Configuration loaded successfully");
            cfg
        }
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e);
        }
    };

    info!(
        source_host = %config.source.host,
        source_database = %config.source.database,
        target_host = %config.target.host,
        target_database = %config.target.database,
        slot = %config.replication.slot_name,
        publication = %config.replication.publication,
        checkpoint_store = ?config.checkpoint.store,
        "Configuration summary"
    );

    if let Err(e) = run(config).await {
        error!(stage = e.stage(), "pg-cdc stopped: {}", e);
        return Err(e);
    }
    Ok(())
}

async fn run(config: Config) -> Result<()> {
    let slot_name = config.replication.slot_name.clone();

    let mut source = ManagedClient::connect("source", config.source.pg_config()).await?;
    {
        let client = source.client().await?;
        provision::ensure_publication(client, &config.replication.publication).await?;
        provision::ensure_slot(client, &slot_name).await?;
    }

    let target = ManagedClient::connect("target", config.target.pg_config())
        .await?
        .into_shared();

    let checkpoints = match config.checkpoint.store {
        CheckpointStoreKind::Target => {
            let store = PostgresCheckpointStore::new(
                target.clone(),
                config.checkpoint_table(),
                slot_name.clone(),
            );
            store.ensure_table().await?;
            info!("Checkpoints stored in {}", config.checkpoint_table());
            CheckpointBackend::Postgres(store)
        }
        CheckpointStoreKind::File => {
            info!("Checkpoints stored in {}", config.checkpoint.file_path);
            CheckpointBackend::File(FileCheckpointStore::new(&config.checkpoint.file_path))
        }
    };

    let engine = ApplyEngine::new(PostgresTarget::new(target), checkpoints);
    let slot = PostgresSlotSource::new(source, slot_name);
    let mut replicator = Replicator::new(
        slot,
        engine,
        ReplicatorSettings::from(&config.replication),
    );

    let (shutdown_tx, shutdown_rx) = shutdown_channel();
    let signals = tokio::spawn(listen_for_signals(shutdown_tx));

    let result = replicator.run(shutdown_rx).await;
    signals.abort();

    let stats = result?;
    info!(
        transactions = stats.transactions_applied,
        changes = stats.changes_applied,
        "pg-cdc shut down cleanly"
    );
    Ok(())
}

async fn listen_for_signals(shutdown_tx: ShutdownTx) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("SIGINT received, finishing current cycle"),
                    _ = sigterm.recv() => info!("SIGTERM received, finishing current cycle"),
                }
            }
            Err(e) => {
                warn!("Cannot listen for SIGTERM: {}", e);
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("SIGINT received, finishing current cycle");
                }
            }
        }
    }

    #[cfg(not(unix))]
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("Ctrl+C received, finishing current cycle");
    }

    if shutdown_tx.send(true).is_err() {
        warn!("Replication loop already stopped");
    }
}

fn init_logging(json: bool, verbose: bool, level: &str) {
    let env_filter = if verbose {
        EnvFilter::new("pg_cdc=debug,info")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("pg_cdc={},warn", level)))
    };

    let fmt_layer = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(false)
            .with_span_list(false)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
