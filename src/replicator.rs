//! The fetch, decode, assemble and apply loop.
//!
//! One [`Replicator`] drives one source slot into one target, strictly
//! sequentially. A cycle that fails anywhere is abandoned without
//! acknowledging the rows it fetched past the last applied transaction,
//! so the next cycle sees the same window again.

use std::future::Future;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::apply::{ApplyEngine, ApplyOutcome, Target};
use crate::assembler::TransactionAssembler;
use crate::checkpoint::CheckpointStore;
use crate::config::ReplicationConfig;
use crate::postgres::{Lsn, RawChange, TestDecodingDecoder};
use crate::shutdown::{sleep_or_shutdown, ShutdownRx};
use crate::Result;

/// Supplies raw decoded-change rows from a replication slot.
pub trait ChangeSource {
    /// Positions the source so that nothing at or before `lsn` is delivered
    /// again. Called once at startup with the stored checkpoint.
    fn resume_after(&mut self, lsn: Lsn) -> impl Future<Output = Result<()>> + Send;

    /// Returns up to about `limit` pending rows without consuming them.
    fn fetch(&mut self, limit: usize) -> impl Future<Output = Result<Vec<RawChange>>> + Send;

    /// Marks everything up to and including the commit at `lsn` as consumed.
    fn acknowledge(&mut self, lsn: Lsn) -> impl Future<Output = Result<()>> + Send;
}

#[derive(Debug, Clone)]
pub struct ReplicatorSettings {
    pub batch_size: usize,
    pub poll_interval: Duration,
    pub retry_backoff: Duration,
    pub stuck_alert_threshold: u32,
}

impl From<&ReplicationConfig> for ReplicatorSettings {
    fn from(config: &ReplicationConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            poll_interval: config.poll_interval(),
            retry_backoff: config.retry_backoff(),
            stuck_alert_threshold: config.stuck_alert_threshold,
        }
    }
}

impl Default for ReplicatorSettings {
    fn default() -> Self {
        Self::from(&ReplicationConfig::default())
    }
}

/// What a single cycle did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// The slot had nothing pending.
    Idle,
    /// Rows arrived but no transaction completed yet.
    Pending { fetched: usize },
    /// Transactions up to `lsn` are applied or were already applied.
    Applied {
        transactions: usize,
        changes: usize,
        lsn: Lsn,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplicatorStats {
    pub cycles: u64,
    pub empty_polls: u64,
    pub transactions_applied: u64,
    pub transactions_skipped: u64,
    pub changes_applied: u64,
    pub failures: u64,
}

/// Counts consecutive failures of the same window.
#[derive(Debug, Default)]
struct FailureTracker {
    window: Option<Lsn>,
    count: u32,
}

impl FailureTracker {
    fn record(&mut self, window: Option<Lsn>) -> u32 {
        if self.count > 0 && self.window == window {
            self.count += 1;
        } else {
            self.window = window;
            self.count = 1;
        }
        self.count
    }

    fn clear(&mut self) {
        self.window = None;
        self.count = 0;
    }
}

pub struct Replicator<S, T, C> {
    source: S,
    decoder: TestDecodingDecoder,
    assembler: TransactionAssembler,
    engine: ApplyEngine<T, C>,
    settings: ReplicatorSettings,
    stats: ReplicatorStats,
    failures: FailureTracker,
    window_start: Option<Lsn>,
}

impl<S, T, C> Replicator<S, T, C>
where
    S: ChangeSource + Send,
    T: Target + Send,
    C: CheckpointStore + Send,
{
    pub fn new(source: S, engine: ApplyEngine<T, C>, settings: ReplicatorSettings) -> Self {
        Self {
            source,
            decoder: TestDecodingDecoder::new(),
            assembler: TransactionAssembler::new(),
            engine,
            settings,
            stats: ReplicatorStats::default(),
            failures: FailureTracker::default(),
            window_start: None,
        }
    }

    pub fn stats(&self) -> &ReplicatorStats {
        &self.stats
    }

    pub fn engine(&self) -> &ApplyEngine<T, C> {
        &self.engine
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Loads the checkpoint and positions the source after it.
    pub async fn start(&mut self) -> Result<Option<Lsn>> {
        let checkpoint = self.engine.load_checkpoint().await?;
        match checkpoint {
            Some(lsn) => {
                info!(lsn = %lsn, "Resuming after checkpoint");
                self.source.resume_after(lsn).await?;
            }
            None => info!("No checkpoint found, starting from the slot's position"),
        }
        Ok(checkpoint)
    }

    /// Runs cycles until `shutdown` is signalled or a fatal error occurs.
    ///
    /// The signal is checked between cycles; a cycle in progress always
    /// completes first.
    pub async fn run(&mut self, mut shutdown: ShutdownRx) -> Result<ReplicatorStats> {
        self.start().await?;
        info!(
            batch_size = self.settings.batch_size,
            poll_interval_ms = self.settings.poll_interval.as_millis() as u64,
            "Replication loop started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            let delay = match self.run_cycle().await {
                Ok(CycleOutcome::Idle) => {
                    self.stats.empty_polls += 1;
                    self.failures.clear();
                    Some(self.settings.poll_interval)
                }
                Ok(CycleOutcome::Pending { fetched }) => {
                    debug!(fetched, "Waiting for the open transaction to commit");
                    self.failures.clear();
                    Some(self.settings.poll_interval)
                }
                Ok(CycleOutcome::Applied {
                    transactions,
                    changes,
                    lsn,
                }) => {
                    self.failures.clear();
                    info!(
                        transactions,
                        changes,
                        lsn = %lsn,
                        "Applied {} transactions ({} changes)",
                        transactions,
                        changes
                    );
                    None
                }
                Err(e) if e.is_fatal() => {
                    error!(stage = e.stage(), "Fatal error, stopping replication: {}", e);
                    self.log_stats();
                    return Err(e);
                }
                Err(e) => {
                    self.stats.failures += 1;
                    self.assembler.reset();
                    let attempts = self.failures.record(self.window_start);
                    let window = self.window_start.map(|lsn| lsn.to_string());
                    if attempts >= self.settings.stuck_alert_threshold {
                        error!(
                            stage = e.stage(),
                            window = ?window,
                            attempts,
                            "Replication stuck on the same changes, operator intervention required: {}",
                            e
                        );
                    } else {
                        error!(stage = e.stage(), window = ?window, attempts, "Cycle failed, retrying: {}", e);
                    }
                    Some(self.settings.retry_backoff)
                }
            };

            if let Some(delay) = delay {
                if !sleep_or_shutdown(delay, &mut shutdown).await {
                    break;
                }
            }
        }

        info!("Shutdown requested, replication loop stopped");
        self.log_stats();
        Ok(self.stats.clone())
    }

    /// One fetch, decode, assemble and apply pass.
    pub async fn run_cycle(&mut self) -> Result<CycleOutcome> {
        self.stats.cycles += 1;
        let raw = self.source.fetch(self.settings.batch_size).await?;
        self.window_start = raw.first().map(|r| r.lsn);
        if raw.is_empty() {
            return Ok(CycleOutcome::Idle);
        }
        debug!(count = raw.len(), first_lsn = %raw[0].lsn, "Fetched changes");

        let mut messages = Vec::with_capacity(raw.len());
        for change in &raw {
            messages.push((change.lsn, self.decoder.decode(change)?));
        }
        let batches = self.assembler.assemble(messages)?;
        if batches.is_empty() {
            return Ok(CycleOutcome::Pending { fetched: raw.len() });
        }

        let mut done: Option<Lsn> = None;
        let mut transactions = 0;
        let mut changes = 0;
        for batch in &batches {
            match self.engine.apply(batch).await {
                Ok(ApplyOutcome::Applied { changes: n }) => {
                    transactions += 1;
                    changes += n;
                    self.stats.transactions_applied += 1;
                    self.stats.changes_applied += n as u64;
                }
                Ok(ApplyOutcome::Skipped) => {
                    self.stats.transactions_skipped += 1;
                }
                Err(e) => {
                    if let Some(lsn) = done {
                        // Keep the progress made before the failing batch.
                        if let Err(ack) = self.source.acknowledge(lsn).await {
                            warn!(lsn = %lsn, "Cannot acknowledge applied changes: {}", ack);
                        }
                    }
                    return Err(e);
                }
            }
            done = Some(batch.commit_lsn);
        }

        let lsn = batches[batches.len() - 1].commit_lsn;
        self.source.acknowledge(lsn).await?;
        Ok(CycleOutcome::Applied {
            transactions,
            changes,
            lsn,
        })
    }

    fn log_stats(&self) {
        let stats = &self.stats;
        info!(
            cycles = stats.cycles,
            empty_polls = stats.empty_polls,
            transactions_applied = stats.transactions_applied,
            transactions_skipped = stats.transactions_skipped,
            changes_applied = stats.changes_applied,
            failures = stats.failures,
            last_applied = ?self.engine.last_applied().map(|l| l.to_string()),
            "Replication statistics"
        );
    }
}
