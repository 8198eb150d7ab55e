mod common;

use common::{account, accounts, accounts_target, settings};
use pg_cdc::memory::{MemoryCheckpointStore, MemorySource};
use pg_cdc::postgres::test_utils::SlotStreamBuilder;
use pg_cdc::postgres::Lsn;
use pg_cdc::shutdown::shutdown_channel;
use pg_cdc::{ApplyEngine, Error, Replicator};
use std::time::Duration;

const TABLE: &str = "public.accounts";

#[tokio::test(start_paused = true)]
async fn test_fetch_failures_are_retried_after_backoff() {
    let source = MemorySource::new();
    source
        .push(
            SlotStreamBuilder::new(10)
                .begin(1)
                .insert(TABLE, &[("id", "integer", "1"), ("balance", "integer", "10")])
                .commit()
                .build(),
        )
        .await;
    source.fail_next_fetches(2).await;

    let target = accounts_target().await;
    let (tx, rx) = shutdown_channel();
    source.shutdown_after_fetches(3, tx).await;
    let mut replicator = Replicator::new(
        source.clone(),
        ApplyEngine::new(target.clone(), MemoryCheckpointStore::new()),
        settings(),
    );
    let stats = replicator.run(rx).await.unwrap();

    assert_eq!(stats.failures, 2);
    assert_eq!(stats.transactions_applied, 1);
    assert_eq!(target.rows(&accounts()).await, vec![account("1", "10")]);

    let times = source.fetch_times().await;
    assert_eq!(times.len(), 3);
    for pair in times.windows(2) {
        let gap = pair[1] - pair[0];
        assert!(gap >= Duration::from_secs(1) && gap < Duration::from_millis(1001));
    }
}

#[tokio::test(start_paused = true)]
async fn test_malformed_payload_is_never_applied_or_acknowledged() {
    let source = MemorySource::new();
    source
        .push(
            SlotStreamBuilder::new(10)
                .begin(1)
                .insert(TABLE, &[("id", "integer", "1"), ("balance", "integer", "10")])
                .raw("table public.accounts: UPSERT: id[integer]:2")
                .commit()
                .build(),
        )
        .await;

    let target = accounts_target().await;
    let checkpoints = MemoryCheckpointStore::new();
    let (tx, rx) = shutdown_channel();
    source.shutdown_after_fetches(5, tx).await;
    let mut replicator = Replicator::new(
        source.clone(),
        ApplyEngine::new(target.clone(), checkpoints.clone()),
        settings(),
    );
    let stats = replicator.run(rx).await.unwrap();

    // Every attempt sees the same window and fails the same way; the loop
    // keeps going rather than skipping the payload.
    assert_eq!(stats.failures, 5);
    assert_eq!(stats.transactions_applied, 0);
    assert!(target.rows(&accounts()).await.is_empty());
    assert!(checkpoints.current().await.is_none());
    assert_eq!(source.pending().await.len(), 4);
    assert_eq!(source.acknowledged().await, None);
}

#[tokio::test(start_paused = true)]
async fn test_change_outside_transaction_is_retried() {
    let source = MemorySource::new();
    source
        .push(
            SlotStreamBuilder::new(10)
                .insert(TABLE, &[("id", "integer", "1"), ("balance", "integer", "10")])
                .build(),
        )
        .await;

    let mut replicator = Replicator::new(
        source.clone(),
        ApplyEngine::new(accounts_target().await, MemoryCheckpointStore::new()),
        settings(),
    );
    let err = replicator.run_cycle().await.unwrap_err();
    assert!(matches!(err, Error::OutOfOrder(_)));
    assert!(!err.is_fatal());
    assert_eq!(err.stage(), "assemble");
}

#[tokio::test(start_paused = true)]
async fn test_apply_failure_keeps_earlier_transactions() {
    let source = MemorySource::new();
    source
        .push(
            SlotStreamBuilder::new(10)
                .begin(1)
                .insert(TABLE, &[("id", "integer", "1"), ("balance", "integer", "10")])
                .commit()
                .begin(2)
                .insert(TABLE, &[("id", "integer", "2"), ("balance", "integer", "20")])
                .insert(TABLE, &[("id", "integer", "3"), ("balance", "integer", "30")])
                .commit()
                .build(),
        )
        .await;

    let target = accounts_target().await;
    let checkpoints = MemoryCheckpointStore::new();
    // Second statement of the second transaction.
    target.fail_execute_at(3).await;

    let (tx, rx) = shutdown_channel();
    source.shutdown_after_fetches(3, tx).await;
    let mut replicator = Replicator::new(
        source.clone(),
        ApplyEngine::new(target.clone(), checkpoints.clone()),
        settings(),
    );
    let stats = replicator.run(rx).await.unwrap();

    assert_eq!(stats.failures, 1);
    assert_eq!(stats.transactions_applied, 2);
    assert_eq!(target.rollbacks().await, 1);
    assert_eq!(
        target.rows(&accounts()).await,
        vec![account("1", "10"), account("2", "20"), account("3", "30")]
    );
    assert_eq!(checkpoints.history().await, vec![Lsn(12), Lsn(16)]);

    // The first transaction was acknowledged before the failure was reported.
    let times = source.fetch_times().await;
    assert_eq!(times.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_checkpoint_failure_is_fatal() {
    let source = MemorySource::new();
    source
        .push(
            SlotStreamBuilder::new(10)
                .begin(1)
                .insert(TABLE, &[("id", "integer", "1"), ("balance", "integer", "10")])
                .commit()
                .build(),
        )
        .await;

    let checkpoints = MemoryCheckpointStore::new();
    checkpoints.fail_saves(true).await;
    let (_tx, rx) = shutdown_channel();
    let mut replicator = Replicator::new(
        source.clone(),
        ApplyEngine::new(accounts_target().await, checkpoints.clone()),
        settings(),
    );

    let err = replicator.run(rx).await.unwrap_err();
    assert!(matches!(err, Error::Checkpoint(_)));
    assert!(err.is_fatal());
    assert_eq!(source.acknowledged().await, None);
    assert_eq!(source.fetch_times().await.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_joined_checkpoint_failure_rolls_back_data() {
    let source = MemorySource::new();
    source
        .push(
            SlotStreamBuilder::new(10)
                .begin(1)
                .insert(TABLE, &[("id", "integer", "1"), ("balance", "integer", "10")])
                .commit()
                .build(),
        )
        .await;

    let target = accounts_target().await;
    target.fail_checkpoint_writes(true).await;
    let (_tx, rx) = shutdown_channel();
    let mut replicator = Replicator::new(
        source.clone(),
        ApplyEngine::new(target.clone(), target.checkpoint_store()),
        settings(),
    );

    let err = replicator.run(rx).await.unwrap_err();
    assert!(err.is_fatal());
    assert!(target.rows(&accounts()).await.is_empty());
    assert_eq!(target.rollbacks().await, 1);
    assert!(target.committed_checkpoint().await.is_none());
}
