//! Cooperative stop signal for the replication loop.
//!
//! The loop checks the signal between cycles only, so a target transaction
//! that has started always finishes with a commit or rollback.

use std::time::Duration;
use tokio::sync::watch;

pub type ShutdownTx = watch::Sender<bool>;

pub type ShutdownRx = watch::Receiver<bool>;

/// Creates a channel in the running (`false`) state.
pub fn shutdown_channel() -> (ShutdownTx, ShutdownRx) {
    watch::channel(false)
}

/// Resolves once shutdown has been requested.
///
/// A dropped sender means nobody can request shutdown any more, so this
/// then never resolves.
pub async fn wait_for_shutdown(rx: &mut ShutdownRx) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Sleeps for `duration`, returning `false` early if shutdown is requested.
pub async fn sleep_or_shutdown(duration: Duration, rx: &mut ShutdownRx) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        _ = wait_for_shutdown(rx) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_sleep_completes_without_signal() {
        let (_tx, mut rx) = shutdown_channel();
        let start = tokio::time::Instant::now();
        assert!(sleep_or_shutdown(Duration::from_millis(250), &mut rx).await);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(250) && elapsed < Duration::from_millis(251));
    }

    #[tokio::test(start_paused = true)]
    async fn test_signal_interrupts_sleep() {
        let (tx, mut rx) = shutdown_channel();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            tx.send(true).unwrap();
            tx
        });

        let start = tokio::time::Instant::now();
        assert!(!sleep_or_shutdown(Duration::from_secs(60), &mut rx).await);
        assert!(start.elapsed() < Duration::from_secs(60));
        drop(handle.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_sender_is_not_a_signal() {
        let (tx, mut rx) = shutdown_channel();
        drop(tx);
        assert!(sleep_or_shutdown(Duration::from_secs(5), &mut rx).await);
    }

    #[tokio::test]
    async fn test_signal_sent_before_wait_is_seen() {
        let (tx, mut rx) = shutdown_channel();
        tx.send(true).unwrap();
        wait_for_shutdown(&mut rx).await;
    }
}
