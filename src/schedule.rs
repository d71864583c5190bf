//! Recurring retention sweep.

use crate::store::LogStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

/// Default time between retention sweeps.
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Run [`LogStore::cleanup_old_logs`] every `every`, starting immediately,
/// until the shutdown signal fires.
pub fn spawn_cleanup_task(
    logs: Arc<LogStore>,
    every: Duration,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let logs = Arc::clone(&logs);
                    match tokio::task::spawn_blocking(move || logs.cleanup_old_logs()).await {
                        Ok(Ok(removed)) => tracing::debug!(removed, "scheduled cleanup finished"),
                        Ok(Err(e)) => tracing::warn!(error = %e, "scheduled cleanup failed"),
                        Err(e) => tracing::error!(error = %e, "cleanup task panicked"),
                    }
                }
                _ = shutdown.recv() => break,
            }
        }
        tracing::debug!("cleanup task stopped");
    })
}
