//! Periodic drift scan loop.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{error, info};

/// Work performed on each scheduler tick.
#[async_trait]
pub trait ScheduledScan: Send + Sync {
    /// Run one scan. Returns `false` if it was skipped because another scan
    /// was still running.
    ///
    /// # Errors
    ///
    /// Returns an error if the scan could not run; the loop logs it and
    /// continues.
    async fn run_scheduled_scan(&self) -> anyhow::Result<bool>;
}

/// Run `task` every `interval_secs` until `shutdown_rx` flips to `true` or
/// closes.
///
/// The first tick fires after one full interval. A tick that lands while a
/// scan is still in flight is skipped, never queued behind it.
pub async fn run_drift_scheduler(
    task: Arc<dyn ScheduledScan>,
    interval_secs: u64,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let interval_secs = interval_secs.max(1);
    info!(interval_secs, "drift scheduler started");

    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut completed: u64 = 0;
    let mut skipped: u64 = 0;

    // Skip the first immediate tick.
    interval.tick().await;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                match task.run_scheduled_scan().await {
                    Ok(true) => completed = completed.saturating_add(1),
                    Ok(false) => skipped = skipped.saturating_add(1),
                    Err(e) => error!(error = %e, "scheduled drift scan failed"),
                }
            }
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    info!("drift scheduler shutting down");
                    break;
                }
            }
        }
    }

    info!(completed, skipped, "drift scheduler stopped");
}
