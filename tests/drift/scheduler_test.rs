//! Scheduler cadence, error tolerance and shutdown.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use gatekeeper::audit::metrics::Counter;
use gatekeeper::drift::scheduler::{run_drift_scheduler, ScheduledScan};
use gatekeeper::governance::GovernanceSettings;

use crate::support::Harness;

#[derive(Default)]
struct CountingScan {
    calls: AtomicUsize,
    fail_first: bool,
}

#[async_trait]
impl ScheduledScan for CountingScan {
    async fn run_scheduled_scan(&self) -> anyhow::Result<bool> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_first && call == 0 {
            anyhow::bail!("store offline");
        }
        Ok(true)
    }
}

#[tokio::test(start_paused = true)]
async fn ticks_once_per_interval_after_the_first() {
    let scan = Arc::new(CountingScan::default());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(run_drift_scheduler(scan.clone(), 10, shutdown_rx));

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(scan.calls.load(Ordering::SeqCst), 0);

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(scan.calls.load(Ordering::SeqCst), 3);

    shutdown_tx.send(true).expect("scheduler listening");
    handle.await.expect("scheduler exits");
}

#[tokio::test(start_paused = true)]
async fn failed_scan_does_not_stop_the_loop() {
    let scan = Arc::new(CountingScan {
        calls: AtomicUsize::new(0),
        fail_first: true,
    });
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(run_drift_scheduler(scan.clone(), 10, shutdown_rx));

    tokio::time::sleep(Duration::from_secs(25)).await;
    assert_eq!(scan.calls.load(Ordering::SeqCst), 2);

    drop(shutdown_tx);
    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .expect("exits when the sender is dropped")
        .expect("no panic");
}

#[tokio::test]
async fn governance_service_runs_as_a_scheduled_scan() {
    let h = Harness::new(GovernanceSettings::default());
    let ran = h.service.run_scheduled_scan().await.expect("scan");
    assert!(ran);
    assert_eq!(h.metrics.get(Counter::DriftScans), 1);
    assert_eq!(h.metrics.get(Counter::DriftDetected), 0);
}
