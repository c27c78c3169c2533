use crate::errors::Result;
use crate::metrics::{DEVICES_OFFLINE_TOTAL, STORE_FAILURES_TOTAL};
use crate::store::Store;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_LIVENESS_TIMEOUT_SECS: i64 = 300;

/// Demotes online devices that have gone quiet. Runs until the task is dropped.
pub async fn run_sweeper<S: Store>(store: Arc<S>, every: Duration, timeout: chrono::Duration) {
    info!(
        "Starting liveness sweeper with interval={:?}, timeout={}s",
        every,
        timeout.num_seconds()
    );

    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; sweep one full interval after startup.
    ticker.tick().await;

    loop {
        ticker.tick().await;
        match sweep_once(store.as_ref(), timeout, Utc::now()).await {
            Ok(0) => debug!("Sweep found no stale devices"),
            Ok(n) => info!("Sweep marked {} device(s) offline", n),
            Err(e) => {
                STORE_FAILURES_TOTAL.inc();
                error!("Liveness sweep failed: {}", e);
            }
        }
    }
}

/// One sweep. Each demotion is a conditional write, so a device that reported
/// between the select and the update stays online.
pub async fn sweep_once<S: Store>(store: &S, timeout: chrono::Duration, now: DateTime<Utc>) -> Result<usize> {
    let cutoff = now - timeout;
    let candidates = store.find_stale_online_devices(cutoff).await?;

    let mut demoted = 0;
    for device_id in candidates {
        match store.mark_offline_if_stale(&device_id, cutoff, now).await {
            Ok(true) => {
                DEVICES_OFFLINE_TOTAL.with_label_values(&["sweep"]).inc();
                info!("Device {} marked offline (no telemetry since {})", device_id, cutoff);
                demoted += 1;
            }
            Ok(false) => debug!("Device {} reported before it could be marked offline", device_id),
            Err(e) => {
                STORE_FAILURES_TOTAL.inc();
                error!("Failed to mark device {} offline: {}", device_id, e);
            }
        }
    }

    Ok(demoted)
}
