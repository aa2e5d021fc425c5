//! Periodic crash recovery.
//!
//! A job whose slot stopped heartbeating (crashed task, hung process,
//! lost storage connection) stays `processing` until this scanner returns
//! it to the queue. The attempt count is kept, so a job lost on its last
//! attempt ends up failed instead.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use tflow_queue::JobQueue;

use crate::metrics;
use crate::retry::FailureTracker;

/// Scan for stale heartbeats every `interval` until `shutdown` flips.
pub fn spawn_recovery(
    queue: Arc<JobQueue>,
    heartbeat_timeout: Duration,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
        let mut failures = FailureTracker::new(3);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    match queue.recover_stale(heartbeat_timeout, Utc::now()).await {
                        Ok(recovered) if !recovered.is_empty() => {
                            failures.record_success();
                            metrics::record_recovered(recovered.len());
                            info!(count = recovered.len(), "Recovered jobs with stale heartbeats");
                        }
                        Ok(_) => failures.record_success(),
                        Err(e) => {
                            if failures.record_failure() {
                                warn!(error = %e, "Stale heartbeat scan failed");
                            }
                        }
                    }
                }
            }
        }

        debug!("Recovery task stopped");
    })
}
