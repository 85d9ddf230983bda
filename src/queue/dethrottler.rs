//! Background task returning throttled destinations to service.
//!
//! Wakes once per second and promotes every throttled destination whose
//! rate window has cleared. The promotion script is idempotent and
//! atomic, so running one dethrottler per process across a fleet is
//! safe.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::WorkQueue;

/// Spawn the dethrottler loop for a queue.
///
/// Exits when the shutdown signal flips to `true` or the watch channel
/// closes; the returned handle joins the task.
pub fn start_dethrottler(
    queue: Arc<dyn WorkQueue>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("dethrottler started");
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        // Skip the immediate first tick.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match queue.dethrottle().await {
                        Ok(0) => {}
                        Ok(promoted) => {
                            debug!(promoted, "promoted throttled destinations");
                        }
                        Err(e) => warn!(error = %e, "dethrottle pass failed"),
                    }
                }
                result = shutdown_rx.changed() => {
                    if result.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        info!("dethrottler stopped");
    })
}
