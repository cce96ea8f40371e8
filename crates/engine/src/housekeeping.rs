use std::time::{Duration, SystemTime};

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::synchronization::SynchronizationEngine;

/// Periodically ends synchronizations whose abort grace period ran out.
/// Stops when `shutdown` flips to true or its sender is dropped.
pub fn spawn_housekeeping(
    synchronizations: SynchronizationEngine,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = tokio::time::sleep(interval) => {
                    match synchronizations.finalize_expired_aborts(SystemTime::now()).await {
                        Ok(0) => {}
                        Ok(finalized) => tracing::info!(finalized, "finalized expired synchronization aborts"),
                        Err(error) => tracing::warn!(%error, "abort housekeeping failed"),
                    }
                }
            }
        }
        tracing::debug!("housekeeping stopped");
    })
}
