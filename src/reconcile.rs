//! Periodic status reconciliation driver.
//!
//! When an auto-poll interval is configured, a timer enqueues a full
//! reconcile on each tick. The task manager's identity dedup suppresses
//! the tick while a reconcile is already queued or running.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::Error;
use crate::tasks::{ReconcileScope, Task, TaskManager};

pub fn spawn_auto_reconcile(
    tasks: Arc<TaskManager>,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!(
            "Auto status reconcile every {} minutes",
            interval.as_secs() / 60
        );
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    match tasks.enqueue(Task::Reconcile(ReconcileScope::All)).await {
                        Ok(()) => {}
                        Err(Error::AlreadyInProgress) => {
                            tracing::debug!("Reconcile already in flight; skipping tick");
                        }
                        Err(e) => {
                            tracing::warn!("Could not queue scheduled reconcile: {}", e);
                        }
                    }
                }
                _ = shutdown.cancelled() => {
                    tracing::info!("Auto reconcile stopped");
                    break;
                }
            }
        }
    })
}
