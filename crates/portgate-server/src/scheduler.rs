//! Periodic task runner
//!
//! Invokes a task every `interval` until shutdown. Runs of the same task
//! never overlap; a failing run is logged and the loop keeps going.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// A unit of periodic work
#[async_trait]
pub trait Task: Send + Sync + 'static {
    async fn run(&self) -> anyhow::Result<()>;
}

/// Run `task` every `interval` until `shutdown` flips to true
pub async fn run(
    name: &str,
    task: Arc<dyn Task>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    tracing::info!(task = name, interval_secs = interval.as_secs(), "scheduler task started");
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                if let Err(e) = task.run().await {
                    tracing::error!(task = name, error = %e, "scheduled task failed");
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    tracing::debug!(task = name, "scheduler task stopped");
                    return;
                }
            }
        }
    }
}
