//! Periodic eviction task for the model cache

use super::{IndexLoader, ModelCache};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Background task that sweeps a [`ModelCache`] every `sweep_interval`.
///
/// The task runs until [`CacheSweeper::shutdown`] is called or the sweeper is
/// dropped.
pub struct CacheSweeper {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl CacheSweeper {
    /// Start sweeping `cache` on the current tokio runtime
    pub fn spawn<L: IndexLoader>(cache: Arc<ModelCache<L>>) -> Self {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let interval = cache.config().sweep_interval;

        info!(
            interval_secs = interval.as_secs(),
            timeout_secs = cache.config().timeout.as_secs(),
            "Starting model cache sweeper"
        );

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let evicted = cache.sweep();
                        debug!(evicted = evicted.len(), remaining = cache.len(), "Cache sweep finished");
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }

            info!("Model cache sweeper stopped");
        });

        Self { shutdown_tx, task }
    }

    /// Signal the task to stop and wait for it to finish
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "Model cache sweeper ended abnormally");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
