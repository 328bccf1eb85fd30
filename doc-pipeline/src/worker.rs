//! Periodic consolidation.
//!
//! Drives [`BufferedDocManager::apply`] on a fixed cadence. Passes never
//! overlap inside one worker: a tick that fires while a pass is still running
//! is skipped. Workers in other processes may overlap freely; the per-document
//! buffer lock keeps them apart.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::manager::{ApplyOutcome, BufferedDocManager};

/// Background task running consolidation passes until shut down.
pub struct ConsolidationWorker {
    manager: Arc<BufferedDocManager>,
    interval: Duration,
}

impl ConsolidationWorker {
    /// Worker ticking at the manager's configured apply interval.
    pub fn new(manager: Arc<BufferedDocManager>) -> Self {
        let interval = manager.config().apply_interval();
        Self::with_interval(manager, interval)
    }

    pub fn with_interval(manager: Arc<BufferedDocManager>, interval: Duration) -> Self {
        Self {
            manager,
            // tokio rejects a zero period
            interval: interval.max(Duration::from_millis(1)),
        }
    }

    /// Start the worker on the current runtime.
    pub fn spawn(self) -> WorkerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(self.run(shutdown_rx));
        WorkerHandle {
            shutdown: shutdown_tx,
            task,
        }
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>) -> u64 {
        log::info!("Consolidation worker started, interval {:?}", self.interval);

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut passes = 0u64;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.manager.apply().await;
                    passes += 1;
                    match report.outcome {
                        ApplyOutcome::Consolidated { key, updates } => {
                            log::debug!("consolidated {updates} updates for {key}");
                        }
                        ApplyOutcome::Contended(key) => {
                            log::trace!("doc {key} is being consolidated elsewhere");
                        }
                        _ => {}
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        log::info!("Consolidation worker stopped after {passes} passes");
        passes
    }
}

/// Handle to a running [`ConsolidationWorker`].
pub struct WorkerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<u64>,
}

impl WorkerHandle {
    /// Stop after the pass in flight, if any. Returns the number of passes run.
    pub async fn shutdown(self) -> u64 {
        let _ = self.shutdown.send(true);
        match self.task.await {
            Ok(passes) => passes,
            Err(e) => {
                log::error!("Consolidation worker task failed: {e}");
                0
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
