//! Backlog reconciliation worker.
//!
//! Runs the scheduling backlog loop on a periodic interval. Routers that
//! keep failing stay in the backlog and retry every tick; there is no
//! cutoff and no backoff, so a router becomes hosted as soon as capacity
//! appears.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info};

use super::coordinator::SchedulingCoordinator;

/// Worker that periodically reprocesses the scheduling backlog.
pub struct BacklogWorker {
    coordinator: Arc<SchedulingCoordinator>,
    interval: Duration,
}

impl BacklogWorker {
    /// Create a new backlog worker.
    pub fn new(coordinator: Arc<SchedulingCoordinator>, interval: Duration) -> Self {
        Self {
            coordinator,
            interval,
        }
    }

    /// Run the backlog loop until shutdown is signaled.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            "Starting backlog worker"
        );

        let mut interval = tokio::time::interval(self.interval);
        // Don't immediately tick on startup - wait for first interval
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.run_tick().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Backlog worker shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Run a single backlog pass.
    async fn run_tick(&self) {
        match self.coordinator.process_backlog().await {
            Ok(stats) => {
                if stats.scheduled > 0 || stats.failed > 0 {
                    info!(
                        processed = stats.processed,
                        scheduled = stats.scheduled,
                        failed = stats.failed,
                        "Backlog pass complete"
                    );
                }
            }
            Err(e) => {
                error!(error = %e, "Backlog processing failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::registry::CapabilityRegistry;
    use crate::store::BindingStore;
    use crate::translog::TransactionLog;

    #[tokio::test]
    async fn test_worker_shuts_down_on_signal() {
        let store = Arc::new(BindingStore::open_in_memory().unwrap());
        let registry = Arc::new(CapabilityRegistry::new());
        let translog = Arc::new(TransactionLog::new(false, 1, 1));
        let coordinator = Arc::new(SchedulingCoordinator::new(
            store,
            registry,
            translog,
            "namespace_router",
        ));
        let worker = BacklogWorker::new(coordinator, Duration::from_millis(10));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move { worker.run(shutdown_rx).await });

        tokio::time::sleep(Duration::from_millis(30)).await;
        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("worker did not shut down")
            .unwrap();
    }
}
