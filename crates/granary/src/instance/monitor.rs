//! Dispatched-operation monitor.
//!
//! Sweeps the dispatched map on an interval and requeues any operation
//! whose deadline has passed (worker death, lost claim). Also trims the
//! completed list to its retention size and runs the watcher-hub sweep.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{error, info, warn};

use crate::instance::Instance;

#[derive(Clone, Debug)]
pub struct DispatchedMonitorConfig {
    pub interval: Duration,
}

impl Default for DispatchedMonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
        }
    }
}

pub struct DispatchedMonitor {
    pub instance: Arc<Instance>,
    pub config: DispatchedMonitorConfig,
}

impl DispatchedMonitor {
    /// Run the sweep loop until shutdown.
    pub async fn run(self, shutdown: tokio_util::sync::WaitForCancellationFutureOwned) {
        info!(
            interval_ms = self.config.interval.as_millis() as u64,
            "dispatched monitor started"
        );
        let mut shutdown = std::pin::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("dispatched monitor shutting down");
                    break;
                }
                _ = tokio::time::sleep(self.config.interval) => {
                    self.sweep().await;
                }
            }
        }
    }

    /// One pass over the dispatched map plus maintenance.
    pub async fn sweep(&self) {
        let now = Utc::now().timestamp_millis();
        let dispatched = match self.instance.backplane().get_dispatched_operations().await {
            Ok(dispatched) => dispatched,
            Err(err) => {
                error!(error = %err, "failed to list dispatched operations");
                return;
            }
        };

        for dispatched_operation in dispatched {
            if dispatched_operation.requeue_at >= now {
                continue;
            }
            let queue_entry = match dispatched_operation.queue_entry.as_ref() {
                Some(queue_entry) => queue_entry,
                None => {
                    warn!(
                        operation = dispatched_operation.name,
                        "dispatched operation without queue entry; deleting"
                    );
                    if let Err(err) = self
                        .instance
                        .backplane()
                        .delete_operation(&dispatched_operation.name)
                        .await
                    {
                        error!(operation = dispatched_operation.name, error = %err, "delete failed");
                    }
                    continue;
                }
            };
            info!(
                operation = dispatched_operation.name,
                requeue_at = dispatched_operation.requeue_at,
                "requeueing overdue dispatched operation"
            );
            if let Err(err) = self.instance.requeue_operation(queue_entry).await {
                // requeue_operation error-completes persistent failures;
                // nothing further to do beyond the record.
                error!(operation = dispatched_operation.name, error = %err, "requeue failed");
            }
        }

        let retention = self.instance.config().completed_retention;
        if let Err(err) = self
            .instance
            .backplane()
            .destroy_oldest_completed_operations(retention)
            .await
        {
            error!(error = %err, "completed-list trim failed");
        }

        self.instance.watcher_hub().sweep().await;
    }
}
