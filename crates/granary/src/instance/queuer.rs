//! Background operation queuer.
//!
//! Pulls execute entries from the prequeue and promotes each one to the
//! ready queue: cache check, action/command/tree fetch, validation, queued
//! operation upload, queue. A keep-alive poller extends the operation's
//! liveness while the transform runs, and a semaphore caps how many
//! transforms are in flight.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Semaphore;
use tracing::{debug, error, info};

use granary_api::ExecuteEntry;

use crate::instance::Instance;
use crate::poller::Poller;

pub struct OperationQueuer {
    pub instance: Arc<Instance>,
}

impl OperationQueuer {
    /// Run the queuer loop until shutdown.
    pub async fn run(self, shutdown: tokio_util::sync::WaitForCancellationFutureOwned) {
        let config = self.instance.config().clone();
        info!(
            transform_concurrency = config.transform_concurrency,
            "operation queuer started"
        );
        let tokens = Arc::new(Semaphore::new(config.transform_concurrency));

        let mut shutdown = std::pin::pin!(shutdown);
        loop {
            let token = tokio::select! {
                _ = &mut shutdown => break,
                token = tokens.clone().acquire_owned() => {
                    token.expect("transform semaphore closed")
                }
            };

            let entry = tokio::select! {
                _ = &mut shutdown => break,
                entry = self.iterate_deprequeue() => entry,
            };
            let entry = match entry {
                Some(entry) => entry,
                None => continue,
            };

            let instance = self.instance.clone();
            tokio::spawn(async move {
                let _token = token;
                queue_one(instance, entry).await;
            });
        }
        info!("operation queuer exiting");
    }

    /// One prequeue pop, waiting for queue admission first.
    async fn iterate_deprequeue(&self) -> Option<ExecuteEntry> {
        loop {
            match self.instance.backplane().can_queue().await {
                Ok(true) => break,
                Ok(false) => {
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                }
                Err(err) => {
                    error!(error = %err, "canQueue probe failed");
                    tokio::time::sleep(std::time::Duration::from_millis(1000)).await;
                    return None;
                }
            }
        }
        match self.instance.backplane().deprequeue_operation().await {
            Ok(entry) => entry,
            Err(err) => {
                error!(error = %err, "deprequeue failed");
                None
            }
        }
    }
}

/// Queue a single execute entry under its keep-alive poller.
async fn queue_one(instance: Arc<Instance>, entry: ExecuteEntry) {
    let operation_name = entry.operation_name.clone();
    debug!(operation = operation_name, "queueing");

    let config = instance.config().clone();
    let poller = Poller::new(config.queueing_poll_period);
    let poll_instance = instance.clone();
    let poll_name = operation_name.clone();
    poller.resume(
        move || {
            let instance = poll_instance.clone();
            let operation_name = poll_name.clone();
            async move {
                match instance.queueing(&operation_name).await {
                    Ok(()) => true,
                    Err(err) => {
                        error!(operation = operation_name, error = %err, "error polling for queueing");
                        // Transient: keep the transform alive, the marker
                        // will refresh on the next period.
                        true
                    }
                }
            }
        },
        || {},
        Instant::now() + config.queueing_deadline,
    );

    match instance.queue(&entry, &poller).await {
        Ok(()) => info!(operation = operation_name, "successfully queued"),
        Err(err) => error!(operation = operation_name, error = %err, "error queueing"),
    }
    poller.pause();
}
