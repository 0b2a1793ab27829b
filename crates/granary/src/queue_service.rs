//! The operation queue surface workers use instead of raw backplane access.
//!
//! `take` claims a queue entry, `put` reports operation state (validated
//! before it is accepted), `poll` heartbeats a claim. The wire transport
//! wrapping this service is out of scope; workers in-process call it
//! directly.

use std::sync::Arc;

use chrono::Utc;
use granary_api::{ExecutionStage, Operation, QueueEntry, Status};
use granary_backplane::{Backplane, Retrier, DISPATCH_DEADLINE_MILLIS};
use tracing::info;

pub struct OperationQueueService {
    backplane: Arc<dyn Backplane>,
    retrier: Retrier,
}

impl OperationQueueService {
    pub fn new(backplane: Arc<dyn Backplane>) -> OperationQueueService {
        OperationQueueService {
            backplane,
            retrier: Retrier::default(),
        }
    }

    /// Claim the next ready queue entry; `None` when the queue stayed empty
    /// for the poll window.
    pub async fn take(&self) -> Result<Option<QueueEntry>, Status> {
        let entry = self
            .retrier
            .execute(|| self.backplane.dispatch_operation())
            .await?;
        Ok(entry)
    }

    /// Report operation state. Only executing-stage updates and done
    /// operations are accepted; anything else is the queue's business, not
    /// the worker's.
    pub async fn put(&self, operation: &Operation) -> Result<bool, Status> {
        let stage = operation.stage();
        if operation.done {
            let accepted = self
                .retrier
                .execute(|| self.backplane.put_operation(operation, ExecutionStage::Completed))
                .await?;
            if accepted {
                info!(operation = %operation.name, "operation completed");
            }
            return Ok(accepted);
        }
        if stage != ExecutionStage::Executing {
            return Err(Status::invalid_argument(format!(
                "worker may not report stage {stage:?} for {}",
                operation.name
            )));
        }
        let accepted = self
            .retrier
            .execute(|| self.backplane.put_operation(operation, ExecutionStage::Executing))
            .await?;
        Ok(accepted)
    }

    /// Renew the dispatch deadline; false when the claim was lost.
    pub async fn poll(
        &self,
        entry: &QueueEntry,
        stage: ExecutionStage,
        requeue_at: i64,
    ) -> Result<bool, Status> {
        let live = self
            .retrier
            .execute(|| self.backplane.poll_operation(entry, stage, requeue_at))
            .await?;
        Ok(live)
    }

    /// The deadline a fresh poll should establish.
    pub fn next_requeue_at() -> i64 {
        Utc::now().timestamp_millis() + DISPATCH_DEADLINE_MILLIS
    }
}

#[cfg(test)]
mod tests {
    use granary_api::{ExecuteEntry, ExecuteOperationMetadata};
    use granary_backend_memory::MemoryBackplane;
    use granary_backplane::{ChannelMessage, OperationListener};

    use super::*;

    struct NullListener;

    impl OperationListener for NullListener {
        fn on_message(&self, _channel: &str, _message: ChannelMessage) {}
        fn on_reset(&self, _channel: &str, _operation: Option<Operation>) {}
    }

    async fn service() -> (OperationQueueService, Arc<MemoryBackplane>) {
        let backplane = Arc::new(MemoryBackplane::default());
        backplane
            .start(Arc::new(NullListener))
            .await
            .expect("start");
        (OperationQueueService::new(backplane.clone()), backplane)
    }

    fn queued(name: &str) -> (QueueEntry, Operation) {
        let entry = QueueEntry {
            execute_entry: Some(ExecuteEntry {
                operation_name: name.to_string(),
                ..Default::default()
            }),
            queued_operation_digest: None,
        };
        let operation = Operation {
            name: name.to_string(),
            ..Default::default()
        };
        (entry, operation)
    }

    #[tokio::test]
    async fn take_claims_queued_entries() {
        let (service, backplane) = service().await;
        let (entry, operation) = queued("op-take");
        backplane.queue(&entry, &operation).await.expect("queue");

        let taken = service.take().await.expect("take").expect("entry");
        assert_eq!(taken, entry);
        assert!(service.take().await.expect("take again").is_none());
    }

    #[tokio::test]
    async fn put_rejects_queue_owned_stages() {
        let (service, _backplane) = service().await;
        let operation = Operation {
            name: "op-put".to_string(),
            ..Default::default()
        }
        .with_execute_metadata(ExecuteOperationMetadata {
            stage: ExecutionStage::Queued as i32,
            ..Default::default()
        });
        let err = service.put(&operation).await.expect_err("rejected");
        assert_eq!(err.code, granary_api::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn put_accepts_executing_and_done() {
        let (service, backplane) = service().await;
        let (entry, operation) = queued("op-exec");
        backplane.queue(&entry, &operation).await.expect("queue");
        service.take().await.expect("take").expect("entry");

        let executing = operation.clone().with_execute_metadata(ExecuteOperationMetadata {
            stage: ExecutionStage::Executing as i32,
            ..Default::default()
        });
        assert!(service.put(&executing).await.expect("executing"));

        let done = Operation {
            done: true,
            ..executing.clone()
        };
        assert!(service.put(&done).await.expect("done"));
        assert!(backplane
            .get_dispatched_operations()
            .await
            .expect("dispatched")
            .is_empty());
    }

    #[tokio::test]
    async fn poll_reports_claim_loss() {
        let (service, backplane) = service().await;
        let (entry, operation) = queued("op-poll");
        backplane.queue(&entry, &operation).await.expect("queue");
        service.take().await.expect("take").expect("entry");

        assert!(service
            .poll(
                &entry,
                ExecutionStage::Executing,
                OperationQueueService::next_requeue_at()
            )
            .await
            .expect("poll"));
        backplane
            .complete_operation("op-poll")
            .await
            .expect("complete");
        assert!(!service
            .poll(
                &entry,
                ExecutionStage::Executing,
                OperationQueueService::next_requeue_at()
            )
            .await
            .expect("poll"));
    }
}
