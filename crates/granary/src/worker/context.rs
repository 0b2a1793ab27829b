//! Shared worker context: queue access, CAS surface, liveness, dedup.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use granary_api::{
    ActionKey, ActionResult, Code, Digest, ExecutionStage, Operation, QueueEntry, QueuedOperation,
    Status,
};
use granary_backplane::{Backplane, Retrier};
use granary_cas::{BlobSource, ExecFileSystem};
use prost::Message;
use tracing::{info, warn};

use crate::poller::Poller;
use crate::queue_service::OperationQueueService;

#[derive(Clone, Debug)]
pub struct WorkerConfig {
    /// Worker name, typically `host:port`.
    pub name: String,
    pub input_fetch_width: usize,
    pub execute_width: usize,
    pub report_width: usize,
    /// Liveness poll period for claimed operations.
    pub operation_poll_period: Duration,
    /// Applied when an action carries no timeout.
    pub default_action_timeout: Duration,
    /// Ceiling on action timeouts; zero disables the check.
    pub maximum_action_timeout: Duration,
    /// Stdout/stderr at most this large stay inline in the ActionResult.
    pub inline_content_limit: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "localhost:8981".to_string(),
            input_fetch_width: 2,
            execute_width: 2,
            report_width: 2,
            operation_poll_period: Duration::from_secs(10),
            default_action_timeout: Duration::from_secs(600),
            maximum_action_timeout: Duration::from_secs(3600),
            inline_content_limit: 1024,
        }
    }
}

pub struct WorkerContext {
    pub config: WorkerConfig,
    pub queue_service: Arc<OperationQueueService>,
    pub backplane: Arc<dyn Backplane>,
    pub exec_fs: Arc<ExecFileSystem>,
    /// Serves blobs this worker does not hold locally.
    pub remote_source: Arc<dyn BlobSource>,
    retrier: Retrier,
    active_operations: Mutex<HashMap<String, QueueEntry>>,
}

impl WorkerContext {
    pub fn new(
        config: WorkerConfig,
        queue_service: Arc<OperationQueueService>,
        backplane: Arc<dyn Backplane>,
        exec_fs: Arc<ExecFileSystem>,
        remote_source: Arc<dyn BlobSource>,
    ) -> Arc<WorkerContext> {
        Arc::new(WorkerContext {
            config,
            queue_service,
            backplane,
            exec_fs,
            remote_source,
            retrier: Retrier::default(),
            active_operations: Mutex::new(HashMap::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// One match attempt: claim a queue entry and register it as active.
    /// Duplicate claims of a name this worker already runs are dropped.
    pub async fn match_entry(&self) -> Result<Option<QueueEntry>, Status> {
        let entry = match self.queue_service.take().await? {
            None => return Ok(None),
            Some(entry) => entry,
        };
        let operation_name = entry
            .execute_entry
            .as_ref()
            .map(|execute_entry| execute_entry.operation_name.clone())
            .unwrap_or_default();
        let duplicate = self
            .active_operations
            .lock()
            .expect("active operations poisoned")
            .insert(operation_name.clone(), entry.clone())
            .is_some();
        if duplicate {
            warn!(operation = operation_name, "matched duplicate operation");
            return Ok(None);
        }
        Ok(Some(entry))
    }

    pub fn deactivate(&self, operation_name: &str) {
        self.active_operations
            .lock()
            .expect("active operations poisoned")
            .remove(operation_name);
    }

    /// Drop the claim and zero its deadline so the dispatched monitor
    /// requeues it immediately instead of after the full timeout.
    pub async fn requeue(&self, operation_name: &str) {
        let entry = self
            .active_operations
            .lock()
            .expect("active operations poisoned")
            .remove(operation_name);
        let entry = match entry {
            Some(entry) => entry,
            None => return,
        };
        match self
            .queue_service
            .poll(&entry, ExecutionStage::Queued, 0)
            .await
        {
            Ok(_) => info!(operation = operation_name, "fast requeue requested"),
            Err(err) => {
                // The dispatched monitor will still requeue on the normal
                // deadline.
                warn!(operation = operation_name, error = %err, "fast requeue failed");
            }
        }
    }

    /// Start the liveness poller for a claimed entry at the given stage.
    pub fn resume_poller(
        self: &Arc<Self>,
        poller: &Poller,
        entry: QueueEntry,
        stage: ExecutionStage,
        on_failure: impl Fn() + Send + Sync + 'static,
    ) {
        let context = self.clone();
        let on_failure = Arc::new(on_failure);
        let on_expiration = on_failure.clone();
        poller.resume(
            move || {
                let context = context.clone();
                let entry = entry.clone();
                let on_failure = on_failure.clone();
                async move {
                    let live = match context
                        .queue_service
                        .poll(&entry, stage, OperationQueueService::next_requeue_at())
                        .await
                    {
                        Ok(live) => live,
                        Err(err) => {
                            warn!(error = %err, "liveness poll errored");
                            true
                        }
                    };
                    if !live {
                        (*on_failure)();
                    }
                    live
                }
            },
            move || (*on_expiration)(),
            Instant::now() + Duration::from_secs(10 * 24 * 3600),
        );
    }

    /// Read a blob, filling the local cache from peers on a miss.
    pub async fn fetch_blob(&self, digest: &Digest) -> Result<Bytes, Status> {
        let cache = self.exec_fs.file_cache();
        match cache.get_blob(digest).await {
            Ok(blob) => return Ok(blob),
            Err(err) if err.code() == Code::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        // Pull from a peer and keep a local copy for future actions.
        let mut stream = self.remote_source.open(digest, 0).await?;
        use futures::TryStreamExt;
        let mut blob = Vec::with_capacity(digest.size_bytes as usize);
        while let Some(chunk) = stream.try_next().await.map_err(Status::from)? {
            blob.extend_from_slice(&chunk);
        }
        let blob = Bytes::from(blob);
        if let Err(err) = cache.put_blob(digest, blob.clone()).await {
            warn!(blob = %digest, error = %err, "failed to cache fetched blob");
        }
        Ok(blob)
    }

    /// Fetch and decode the queued operation for an entry.
    pub async fn get_queued_operation(
        &self,
        entry: &QueueEntry,
    ) -> Result<Option<QueuedOperation>, Status> {
        let digest = match entry.queued_operation_digest.as_ref() {
            Some(digest) => digest,
            None => return Ok(None),
        };
        let blob = match self.fetch_blob(digest).await {
            Ok(blob) => blob,
            Err(status) if status.code == Code::NotFound => return Ok(None),
            Err(status) => return Err(status),
        };
        match QueuedOperation::decode(blob.as_ref()) {
            Ok(queued_operation) => Ok(Some(queued_operation)),
            Err(err) => {
                warn!(blob = %digest, error = %err, "invalid queued operation");
                Ok(None)
            }
        }
    }

    pub async fn put_operation(&self, operation: &Operation) -> Result<bool, Status> {
        self.queue_service.put(operation).await
    }

    pub async fn put_action_result(
        &self,
        key: &ActionKey,
        result: &ActionResult,
    ) -> Result<(), Status> {
        self.retrier
            .execute(|| self.backplane.put_action_result(key, result))
            .await?;
        Ok(())
    }
}
