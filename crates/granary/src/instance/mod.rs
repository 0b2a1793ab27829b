//! Frontend shard scheduler.
//!
//! Validates, transforms, caches, enqueues and watches operations. Blob
//! reads fan out across the workers recorded in the blob-location index,
//! with failover and a correction pass when the index disagrees with
//! reality.

pub mod monitor;
pub mod queuer;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::Utc;
use futures::future::join_all;
use prost::Message;
use rand::seq::SliceRandom;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use granary_api::validation::{validate_queued_operation, MISSING_ACTION, MISSING_INPUT};
use granary_api::{
    operation, Action, ActionKey, Code, Command, Digest, DigestUtil, Directory, ExecuteEntry,
    ExecuteOperationMetadata, ExecuteResponse, ExecutionPolicy, ExecutionStage, Operation,
    QueueEntry, QueuedOperation, QueuedOperationMetadata, RequestMetadata, ResultsCachePolicy,
    Status,
};
use granary_backplane::{operation_channel, Backplane, Retrier};

use crate::poller::Poller;
use crate::stubs::WorkerStubs;
use crate::watchers::{WatchHandle, Watcher, WatcherHub};

#[derive(Clone, Debug)]
pub struct InstanceConfig {
    /// Instance name; prefixes operation names.
    pub name: String,
    /// Watcher TTL; the hub's `next_expires_at` policy.
    pub watcher_ttl: Duration,
    /// Deadline on the action-cache check during queueing.
    pub cache_check_deadline: Duration,
    /// How long a request-metadata key forces `skip_cache_lookup` on retry.
    pub retry_cache_ttl: Duration,
    /// Cap on concurrent prequeue transforms.
    pub transform_concurrency: usize,
    /// Keep-alive poll period while an operation is being queued.
    pub queueing_poll_period: Duration,
    /// Absolute deadline on one queueing transform.
    pub queueing_deadline: Duration,
    /// Completed operations retained in the backplane.
    pub completed_retention: u64,
    /// In-process message cache capacity (actions, commands, directories).
    pub message_cache_capacity: usize,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            watcher_ttl: Duration::from_secs(10),
            cache_check_deadline: Duration::from_secs(60),
            retry_cache_ttl: Duration::from_secs(300),
            transform_concurrency: 256,
            queueing_poll_period: Duration::from_secs(5),
            queueing_deadline: Duration::from_secs(300),
            completed_retention: 10_000,
            message_cache_capacity: 64 * 1024,
        }
    }
}

/// Bounded decode cache for fetched messages.
struct MessageCache<M> {
    capacity: usize,
    entries: Mutex<(HashMap<Digest, M>, VecDeque<Digest>)>,
}

impl<M: Clone> MessageCache<M> {
    fn new(capacity: usize) -> MessageCache<M> {
        MessageCache {
            capacity,
            entries: Mutex::new((HashMap::new(), VecDeque::new())),
        }
    }

    fn get(&self, digest: &Digest) -> Option<M> {
        self.entries
            .lock()
            .expect("message cache poisoned")
            .0
            .get(digest)
            .cloned()
    }

    fn insert(&self, digest: Digest, message: M) {
        let mut entries = self.entries.lock().expect("message cache poisoned");
        if entries.0.insert(digest.clone(), message).is_none() {
            entries.1.push_back(digest);
        }
        while entries.1.len() > self.capacity {
            if let Some(evicted) = entries.1.pop_front() {
                entries.0.remove(&evicted);
            }
        }
    }
}

/// Request-metadata keys recently served from the action cache. A retry
/// carrying the same metadata skips the cache lookup, so a cached failure
/// cannot be served in a retry loop.
struct RecentExecutions {
    ttl: Duration,
    entries: Mutex<HashMap<RequestMetadata, Instant>>,
}

impl RecentExecutions {
    fn new(ttl: Duration) -> RecentExecutions {
        RecentExecutions {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn record(&self, metadata: &RequestMetadata) {
        let mut entries = self.entries.lock().expect("recent executions poisoned");
        let now = Instant::now();
        entries.retain(|_, inserted| now.duration_since(*inserted) < self.ttl);
        entries.insert(metadata.clone(), now);
    }

    fn contains(&self, metadata: &RequestMetadata) -> bool {
        let entries = self.entries.lock().expect("recent executions poisoned");
        entries
            .get(metadata)
            .map(|inserted| inserted.elapsed() < self.ttl)
            .unwrap_or(false)
    }
}

pub struct Instance {
    config: InstanceConfig,
    backplane: Arc<dyn Backplane>,
    stubs: Arc<WorkerStubs>,
    hub: Arc<WatcherHub>,
    retrier: Retrier,
    action_cache: MessageCache<Action>,
    command_cache: MessageCache<Command>,
    directory_cache: MessageCache<Directory>,
    recent_cache_served: RecentExecutions,
}

impl Instance {
    pub fn new(
        config: InstanceConfig,
        backplane: Arc<dyn Backplane>,
        stubs: Arc<WorkerStubs>,
    ) -> Arc<Instance> {
        let hub = WatcherHub::new(backplane.clone(), config.watcher_ttl);
        Arc::new(Instance {
            retrier: Retrier::default(),
            action_cache: MessageCache::new(config.message_cache_capacity),
            command_cache: MessageCache::new(config.message_cache_capacity),
            directory_cache: MessageCache::new(config.message_cache_capacity),
            recent_cache_served: RecentExecutions::new(config.retry_cache_ttl),
            backplane,
            stubs,
            hub,
            config,
        })
    }

    pub fn config(&self) -> &InstanceConfig {
        &self.config
    }

    pub fn backplane(&self) -> &Arc<dyn Backplane> {
        &self.backplane
    }

    pub fn watcher_hub(&self) -> &Arc<WatcherHub> {
        &self.hub
    }

    /// Start the backplane with this instance's watcher hub listening.
    pub async fn start(self: &Arc<Self>) -> Result<(), Status> {
        self.backplane.start(self.hub.clone()).await?;
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), Status> {
        self.backplane.stop().await?;
        self.stubs.invalidate_all();
        Ok(())
    }

    fn create_operation_name(&self) -> String {
        let uuid = Uuid::new_v4();
        if self.config.name.is_empty() {
            format!("operations/{uuid}")
        } else {
            format!("{}/operations/{uuid}", self.config.name)
        }
    }

    /// Accept an execute request: prequeue the entry and register the
    /// watcher. Returns the watch handle unless the operation is already
    /// terminal.
    pub async fn execute(
        self: &Arc<Self>,
        action_digest: Digest,
        mut skip_cache_lookup: bool,
        execution_policy: Option<ExecutionPolicy>,
        results_cache_policy: Option<ResultsCachePolicy>,
        request_metadata: RequestMetadata,
        watcher: Arc<dyn Watcher>,
    ) -> Result<Option<WatchHandle>, Status> {
        if !self.backplane.can_prequeue().await? {
            return Err(Status::unavailable("too many jobs pending"));
        }

        let operation_name = self.create_operation_name();
        if self.recent_cache_served.contains(&request_metadata) {
            debug!(
                operation = operation_name,
                "skip_cache_lookup forced on retry"
            );
            skip_cache_lookup = true;
        }

        let stdout_stream_name = format!("{operation_name}/streams/stdout");
        let stderr_stream_name = format!("{operation_name}/streams/stderr");
        let execute_entry = ExecuteEntry {
            operation_name: operation_name.clone(),
            action_digest: Some(action_digest.clone()),
            skip_cache_lookup,
            execution_policy,
            results_cache_policy,
            request_metadata: Some(request_metadata),
            stdout_stream_name: stdout_stream_name.clone(),
            stderr_stream_name: stderr_stream_name.clone(),
        };
        let operation = Operation {
            name: operation_name.clone(),
            ..Default::default()
        }
        .with_execute_metadata(ExecuteOperationMetadata {
            stage: ExecutionStage::Unknown as i32,
            action_digest: Some(action_digest),
            stdout_stream_name,
            stderr_stream_name,
        });
        self.backplane.prequeue(&execute_entry, &operation).await?;
        self.watch_operation(&operation_name, watcher).await
    }

    /// Observe the current stripped operation and, unless it is terminal,
    /// subscribe for transitions.
    pub async fn watch_operation(
        self: &Arc<Self>,
        operation_name: &str,
        watcher: Arc<dyn Watcher>,
    ) -> Result<Option<WatchHandle>, Status> {
        let operation = self.backplane.get_operation(operation_name).await?;
        let operation = match operation {
            None => {
                watcher.observe(None);
                return Ok(None);
            }
            Some(operation) => operation,
        };
        watcher.observe(Some(operation.stripped()));
        if operation.done {
            return Ok(None);
        }

        let channel = operation_channel(operation_name);
        let handle = self.hub.watch(&channel, watcher).await?;
        // The operation may have completed between the read and the
        // subscription; deliver the terminal state through the hub so every
        // remaining watcher sees it exactly once.
        match self.backplane.get_operation(operation_name).await? {
            Some(current) if current.done => {
                use granary_backplane::{ChannelMessage, OperationListener};
                self.hub
                    .on_message(&channel, ChannelMessage::Operation(current.stripped()));
                Ok(None)
            }
            Some(_) => Ok(Some(handle)),
            None => {
                use granary_backplane::{ChannelMessage, OperationListener};
                self.hub.on_message(&channel, ChannelMessage::Removed);
                Ok(None)
            }
        }
    }

    /// Queue one prequeued entry: cache check, transform, validate, upload,
    /// queue. The poller keeps the operation alive for the duration.
    pub async fn queue(&self, execute_entry: &ExecuteEntry, poller: &Poller) -> Result<(), Status> {
        let action_digest = execute_entry
            .action_digest
            .clone()
            .ok_or_else(|| Status::invalid_argument("execute entry without action digest"))?;
        let operation = Operation {
            name: execute_entry.operation_name.clone(),
            ..Default::default()
        }
        .with_execute_metadata(ExecuteOperationMetadata {
            stage: ExecutionStage::Unknown as i32,
            action_digest: Some(action_digest.clone()),
            stdout_stream_name: execute_entry.stdout_stream_name.clone(),
            stderr_stream_name: execute_entry.stderr_stream_name.clone(),
        });

        let started = Instant::now();
        let cached = if execute_entry.skip_cache_lookup {
            false
        } else {
            self.check_cache(execute_entry, &operation).await
        };
        let check_cache_elapsed = started.elapsed();
        if cached {
            poller.pause();
            info!(
                operation = %operation.name,
                check_cache_us = check_cache_elapsed.as_micros() as u64,
                "served from action cache"
            );
            return Ok(());
        }

        match self
            .transform_and_queue(execute_entry, &operation, started, check_cache_elapsed)
            .await
        {
            Ok(()) => Ok(()),
            Err(status) => {
                poller.pause();
                self.error_operation(&operation, &status).await;
                Err(status)
            }
        }
    }

    /// Action-cache probe under its own deadline; cache hits complete the
    /// operation with `cached_result`. Errors degrade to a miss.
    async fn check_cache(&self, execute_entry: &ExecuteEntry, operation: &Operation) -> bool {
        let result = tokio::time::timeout(
            self.config.cache_check_deadline,
            self.check_cache_inner(execute_entry, operation),
        )
        .await;
        match result {
            Ok(Ok(cached)) => cached,
            Ok(Err(status)) => {
                error!(operation = %operation.name, error = %status, "cache check failed");
                false
            }
            Err(_) => {
                warn!(operation = %operation.name, "cache check deadline exceeded");
                false
            }
        }
    }

    async fn check_cache_inner(
        &self,
        execute_entry: &ExecuteEntry,
        operation: &Operation,
    ) -> Result<bool, Status> {
        let action_digest = execute_entry
            .action_digest
            .clone()
            .ok_or_else(|| Status::invalid_argument("execute entry without action digest"))?;
        let mut metadata = operation.execute_metadata().cloned().unwrap_or_default();
        metadata.stage = ExecutionStage::CacheCheck as i32;
        self.backplane
            .put_operation(
                &operation.clone().with_execute_metadata(metadata.clone()),
                ExecutionStage::CacheCheck,
            )
            .await?;

        let action_key = ActionKey(action_digest);
        let action_result = self.backplane.get_action_result(&action_key).await?;
        let action_result = match action_result {
            None => return Ok(false),
            Some(action_result) => action_result,
        };

        if let Some(request_metadata) = execute_entry.request_metadata.as_ref() {
            self.recent_cache_served.record(request_metadata);
        }

        metadata.stage = ExecutionStage::Completed as i32;
        let completed = Operation {
            done: true,
            result: Some(operation::Result::Response(ExecuteResponse {
                result: Some(action_result),
                cached_result: true,
                status: Some(Status::ok().to_proto()),
            })),
            ..operation.clone()
        }
        .with_execute_metadata(metadata);
        self.backplane
            .put_operation(&completed, ExecutionStage::Completed)
            .await?;
        Ok(true)
    }

    async fn transform_and_queue(
        &self,
        execute_entry: &ExecuteEntry,
        operation: &Operation,
        started: Instant,
        check_cache_elapsed: Duration,
    ) -> Result<(), Status> {
        let action_digest = execute_entry
            .action_digest
            .clone()
            .ok_or_else(|| Status::invalid_argument("execute entry without action digest"))?;

        let transform_started = Instant::now();
        let action = self
            .expect_action(&action_digest)
            .await?
            .ok_or_else(|| Status::missing_blob(&action_digest, MISSING_ACTION))?;
        let queued_operation = self.transform_queued_operation(&action).await?;
        let transform_elapsed = transform_started.elapsed();

        let validate_started = Instant::now();
        validate_queued_operation(&action_digest, &queued_operation)?;
        let validate_elapsed = validate_started.elapsed();

        let upload_started = Instant::now();
        let queued_operation_blob = Bytes::from(queued_operation.encode_to_vec());
        let queued_operation_digest = DigestUtil.compute(&queued_operation_blob);
        self.upload_blob(&queued_operation_digest, queued_operation_blob)
            .await?;
        let upload_elapsed = upload_started.elapsed();

        let queued_metadata = QueuedOperationMetadata {
            execute_operation_metadata: Some(ExecuteOperationMetadata {
                stage: ExecutionStage::Queued as i32,
                action_digest: Some(action_digest),
                stdout_stream_name: execute_entry.stdout_stream_name.clone(),
                stderr_stream_name: execute_entry.stderr_stream_name.clone(),
            }),
            queued_operation_digest: Some(queued_operation_digest.clone()),
            request_metadata: execute_entry.request_metadata.clone(),
        };
        let queue_entry = QueueEntry {
            execute_entry: Some(execute_entry.clone()),
            queued_operation_digest: Some(queued_operation_digest),
        };
        let queue_operation = operation.clone().with_queued_metadata(queued_metadata);

        let queue_started = Instant::now();
        self.ensure_can_queue().await?;
        self.backplane.queue(&queue_entry, &queue_operation).await?;
        info!(
            operation = %operation.name,
            check_cache_us = check_cache_elapsed.as_micros() as u64,
            transform_us = transform_elapsed.as_micros() as u64,
            validate_us = validate_elapsed.as_micros() as u64,
            upload_us = upload_elapsed.as_micros() as u64,
            queue_us = queue_started.elapsed().as_micros() as u64,
            elapsed_us = started.elapsed().as_micros() as u64,
            "operation queued"
        );
        Ok(())
    }

    async fn ensure_can_queue(&self) -> Result<(), Status> {
        while !self.backplane.can_queue().await? {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        Ok(())
    }

    /// Resolve action + command + full directory closure.
    async fn transform_queued_operation(&self, action: &Action) -> Result<QueuedOperation, Status> {
        let command_digest = action
            .command_digest
            .clone()
            .ok_or_else(|| Status::invalid_argument("action has no command digest"))?;
        let command = self.expect_command(&command_digest).await?;
        let directories = match action.input_root_digest.as_ref() {
            Some(input_root) => self.tree_directories(input_root).await?,
            None => Vec::new(),
        };
        Ok(QueuedOperation {
            action: Some(action.clone()),
            command,
            directories,
        })
    }

    /// The directory closure of an input root, through the backplane tree
    /// cache.
    async fn tree_directories(&self, input_root: &Digest) -> Result<Vec<Directory>, Status> {
        if input_root.is_empty() {
            return Ok(Vec::new());
        }
        if let Some(directories) = self.backplane.get_tree(input_root).await? {
            return Ok(directories);
        }

        let mut directories = Vec::new();
        let mut visited: HashSet<Digest> = HashSet::new();
        let mut pending = VecDeque::from([input_root.clone()]);
        while let Some(digest) = pending.pop_front() {
            if digest.is_empty() || !visited.insert(digest.clone()) {
                continue;
            }
            let directory = self
                .expect_directory(&digest)
                .await?
                .ok_or_else(|| Status::missing_blob(&digest, MISSING_INPUT))?;
            for node in &directory.directories {
                if let Some(child) = node.digest.as_ref() {
                    pending.push_back(child.clone());
                }
            }
            directories.push(directory);
        }
        self.backplane.put_tree(input_root, &directories).await?;
        Ok(directories)
    }

    async fn expect_action(&self, digest: &Digest) -> Result<Option<Action>, Status> {
        if let Some(action) = self.action_cache.get(digest) {
            return Ok(Some(action));
        }
        match self.fetch_and_decode::<Action>(digest).await? {
            Some(action) => {
                self.action_cache.insert(digest.clone(), action.clone());
                Ok(Some(action))
            }
            None => Ok(None),
        }
    }

    async fn expect_command(&self, digest: &Digest) -> Result<Option<Command>, Status> {
        if let Some(command) = self.command_cache.get(digest) {
            return Ok(Some(command));
        }
        match self.fetch_and_decode::<Command>(digest).await? {
            Some(command) => {
                self.command_cache.insert(digest.clone(), command.clone());
                Ok(Some(command))
            }
            None => Ok(None),
        }
    }

    async fn expect_directory(&self, digest: &Digest) -> Result<Option<Directory>, Status> {
        if digest.is_empty() {
            return Ok(Some(Directory::default()));
        }
        if let Some(directory) = self.directory_cache.get(digest) {
            return Ok(Some(directory));
        }
        match self.fetch_and_decode::<Directory>(digest).await? {
            Some(directory) => {
                self.directory_cache.insert(digest.clone(), directory.clone());
                Ok(Some(directory))
            }
            None => Ok(None),
        }
    }

    async fn fetch_and_decode<M: Message + Default>(
        &self,
        digest: &Digest,
    ) -> Result<Option<M>, Status> {
        let blob = match self.get_blob(digest, 0, 0).await {
            Ok(blob) => blob,
            Err(status) if status.code == Code::NotFound => return Ok(None),
            Err(status) => return Err(status),
        };
        let message = M::decode(blob.as_ref())
            .map_err(|err| Status::internal(format!("failed to decode {digest}: {err}")))?;
        Ok(Some(message))
    }

    /// Which of `digests` no worker holds. Workers are tried in shuffled
    /// order, each narrowing the missing set; unreachable workers are
    /// removed from the farm.
    pub async fn find_missing_blobs(&self, digests: &[Digest]) -> Result<Vec<Digest>, Status> {
        let mut missing: Vec<Digest> = digests
            .iter()
            .filter(|digest| !digest.is_empty())
            .cloned()
            .collect();
        if missing.is_empty() {
            return Ok(Vec::new());
        }

        let mut workers: VecDeque<String> = {
            let mut workers: Vec<String> =
                self.backplane.get_workers().await?.into_iter().collect();
            workers.shuffle(&mut rand::thread_rng());
            workers.into()
        };
        if workers.is_empty() {
            return Ok(missing);
        }

        let request_id = Uuid::new_v4();
        let original_size = missing.len();
        let mut responses: Vec<(String, Duration, Option<Status>, usize)> = Vec::new();
        while let Some(worker) = workers.pop_front() {
            let hop_started = Instant::now();
            match self.stubs.get(&worker).find_missing_blobs(&missing).await {
                Ok(still_missing) => {
                    responses.push((worker, hop_started.elapsed(), None, still_missing.len()));
                    missing = still_missing;
                    if missing.is_empty() {
                        return Ok(missing);
                    }
                }
                Err(status) => {
                    responses.push((
                        worker.clone(),
                        hop_started.elapsed(),
                        Some(status.clone()),
                        missing.len(),
                    ));
                    match status.code {
                        Code::Unavailable | Code::Unimplemented => {
                            self.remove_malfunctioning_worker(&worker, &status, "findMissingBlobs")
                                .await;
                        }
                        Code::DeadlineExceeded => {
                            for (worker, elapsed, error, still_missing) in &responses {
                                warn!(
                                    request_id = %request_id,
                                    worker,
                                    still_missing,
                                    original_size,
                                    elapsed_us = elapsed.as_micros() as u64,
                                    error = error.as_ref().map(|s| s.to_string()),
                                    "findMissingBlobs deadline exceeded"
                                );
                            }
                            return Err(status);
                        }
                        Code::Cancelled => return Err(status),
                        code if !code.is_retriable() => return Err(status),
                        _ => workers.push_back(worker),
                    }
                }
            }
        }
        Ok(missing)
    }

    /// Read a blob with worker failover. When the location index is empty
    /// (or proves wrong), a single correction pass polls every worker and
    /// repairs the index before the final verdict.
    pub async fn get_blob(&self, digest: &Digest, offset: i64, limit: i64) -> Result<Bytes, Status> {
        if digest.is_empty() {
            return Ok(Bytes::new());
        }
        let worker_set = self.backplane.get_workers().await?;
        let location_set = self.backplane.get_blob_location_set(digest).await?;
        let mut candidates: Vec<String> =
            location_set.intersection(&worker_set).cloned().collect();
        candidates.shuffle(&mut rand::thread_rng());
        let mut workers: VecDeque<String> = candidates.into();

        let mut tried_correction = workers.is_empty();
        if tried_correction {
            let found = self
                .correct_missing_blob(digest, &worker_set, &location_set)
                .await?;
            workers = found.into_iter().collect();
        }

        loop {
            while let Some(worker) = workers.pop_front() {
                match self.stubs.get(&worker).get_blob(digest, offset, limit).await {
                    Ok(blob) => return Ok(blob),
                    Err(status) => match status.code {
                        Code::NotFound => {
                            info!(worker, blob = %digest, "worker did not contain blob");
                        }
                        Code::Unavailable => {
                            self.remove_malfunctioning_worker(&worker, &status, "getBlob")
                                .await;
                        }
                        Code::Cancelled => return Err(status),
                        code if code.is_retriable() => workers.push_back(worker),
                        _ => return Err(status),
                    },
                }
            }
            if tried_correction {
                return Err(Status::not_found(format!("blobs/{digest}")));
            }
            tried_correction = true;
            let found = self
                .correct_missing_blob(digest, &worker_set, &location_set)
                .await?;
            workers = found.into_iter().collect();
        }
    }

    /// Poll every worker for a blob and write the observed truth back to
    /// the location index. Returns the workers that hold it.
    pub async fn correct_missing_blob(
        &self,
        digest: &Digest,
        worker_set: &HashSet<String>,
        original_location_set: &HashSet<String>,
    ) -> Result<HashSet<String>, Status> {
        let checks = worker_set.iter().map(|worker| {
            let stub = self.stubs.get(worker);
            let digest = digest.clone();
            let retrier = self.retrier.clone();
            async move {
                let result = retrier
                    .execute(|| {
                        let stub = stub.clone();
                        let digest = digest.clone();
                        async move {
                            stub.find_missing_blobs(std::slice::from_ref(&digest)).await
                        }
                    })
                    .await;
                match result {
                    Ok(missing) => (worker.clone(), missing.is_empty()),
                    Err(status) => {
                        debug!(worker, error = %status, "correction probe failed");
                        (worker.clone(), false)
                    }
                }
            }
        });
        let found: HashSet<String> = join_all(checks)
            .await
            .into_iter()
            .filter(|(_, holds)| *holds)
            .map(|(worker, _)| worker)
            .collect();

        let stale: HashSet<String> = original_location_set
            .intersection(worker_set)
            .filter(|worker| !found.contains(*worker))
            .cloned()
            .collect();
        self.backplane
            .adjust_blob_locations(digest, &found, &stale)
            .await?;
        Ok(found)
    }

    /// Upload a blob to a random worker and record its location.
    pub async fn upload_blob(&self, digest: &Digest, blob: Bytes) -> Result<(), Status> {
        let workers: Vec<String> = self.backplane.get_workers().await?.into_iter().collect();
        let worker = workers
            .choose(&mut rand::thread_rng())
            .cloned()
            .ok_or_else(|| Status::unavailable("no available workers"))?;
        let stub = self.stubs.get(&worker);
        self.retrier
            .execute(|| {
                let stub = stub.clone();
                let digest = digest.clone();
                let blob = blob.clone();
                async move { stub.put_blob(&digest, blob).await }
            })
            .await?;
        self.backplane.add_blob_location(digest, &worker).await?;
        Ok(())
    }

    async fn remove_malfunctioning_worker(&self, worker: &str, status: &Status, context: &str) {
        match self.backplane.remove_worker(worker).await {
            Ok(removed) => {
                if removed {
                    warn!(worker, context, error = %status, "removed malfunctioning worker");
                }
            }
            Err(err) => error!(worker, error = %err, "failed to remove worker"),
        }
        self.stubs.invalidate(worker);
    }

    /// Requeue a dispatched operation whose deadline lapsed. Completed and
    /// cache-servable operations are completed instead; everything else is
    /// re-validated and pushed straight back to the ready queue.
    pub async fn requeue_operation(&self, queue_entry: &QueueEntry) -> Result<(), Status> {
        let execute_entry = queue_entry
            .execute_entry
            .as_ref()
            .ok_or_else(|| Status::invalid_argument("queue entry without execute entry"))?;
        let operation_name = &execute_entry.operation_name;

        let operation = match self.backplane.get_operation(operation_name).await? {
            None => {
                info!(operation = operation_name, "operation no longer exists");
                self.backplane.delete_operation(operation_name).await?;
                return Ok(());
            }
            Some(operation) => operation,
        };
        if operation.done {
            info!(operation = operation_name, "operation has already completed");
            self.backplane.complete_operation(operation_name).await?;
            return Ok(());
        }

        let cached = if execute_entry.skip_cache_lookup {
            false
        } else {
            self.check_cache(execute_entry, &operation).await
        };
        if cached {
            return Ok(());
        }
        self.validate_and_requeue(&operation, execute_entry, queue_entry)
            .await
    }

    /// Re-validate a queue entry, reusing the uploaded queued operation
    /// when it still exists, and move it back to the ready queue.
    async fn validate_and_requeue(
        &self,
        operation: &Operation,
        execute_entry: &ExecuteEntry,
        queue_entry: &QueueEntry,
    ) -> Result<(), Status> {
        let action_digest = execute_entry
            .action_digest
            .clone()
            .ok_or_else(|| Status::invalid_argument("execute entry without action digest"))?;

        let uploaded = match queue_entry.queued_operation_digest.as_ref() {
            Some(digest) => self.fetch_and_decode::<QueuedOperation>(digest).await?,
            None => None,
        };
        let result = match uploaded {
            Some(queued_operation) => {
                // Still uploaded; no need to rebuild or re-upload.
                validate_queued_operation(&action_digest, &queued_operation).map(|()| {
                    let metadata = QueuedOperationMetadata {
                        execute_operation_metadata: Some(ExecuteOperationMetadata {
                            stage: ExecutionStage::Queued as i32,
                            action_digest: Some(action_digest.clone()),
                            stdout_stream_name: execute_entry.stdout_stream_name.clone(),
                            stderr_stream_name: execute_entry.stderr_stream_name.clone(),
                        }),
                        queued_operation_digest: queue_entry.queued_operation_digest.clone(),
                        request_metadata: execute_entry.request_metadata.clone(),
                    };
                    (queue_entry.clone(), metadata)
                })
            }
            None => {
                let action = self
                    .expect_action(&action_digest)
                    .await?
                    .ok_or_else(|| Status::missing_blob(&action_digest, MISSING_ACTION))?;
                let queued_operation = self.transform_queued_operation(&action).await?;
                match validate_queued_operation(&action_digest, &queued_operation) {
                    Err(status) => Err(status),
                    Ok(()) => {
                        let blob = Bytes::from(queued_operation.encode_to_vec());
                        let digest = DigestUtil.compute(&blob);
                        self.upload_blob(&digest, blob).await?;
                        let metadata = QueuedOperationMetadata {
                            execute_operation_metadata: Some(ExecuteOperationMetadata {
                                stage: ExecutionStage::Queued as i32,
                                action_digest: Some(action_digest.clone()),
                                stdout_stream_name: execute_entry.stdout_stream_name.clone(),
                                stderr_stream_name: execute_entry.stderr_stream_name.clone(),
                            }),
                            queued_operation_digest: Some(digest.clone()),
                            request_metadata: execute_entry.request_metadata.clone(),
                        };
                        let entry = QueueEntry {
                            execute_entry: Some(execute_entry.clone()),
                            queued_operation_digest: Some(digest),
                        };
                        Ok((entry, metadata))
                    }
                }
            }
        };

        match result {
            Ok((entry, metadata)) => {
                let queue_operation = operation.clone().with_queued_metadata(metadata);
                self.backplane.queue(&entry, &queue_operation).await?;
                Ok(())
            }
            Err(status) => {
                error!(operation = %operation.name, error = %status, "failed to requeue");
                self.error_operation(operation, &status).await;
                Err(status)
            }
        }
    }

    /// Terminate an operation with an error status.
    pub async fn error_operation(&self, operation: &Operation, status: &Status) {
        let mut metadata = operation.execute_metadata().cloned().unwrap_or_default();
        metadata.stage = ExecutionStage::Completed as i32;
        let errored = Operation {
            done: true,
            result: Some(operation::Result::Error(status.to_proto())),
            ..operation.clone()
        }
        .with_execute_metadata(metadata);
        let put = self
            .retrier
            .execute(|| self.backplane.put_operation(&errored, ExecutionStage::Completed))
            .await;
        if let Err(err) = put {
            error!(operation = %operation.name, error = %err, "failed to error-complete operation");
        }
    }

    /// Client-facing action cache read.
    pub async fn get_action_result(
        &self,
        key: &ActionKey,
    ) -> Result<Option<granary_api::ActionResult>, Status> {
        Ok(self.backplane.get_action_result(key).await?)
    }

    /// Client-facing action cache write (remote cache uploads).
    pub async fn put_action_result(
        &self,
        key: &ActionKey,
        result: &granary_api::ActionResult,
    ) -> Result<(), Status> {
        Ok(self.backplane.put_action_result(key, result).await?)
    }

    /// Keep-alive for an operation being transformed: refreshes the
    /// backplane queueing marker and extends local watcher deadlines.
    pub async fn queueing(&self, operation_name: &str) -> Result<(), Status> {
        self.backplane.queueing(operation_name).await?;
        self.hub.reset_watchers(
            &operation_channel(operation_name),
            Instant::now() + self.config.watcher_ttl,
        );
        Ok(())
    }

    pub fn now_millis() -> i64 {
        Utc::now().timestamp_millis()
    }
}
