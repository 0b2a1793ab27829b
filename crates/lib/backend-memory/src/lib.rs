//! In-process backplane.
//!
//! State lives under one mutex; queue consumers park on notifies with a
//! short timeout so shutdown is never blocked on an empty queue. Pub/sub is
//! direct listener dispatch filtered by the subscribed channel set, with
//! delivery outside the state lock.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tracing::warn;

use granary_api::{
    ActionKey, ActionResult, Digest, Directory, DispatchedOperation, ExecuteEntry, ExecutionStage,
    Operation, QueueEntry,
};
use granary_backplane::{
    operation_channel, ActionCacheScan, Backplane, BackplaneError, BackplaneResult,
    ChannelMessage, OnUnsubscribe, OperationListener, DISPATCH_DEADLINE_MILLIS,
};

/// How long queue pops wait before reporting an empty queue.
const POP_WAIT: Duration = Duration::from_secs(1);

#[derive(Clone, Debug)]
pub struct MemoryBackplaneConfig {
    pub max_queue_depth: usize,
    pub max_prequeue_depth: usize,
}

impl Default for MemoryBackplaneConfig {
    fn default() -> Self {
        Self {
            max_queue_depth: 10_000,
            max_prequeue_depth: 10_000,
        }
    }
}

#[derive(Default)]
struct State {
    workers: HashSet<String>,
    action_cache: BTreeMap<String, ActionResult>,
    blob_locations: HashMap<String, HashSet<String>>,
    operations: HashMap<String, Operation>,
    prequeue: VecDeque<ExecuteEntry>,
    queued: VecDeque<QueueEntry>,
    dispatched: HashMap<String, DispatchedOperation>,
    completed: VecDeque<String>,
    queueing: HashMap<String, i64>,
    trees: HashMap<String, Vec<Directory>>,
    subscribed: HashSet<String>,
    listener: Option<Arc<dyn OperationListener>>,
    stopped: bool,
}

#[derive(Clone)]
pub struct MemoryBackplane {
    config: MemoryBackplaneConfig,
    state: Arc<Mutex<State>>,
    prequeue_ready: Arc<Notify>,
    queue_ready: Arc<Notify>,
    on_unsubscribe: Arc<Mutex<Option<OnUnsubscribe>>>,
}

impl Default for MemoryBackplane {
    fn default() -> Self {
        MemoryBackplane::new(MemoryBackplaneConfig::default())
    }
}

impl MemoryBackplane {
    pub fn new(config: MemoryBackplaneConfig) -> MemoryBackplane {
        MemoryBackplane {
            config,
            state: Arc::new(Mutex::new(State {
                stopped: true,
                ..State::default()
            })),
            prequeue_ready: Arc::new(Notify::new()),
            queue_ready: Arc::new(Notify::new()),
            on_unsubscribe: Arc::new(Mutex::new(None)),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().expect("backplane state poisoned")
    }

    /// Deliver a message if the channel is subscribed. Called with the
    /// state lock released.
    fn publish(&self, channel: &str, message: ChannelMessage) {
        let listener = {
            let state = self.lock();
            if !state.subscribed.contains(channel) {
                return;
            }
            state.listener.clone()
        };
        if let Some(listener) = listener {
            listener.on_message(channel, message);
        }
    }

    fn queued_names(state: &State) -> HashSet<&str> {
        state
            .queued
            .iter()
            .filter_map(|entry| entry.execute_entry.as_ref())
            .map(|entry| entry.operation_name.as_str())
            .collect()
    }

    fn complete_locked(state: &mut State, operation_name: &str) {
        if state.dispatched.remove(operation_name).is_none() {
            warn!(operation = operation_name, "completed operation was not dispatched");
        }
        state.queueing.remove(operation_name);
        if !state.completed.iter().any(|name| name == operation_name) {
            state.completed.push_front(operation_name.to_string());
        }
    }

    fn ensure_running(state: &State) -> BackplaneResult<()> {
        if state.stopped {
            return Err(BackplaneError::Stopped);
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Backplane for MemoryBackplane {
    async fn start(&self, listener: Arc<dyn OperationListener>) -> BackplaneResult<()> {
        let mut state = self.lock();
        state.listener = Some(listener);
        state.stopped = false;
        Ok(())
    }

    async fn stop(&self) -> BackplaneResult<()> {
        {
            let mut state = self.lock();
            state.stopped = true;
            state.listener = None;
        }
        self.prequeue_ready.notify_waiters();
        self.queue_ready.notify_waiters();
        if let Some(on_unsubscribe) = self
            .on_unsubscribe
            .lock()
            .expect("on_unsubscribe poisoned")
            .clone()
        {
            (*on_unsubscribe)();
        }
        Ok(())
    }

    fn is_stopped(&self) -> bool {
        self.lock().stopped
    }

    fn set_on_unsubscribe(&self, on_unsubscribe: OnUnsubscribe) {
        *self.on_unsubscribe.lock().expect("on_unsubscribe poisoned") = Some(on_unsubscribe);
    }

    async fn subscribe_channel(&self, channel: &str) -> BackplaneResult<()> {
        self.lock().subscribed.insert(channel.to_string());
        Ok(())
    }

    async fn unsubscribe_channel(&self, channel: &str) -> BackplaneResult<()> {
        self.lock().subscribed.remove(channel);
        Ok(())
    }

    async fn publish_expire(&self, channel: &str) -> BackplaneResult<()> {
        self.publish(channel, ChannelMessage::Expire);
        Ok(())
    }

    async fn add_worker(&self, worker_name: &str) -> BackplaneResult<bool> {
        Ok(self.lock().workers.insert(worker_name.to_string()))
    }

    async fn remove_worker(&self, worker_name: &str) -> BackplaneResult<bool> {
        Ok(self.lock().workers.remove(worker_name))
    }

    async fn get_workers(&self) -> BackplaneResult<HashSet<String>> {
        Ok(self.lock().workers.clone())
    }

    async fn get_action_result(&self, key: &ActionKey) -> BackplaneResult<Option<ActionResult>> {
        Ok(self.lock().action_cache.get(&key.digest().to_key()).cloned())
    }

    async fn put_action_result(
        &self,
        key: &ActionKey,
        result: &ActionResult,
    ) -> BackplaneResult<()> {
        self.lock()
            .action_cache
            .insert(key.digest().to_key(), result.clone());
        Ok(())
    }

    async fn remove_action_result(&self, key: &ActionKey) -> BackplaneResult<()> {
        self.lock().action_cache.remove(&key.digest().to_key());
        Ok(())
    }

    async fn remove_action_results(&self, keys: &[ActionKey]) -> BackplaneResult<()> {
        let mut state = self.lock();
        for key in keys {
            state.action_cache.remove(&key.digest().to_key());
        }
        Ok(())
    }

    async fn scan_action_cache(
        &self,
        token: Option<String>,
        count: usize,
    ) -> BackplaneResult<ActionCacheScan> {
        let state = self.lock();
        let entries: Vec<(ActionKey, ActionResult)> = state
            .action_cache
            .range(token.unwrap_or_default()..)
            .take(count + 1)
            .filter_map(|(key, result)| {
                Digest::parse_key(key).map(|digest| (ActionKey(digest), result.clone()))
            })
            .collect();
        if entries.len() > count {
            let mut entries = entries;
            let next = entries.pop().expect("over-read entry");
            Ok(ActionCacheScan {
                token: Some(next.0.digest().to_key()),
                entries,
            })
        } else {
            Ok(ActionCacheScan {
                token: None,
                entries,
            })
        }
    }

    async fn add_blob_location(&self, digest: &Digest, worker_name: &str) -> BackplaneResult<()> {
        self.lock()
            .blob_locations
            .entry(digest.to_key())
            .or_default()
            .insert(worker_name.to_string());
        Ok(())
    }

    async fn add_blobs_location(
        &self,
        digests: &[Digest],
        worker_name: &str,
    ) -> BackplaneResult<()> {
        let mut state = self.lock();
        for digest in digests {
            state
                .blob_locations
                .entry(digest.to_key())
                .or_default()
                .insert(worker_name.to_string());
        }
        Ok(())
    }

    async fn remove_blob_location(
        &self,
        digest: &Digest,
        worker_name: &str,
    ) -> BackplaneResult<()> {
        let mut state = self.lock();
        if let Some(locations) = state.blob_locations.get_mut(&digest.to_key()) {
            locations.remove(worker_name);
            if locations.is_empty() {
                state.blob_locations.remove(&digest.to_key());
            }
        }
        Ok(())
    }

    async fn remove_blobs_location(
        &self,
        digests: &[Digest],
        worker_name: &str,
    ) -> BackplaneResult<()> {
        for digest in digests {
            self.remove_blob_location(digest, worker_name).await?;
        }
        Ok(())
    }

    async fn adjust_blob_locations(
        &self,
        digest: &Digest,
        add: &HashSet<String>,
        remove: &HashSet<String>,
    ) -> BackplaneResult<()> {
        let mut state = self.lock();
        let locations = state.blob_locations.entry(digest.to_key()).or_default();
        for worker in add {
            locations.insert(worker.clone());
        }
        for worker in remove {
            locations.remove(worker);
        }
        if locations.is_empty() {
            state.blob_locations.remove(&digest.to_key());
        }
        Ok(())
    }

    async fn get_blob_location_set(&self, digest: &Digest) -> BackplaneResult<HashSet<String>> {
        Ok(self
            .lock()
            .blob_locations
            .get(&digest.to_key())
            .cloned()
            .unwrap_or_default())
    }

    async fn get_blob_digests_workers(
        &self,
        digests: &[Digest],
    ) -> BackplaneResult<HashMap<Digest, HashSet<String>>> {
        let state = self.lock();
        Ok(digests
            .iter()
            .filter_map(|digest| {
                state
                    .blob_locations
                    .get(&digest.to_key())
                    .filter(|locations| !locations.is_empty())
                    .map(|locations| (digest.clone(), locations.clone()))
            })
            .collect())
    }

    async fn get_operation(&self, operation_name: &str) -> BackplaneResult<Option<Operation>> {
        Ok(self.lock().operations.get(operation_name).cloned())
    }

    async fn put_operation(
        &self,
        operation: &Operation,
        stage: ExecutionStage,
    ) -> BackplaneResult<bool> {
        let queue = stage == ExecutionStage::Queued;
        let complete = !queue && operation.done;
        let publish = !queue && stage != ExecutionStage::Unknown;
        {
            let mut state = self.lock();
            Self::ensure_running(&state)?;
            if complete {
                Self::complete_locked(&mut state, &operation.name);
            }
            state
                .operations
                .insert(operation.name.clone(), operation.clone());
        }
        if publish {
            self.publish(
                &operation_channel(&operation.name),
                ChannelMessage::Operation(operation.stripped()),
            );
        }
        Ok(true)
    }

    async fn delete_operation(&self, operation_name: &str) -> BackplaneResult<()> {
        {
            let mut state = self.lock();
            state.dispatched.remove(operation_name);
            state
                .queued
                .retain(|entry| match entry.execute_entry.as_ref() {
                    Some(execute_entry) => execute_entry.operation_name != operation_name,
                    None => true,
                });
            state
                .prequeue
                .retain(|entry| entry.operation_name != operation_name);
            state.completed.retain(|name| name != operation_name);
            state.operations.remove(operation_name);
            state.queueing.remove(operation_name);
        }
        self.publish(&operation_channel(operation_name), ChannelMessage::Removed);
        Ok(())
    }

    async fn get_operations(&self) -> BackplaneResult<Vec<String>> {
        let state = self.lock();
        let mut names: Vec<String> = Self::queued_names(&state)
            .into_iter()
            .map(str::to_string)
            .collect();
        names.extend(state.dispatched.keys().cloned());
        names.extend(state.completed.iter().cloned());
        Ok(names)
    }

    async fn prequeue(&self, entry: &ExecuteEntry, operation: &Operation) -> BackplaneResult<()> {
        {
            let mut state = self.lock();
            Self::ensure_running(&state)?;
            state
                .operations
                .insert(operation.name.clone(), operation.clone());
            state.prequeue.push_back(entry.clone());
        }
        self.prequeue_ready.notify_one();
        Ok(())
    }

    async fn deprequeue_operation(&self) -> BackplaneResult<Option<ExecuteEntry>> {
        loop {
            {
                let mut state = self.lock();
                Self::ensure_running(&state)?;
                if let Some(entry) = state.prequeue.pop_front() {
                    return Ok(Some(entry));
                }
            }
            if tokio::time::timeout(POP_WAIT, self.prequeue_ready.notified())
                .await
                .is_err()
            {
                return Ok(None);
            }
        }
    }

    async fn queueing(&self, operation_name: &str) -> BackplaneResult<()> {
        let mut state = self.lock();
        Self::ensure_running(&state)?;
        state.queueing.insert(
            operation_name.to_string(),
            Utc::now().timestamp_millis() + DISPATCH_DEADLINE_MILLIS,
        );
        Ok(())
    }

    async fn queue(&self, entry: &QueueEntry, operation: &Operation) -> BackplaneResult<()> {
        {
            let mut state = self.lock();
            Self::ensure_running(&state)?;
            if state.dispatched.remove(&operation.name).is_some() {
                warn!(operation = %operation.name, "queued an operation that was dispatched");
            }
            state.queueing.remove(&operation.name);
            state
                .operations
                .insert(operation.name.clone(), operation.clone());
            if !Self::queued_names(&state).contains(operation.name.as_str()) {
                state.queued.push_back(entry.clone());
            }
        }
        self.queue_ready.notify_one();
        self.publish(
            &operation_channel(&operation.name),
            ChannelMessage::Operation(operation.stripped()),
        );
        Ok(())
    }

    async fn dispatch_operation(&self) -> BackplaneResult<Option<QueueEntry>> {
        loop {
            {
                let mut state = self.lock();
                Self::ensure_running(&state)?;
                if let Some(entry) = state.queued.pop_front() {
                    let name = entry
                        .execute_entry
                        .as_ref()
                        .map(|execute_entry| execute_entry.operation_name.clone())
                        .unwrap_or_default();
                    if state.dispatched.contains_key(&name) {
                        // Already claimed under this name; drop the stale
                        // queue copy rather than double-dispatching.
                        return Ok(None);
                    }
                    state.dispatched.insert(
                        name.clone(),
                        DispatchedOperation {
                            name,
                            requeue_at: Utc::now().timestamp_millis() + DISPATCH_DEADLINE_MILLIS,
                            queue_entry: Some(entry.clone()),
                        },
                    );
                    return Ok(Some(entry));
                }
            }
            if tokio::time::timeout(POP_WAIT, self.queue_ready.notified())
                .await
                .is_err()
            {
                return Ok(None);
            }
        }
    }

    async fn poll_operation(
        &self,
        entry: &QueueEntry,
        _stage: ExecutionStage,
        requeue_at: i64,
    ) -> BackplaneResult<bool> {
        let name = entry
            .execute_entry
            .as_ref()
            .map(|execute_entry| execute_entry.operation_name.as_str())
            .unwrap_or_default();
        let mut state = self.lock();
        match state.dispatched.get_mut(name) {
            Some(dispatched) => {
                dispatched.requeue_at = requeue_at;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn requeue_dispatched_operation(&self, entry: &QueueEntry) -> BackplaneResult<()> {
        let name = entry
            .execute_entry
            .as_ref()
            .map(|execute_entry| execute_entry.operation_name.clone())
            .unwrap_or_default();
        {
            let mut state = self.lock();
            state.dispatched.remove(&name);
            if Self::queued_names(&state).contains(name.as_str()) {
                return Ok(());
            }
            state.queued.push_back(entry.clone());
        }
        self.queue_ready.notify_one();
        Ok(())
    }

    async fn complete_operation(&self, operation_name: &str) -> BackplaneResult<()> {
        let mut state = self.lock();
        Self::complete_locked(&mut state, operation_name);
        Ok(())
    }

    async fn get_dispatched_operations(&self) -> BackplaneResult<Vec<DispatchedOperation>> {
        Ok(self.lock().dispatched.values().cloned().collect())
    }

    async fn destroy_oldest_completed_operations(&self, limit: u64) -> BackplaneResult<()> {
        let mut state = self.lock();
        while state.completed.len() as u64 > limit {
            if let Some(name) = state.completed.pop_back() {
                state.operations.remove(&name);
            }
        }
        Ok(())
    }

    async fn put_tree(
        &self,
        root_digest: &Digest,
        directories: &[Directory],
    ) -> BackplaneResult<()> {
        self.lock()
            .trees
            .insert(root_digest.to_key(), directories.to_vec());
        Ok(())
    }

    async fn get_tree(&self, root_digest: &Digest) -> BackplaneResult<Option<Vec<Directory>>> {
        Ok(self.lock().trees.get(&root_digest.to_key()).cloned())
    }

    async fn remove_tree(&self, root_digest: &Digest) -> BackplaneResult<()> {
        self.lock().trees.remove(&root_digest.to_key());
        Ok(())
    }

    async fn can_queue(&self) -> BackplaneResult<bool> {
        Ok(self.lock().queued.len() < self.config.max_queue_depth)
    }

    async fn can_prequeue(&self) -> BackplaneResult<bool> {
        Ok(self.lock().prequeue.len() < self.config.max_prequeue_depth)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use granary_api::DigestUtil;

    use super::*;

    struct RecordingListener {
        messages: StdMutex<Vec<(String, ChannelMessage)>>,
    }

    impl RecordingListener {
        fn new() -> Arc<RecordingListener> {
            Arc::new(RecordingListener {
                messages: StdMutex::new(Vec::new()),
            })
        }

        fn take(&self) -> Vec<(String, ChannelMessage)> {
            std::mem::take(&mut self.messages.lock().expect("messages poisoned"))
        }
    }

    impl OperationListener for RecordingListener {
        fn on_message(&self, channel: &str, message: ChannelMessage) {
            self.messages
                .lock()
                .expect("messages poisoned")
                .push((channel.to_string(), message));
        }

        fn on_reset(&self, _channel: &str, _operation: Option<Operation>) {}
    }

    async fn started() -> (MemoryBackplane, Arc<RecordingListener>) {
        let backplane = MemoryBackplane::default();
        let listener = RecordingListener::new();
        backplane
            .start(listener.clone() as Arc<dyn OperationListener>)
            .await
            .expect("start");
        (backplane, listener)
    }

    fn queue_entry(name: &str) -> (QueueEntry, Operation) {
        let entry = QueueEntry {
            execute_entry: Some(ExecuteEntry {
                operation_name: name.to_string(),
                action_digest: Some(DigestUtil.compute(name.as_bytes())),
                ..Default::default()
            }),
            queued_operation_digest: Some(DigestUtil.compute(b"queued operation")),
        };
        let operation = Operation {
            name: name.to_string(),
            ..Default::default()
        };
        (entry, operation)
    }

    #[tokio::test]
    async fn dispatch_moves_queued_to_dispatched() {
        let (backplane, _listener) = started().await;
        let (entry, operation) = queue_entry("op-1");
        backplane.queue(&entry, &operation).await.expect("queue");

        let dispatched = backplane
            .dispatch_operation()
            .await
            .expect("dispatch")
            .expect("entry");
        assert_eq!(dispatched, entry);

        let records = backplane
            .get_dispatched_operations()
            .await
            .expect("dispatched");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].name, "op-1");
        assert!(records[0].requeue_at > Utc::now().timestamp_millis());
    }

    #[tokio::test]
    async fn concurrent_dispatch_claims_exactly_once() {
        let (backplane, _listener) = started().await;
        let (entry, operation) = queue_entry("op-contended");
        backplane.queue(&entry, &operation).await.expect("queue");

        let mut claims = Vec::new();
        for _ in 0..8 {
            let backplane = backplane.clone();
            claims.push(tokio::spawn(async move {
                backplane.dispatch_operation().await.expect("dispatch")
            }));
        }
        let mut matched = 0;
        for claim in claims {
            if claim.await.expect("join").is_some() {
                matched += 1;
            }
        }
        assert_eq!(matched, 1);
    }

    #[tokio::test]
    async fn poll_renews_only_live_claims() {
        let (backplane, _listener) = started().await;
        let (entry, operation) = queue_entry("op-poll");
        backplane.queue(&entry, &operation).await.expect("queue");
        backplane
            .dispatch_operation()
            .await
            .expect("dispatch")
            .expect("entry");

        let renewed = backplane
            .poll_operation(&entry, ExecutionStage::Executing, 12345)
            .await
            .expect("poll");
        assert!(renewed);

        backplane.complete_operation("op-poll").await.expect("complete");
        let renewed = backplane
            .poll_operation(&entry, ExecutionStage::Executing, 12345)
            .await
            .expect("poll");
        assert!(!renewed);
    }

    #[tokio::test]
    async fn requeue_is_idempotent() {
        let (backplane, _listener) = started().await;
        let (entry, operation) = queue_entry("op-requeue");
        backplane.queue(&entry, &operation).await.expect("queue");
        backplane
            .dispatch_operation()
            .await
            .expect("dispatch")
            .expect("entry");

        backplane
            .requeue_dispatched_operation(&entry)
            .await
            .expect("requeue");
        backplane
            .requeue_dispatched_operation(&entry)
            .await
            .expect("requeue again");

        let first = backplane.dispatch_operation().await.expect("dispatch");
        assert!(first.is_some());
        // The second requeue must not have produced a second queue copy.
        assert_eq!(backplane.lock().queued.len(), 0);
    }

    #[tokio::test]
    async fn put_operation_publishes_stripped_state() {
        let (backplane, listener) = started().await;
        let channel = operation_channel("op-pub");
        backplane
            .subscribe_channel(&channel)
            .await
            .expect("subscribe");

        let operation = Operation {
            name: "op-pub".to_string(),
            ..Default::default()
        }
        .with_queued_metadata(granary_api::QueuedOperationMetadata {
            execute_operation_metadata: Some(granary_api::ExecuteOperationMetadata {
                stage: ExecutionStage::CacheCheck as i32,
                ..Default::default()
            }),
            queued_operation_digest: Some(DigestUtil.compute(b"payload")),
            request_metadata: None,
        });
        backplane
            .put_operation(&operation, ExecutionStage::CacheCheck)
            .await
            .expect("put");

        let messages = listener.take();
        assert_eq!(messages.len(), 1);
        let (observed_channel, message) = &messages[0];
        assert_eq!(observed_channel, &channel);
        match message {
            ChannelMessage::Operation(published) => {
                assert_eq!(published.stage(), ExecutionStage::CacheCheck);
                // The queued payload digest never leaves the backplane.
                match published.metadata.as_ref().and_then(|m| m.kind.as_ref()) {
                    Some(granary_api::operation_metadata::Kind::Execute(_)) => {}
                    other => panic!("expected stripped metadata, got {other:?}"),
                }
            }
            other => panic!("expected operation message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unsubscribed_channels_are_silent() {
        let (backplane, listener) = started().await;
        let operation = Operation {
            name: "op-quiet".to_string(),
            ..Default::default()
        };
        backplane
            .put_operation(&operation, ExecutionStage::Executing)
            .await
            .expect("put");
        assert!(listener.take().is_empty());
    }

    #[tokio::test]
    async fn completed_trim_deletes_oldest() {
        let (backplane, _listener) = started().await;
        for index in 0..5 {
            let name = format!("op-{index}");
            let (entry, operation) = queue_entry(&name);
            backplane.queue(&entry, &operation).await.expect("queue");
            backplane.dispatch_operation().await.expect("dispatch");
            let done = Operation {
                name: name.clone(),
                done: true,
                ..Default::default()
            };
            backplane
                .put_operation(&done, ExecutionStage::Completed)
                .await
                .expect("complete");
        }

        backplane
            .destroy_oldest_completed_operations(2)
            .await
            .expect("trim");

        let operations = backplane.get_operations().await.expect("operations");
        assert_eq!(operations.len(), 2);
        assert!(backplane
            .get_operation("op-4")
            .await
            .expect("get")
            .is_some());
        assert!(backplane
            .get_operation("op-0")
            .await
            .expect("get")
            .is_none());
    }

    #[tokio::test]
    async fn admission_limits_apply() {
        let backplane = MemoryBackplane::new(MemoryBackplaneConfig {
            max_queue_depth: 1,
            max_prequeue_depth: 1,
        });
        let listener = RecordingListener::new();
        backplane
            .start(listener as Arc<dyn OperationListener>)
            .await
            .expect("start");

        assert!(backplane.can_prequeue().await.expect("can prequeue"));
        let (entry, operation) = queue_entry("op-full");
        backplane
            .prequeue(
                entry.execute_entry.as_ref().expect("execute entry"),
                &operation,
            )
            .await
            .expect("prequeue");
        assert!(!backplane.can_prequeue().await.expect("can prequeue"));

        assert!(backplane.can_queue().await.expect("can queue"));
        backplane.queue(&entry, &operation).await.expect("queue");
        assert!(!backplane.can_queue().await.expect("can queue"));
    }

    #[tokio::test]
    async fn action_cache_scan_pages() {
        let (backplane, _listener) = started().await;
        let mut keys = Vec::new();
        for index in 0..5u8 {
            let key = ActionKey(DigestUtil.compute(&[index]));
            keys.push(key.clone());
            backplane
                .put_action_result(&key, &ActionResult::default())
                .await
                .expect("put");
        }

        let mut seen = 0;
        let mut token = None;
        loop {
            let page = backplane
                .scan_action_cache(token.clone(), 2)
                .await
                .expect("scan");
            seen += page.entries.len();
            match page.token {
                Some(next) => token = Some(next),
                None => break,
            }
        }
        assert_eq!(seen, 5);
    }

    #[tokio::test]
    async fn adjust_blob_locations_applies_both_sets() {
        let (backplane, _listener) = started().await;
        let digest = DigestUtil.compute(b"blob");
        backplane
            .add_blob_location(&digest, "worker-a")
            .await
            .expect("add");
        backplane
            .add_blob_location(&digest, "worker-b")
            .await
            .expect("add");

        let add: HashSet<String> = ["worker-c".to_string()].into();
        let remove: HashSet<String> = ["worker-a".to_string()].into();
        backplane
            .adjust_blob_locations(&digest, &add, &remove)
            .await
            .expect("adjust");

        let locations = backplane
            .get_blob_location_set(&digest)
            .await
            .expect("locations");
        let expected: HashSet<String> = ["worker-b".to_string(), "worker-c".to_string()].into();
        assert_eq!(locations, expected);
    }

    #[tokio::test]
    async fn delete_operation_signals_watchers() {
        let (backplane, listener) = started().await;
        let channel = operation_channel("op-del");
        backplane
            .subscribe_channel(&channel)
            .await
            .expect("subscribe");
        let (entry, operation) = queue_entry("op-del");
        backplane.queue(&entry, &operation).await.expect("queue");
        listener.take();

        backplane.delete_operation("op-del").await.expect("delete");
        let messages = listener.take();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].1, ChannelMessage::Removed);
        assert!(backplane
            .get_operation("op-del")
            .await
            .expect("get")
            .is_none());
    }
}
