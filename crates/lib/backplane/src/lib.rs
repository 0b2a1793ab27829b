//! The coordination backplane contract.
//!
//! The backplane holds the global state of the farm: the active worker set,
//! the action cache, the blob-location index, the operations hash, the
//! prequeue/ready/dispatched/completed queue discipline, the tree cache, and
//! the operation pub/sub channel. Every frontend shard and every worker
//! shares one backplane.

mod retrier;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

pub use retrier::{Backoff, Retrier};

use granary_api::{
    ActionKey, ActionResult, Code, Digest, Directory, DispatchedOperation, ExecuteEntry,
    ExecutionStage, Operation, QueueEntry, Status,
};

/// How long a dispatched operation may go without a poll before the
/// DispatchedMonitor requeues it.
pub const DISPATCH_DEADLINE_MILLIS: i64 = 30_000;

#[derive(Debug, thiserror::Error)]
pub enum BackplaneError {
    /// The store is unreachable or refused the request transiently.
    #[error("backplane unavailable: {0}")]
    Unavailable(String),

    /// A stored value failed to decode; the entry is suspect.
    #[error("backplane decode failure: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("backplane stopped")]
    Stopped,

    #[error("{0}")]
    Internal(String),
}

impl BackplaneError {
    pub fn code(&self) -> Code {
        match self {
            BackplaneError::Unavailable(_) => Code::Unavailable,
            BackplaneError::Decode(_) => Code::Internal,
            BackplaneError::Stopped => Code::Unavailable,
            BackplaneError::Internal(_) => Code::Internal,
        }
    }
}

impl From<BackplaneError> for Status {
    fn from(err: BackplaneError) -> Status {
        Status::new(err.code(), err.to_string())
    }
}

pub type BackplaneResult<T> = Result<T, BackplaneError>;

/// A message observed on an operation channel.
#[derive(Clone, Debug, PartialEq)]
pub enum ChannelMessage {
    /// Watchers on the channel should re-evaluate their deadlines.
    Expire,
    /// A state transition; always a stripped operation.
    Operation(Operation),
    /// The operation was deleted; watchers receive a terminal null.
    Removed,
}

/// Receives pub/sub traffic for subscribed channels. Implemented by the
/// watcher hub on frontends.
pub trait OperationListener: Send + Sync {
    fn on_message(&self, channel: &str, message: ChannelMessage);

    /// Called after a reconnect so the listener can re-resolve watcher
    /// state; `operation` is the current stored operation for the channel.
    fn on_reset(&self, channel: &str, operation: Option<Operation>);
}

/// Invoked when the backplane can no longer guarantee watch deliveries.
pub type OnUnsubscribe = Arc<dyn Fn() + Send + Sync>;

/// One page of an action cache scan.
pub struct ActionCacheScan {
    /// Cursor for the next page; `None` when the scan is complete.
    pub token: Option<String>,
    pub entries: Vec<(ActionKey, ActionResult)>,
}

/// Channel name carrying state transitions for an operation.
pub fn operation_channel(operation_name: &str) -> String {
    format!("operation.{operation_name}")
}

#[async_trait::async_trait]
pub trait Backplane: Send + Sync {
    /// Start background machinery (pub/sub subscription). The listener
    /// receives messages for channels subscribed via `subscribe_channel`.
    async fn start(&self, listener: Arc<dyn OperationListener>) -> BackplaneResult<()>;

    async fn stop(&self) -> BackplaneResult<()>;

    fn is_stopped(&self) -> bool;

    /// Register the callback invoked when the subscription is lost for good.
    fn set_on_unsubscribe(&self, on_unsubscribe: OnUnsubscribe);

    async fn subscribe_channel(&self, channel: &str) -> BackplaneResult<()>;

    async fn unsubscribe_channel(&self, channel: &str) -> BackplaneResult<()>;

    /// Publish an `expire` message on a channel, prompting every shard's
    /// watchers there to re-evaluate their deadlines.
    async fn publish_expire(&self, channel: &str) -> BackplaneResult<()>;

    // Worker set. Reads may be served from a bounded-stale (~3 s) cache.

    async fn add_worker(&self, worker_name: &str) -> BackplaneResult<bool>;

    async fn remove_worker(&self, worker_name: &str) -> BackplaneResult<bool>;

    async fn get_workers(&self) -> BackplaneResult<HashSet<String>>;

    // Action cache.

    async fn get_action_result(&self, key: &ActionKey) -> BackplaneResult<Option<ActionResult>>;

    async fn put_action_result(
        &self,
        key: &ActionKey,
        result: &ActionResult,
    ) -> BackplaneResult<()>;

    async fn remove_action_result(&self, key: &ActionKey) -> BackplaneResult<()>;

    async fn remove_action_results(&self, keys: &[ActionKey]) -> BackplaneResult<()>;

    async fn scan_action_cache(
        &self,
        token: Option<String>,
        count: usize,
    ) -> BackplaneResult<ActionCacheScan>;

    // Blob-location index.

    async fn add_blob_location(&self, digest: &Digest, worker_name: &str) -> BackplaneResult<()>;

    async fn add_blobs_location(
        &self,
        digests: &[Digest],
        worker_name: &str,
    ) -> BackplaneResult<()>;

    async fn remove_blob_location(&self, digest: &Digest, worker_name: &str)
        -> BackplaneResult<()>;

    async fn remove_blobs_location(
        &self,
        digests: &[Digest],
        worker_name: &str,
    ) -> BackplaneResult<()>;

    /// Apply `(to_add, to_remove)` to one digest's location set atomically.
    async fn adjust_blob_locations(
        &self,
        digest: &Digest,
        add: &HashSet<String>,
        remove: &HashSet<String>,
    ) -> BackplaneResult<()>;

    async fn get_blob_location_set(&self, digest: &Digest) -> BackplaneResult<HashSet<String>>;

    async fn get_blob_digests_workers(
        &self,
        digests: &[Digest],
    ) -> BackplaneResult<HashMap<Digest, HashSet<String>>>;

    // Operations hash and queue discipline. An operation name exists in at
    // most one of {prequeue, queued, dispatched, completed}; put_operation
    // moves it atomically together with publishing the new state.

    async fn get_operation(&self, operation_name: &str) -> BackplaneResult<Option<Operation>>;

    async fn put_operation(
        &self,
        operation: &Operation,
        stage: ExecutionStage,
    ) -> BackplaneResult<bool>;

    async fn delete_operation(&self, operation_name: &str) -> BackplaneResult<()>;

    async fn get_operations(&self) -> BackplaneResult<Vec<String>>;

    async fn prequeue(&self, entry: &ExecuteEntry, operation: &Operation) -> BackplaneResult<()>;

    /// Pop the prequeue; blocks briefly when empty and returns `None` on
    /// timeout so callers can re-check shutdown.
    async fn deprequeue_operation(&self) -> BackplaneResult<Option<ExecuteEntry>>;

    /// Refresh liveness of an operation that is being transformed for
    /// queueing, so it is not considered lost.
    async fn queueing(&self, operation_name: &str) -> BackplaneResult<()>;

    async fn queue(&self, entry: &QueueEntry, operation: &Operation) -> BackplaneResult<()>;

    /// Atomically pop the ready queue and insert into the dispatched map
    /// with `requeue_at = now + DISPATCH_DEADLINE_MILLIS`. Set-if-absent: a
    /// name already dispatched is not dispatched again. Blocks briefly when
    /// the queue is empty.
    async fn dispatch_operation(&self) -> BackplaneResult<Option<QueueEntry>>;

    /// Renew the dispatch deadline iff the entry is still dispatched at the
    /// given stage. False means the claim was lost.
    async fn poll_operation(
        &self,
        entry: &QueueEntry,
        stage: ExecutionStage,
        requeue_at: i64,
    ) -> BackplaneResult<bool>;

    /// Move a dispatched operation back to the ready queue. A no-op when
    /// the name is already queued.
    async fn requeue_dispatched_operation(&self, entry: &QueueEntry) -> BackplaneResult<()>;

    async fn complete_operation(&self, operation_name: &str) -> BackplaneResult<()>;

    async fn get_dispatched_operations(&self) -> BackplaneResult<Vec<DispatchedOperation>>;

    /// Trim the completed list, deleting operations past `limit`.
    async fn destroy_oldest_completed_operations(&self, limit: u64) -> BackplaneResult<()>;

    // Tree cache: input-root digest -> directory closure, so re-execution
    // avoids a recursive walk.

    async fn put_tree(&self, root_digest: &Digest, directories: &[Directory])
        -> BackplaneResult<()>;

    async fn get_tree(&self, root_digest: &Digest) -> BackplaneResult<Option<Vec<Directory>>>;

    async fn remove_tree(&self, root_digest: &Digest) -> BackplaneResult<()>;

    // Admission control.

    async fn can_queue(&self) -> BackplaneResult<bool>;

    async fn can_prequeue(&self) -> BackplaneResult<bool>;
}
