//! Watcher hub: turns the operation pub/sub channel into per-operation
//! notifications with expiration.
//!
//! Each watcher carries an `expires_at` instant that is pushed forward by
//! every observed message (and by the queueing heartbeat). An `expire`
//! message on a channel terminates watchers whose deadline has passed; a
//! periodic sweep publishes `expire` for channels holding any.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use granary_api::{Operation, Status};
use granary_backplane::{Backplane, ChannelMessage, OperationListener};
use tracing::{debug, error, info};

/// Observes operation state transitions. A `None` observation is terminal:
/// the operation is gone or the watch expired.
pub trait Watcher: Send + Sync + 'static {
    fn observe(&self, operation: Option<Operation>);
}

impl<F> Watcher for F
where
    F: Fn(Option<Operation>) + Send + Sync + 'static,
{
    fn observe(&self, operation: Option<Operation>) {
        self(operation)
    }
}

struct TimedWatch {
    id: u64,
    expires_at: Instant,
    watcher: Arc<dyn Watcher>,
}

/// Handle for cancelling a registered watch.
pub struct WatchHandle {
    hub: Arc<WatcherHub>,
    channel: String,
    id: u64,
}

impl WatchHandle {
    pub async fn cancel(self) {
        self.hub.unwatch(&self.channel, self.id).await;
    }
}

pub struct WatcherHub {
    backplane: Arc<dyn Backplane>,
    watchers: Mutex<HashMap<String, Vec<TimedWatch>>>,
    /// Channels whose last watcher disappeared inside a sync callback; the
    /// maintenance task performs the actual unsubscribes.
    pending_unsubscribe: Mutex<Vec<String>>,
    next_id: AtomicU64,
    ttl: Duration,
}

impl WatcherHub {
    pub fn new(backplane: Arc<dyn Backplane>, ttl: Duration) -> Arc<WatcherHub> {
        Arc::new(WatcherHub {
            backplane,
            watchers: Mutex::new(HashMap::new()),
            pending_unsubscribe: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            ttl,
        })
    }

    fn next_expires_at(&self) -> Instant {
        Instant::now() + self.ttl
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<TimedWatch>>> {
        self.watchers.lock().expect("watchers poisoned")
    }

    /// Register a watcher; subscribes the channel on first use.
    pub async fn watch(
        self: &Arc<Self>,
        channel: &str,
        watcher: Arc<dyn Watcher>,
    ) -> Result<WatchHandle, Status> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let first = {
            let mut watchers = self.lock();
            let list = watchers.entry(channel.to_string()).or_default();
            let first = list.is_empty();
            list.push(TimedWatch {
                id,
                expires_at: self.next_expires_at(),
                watcher,
            });
            first
        };
        if first {
            if let Err(err) = self.backplane.subscribe_channel(channel).await {
                self.lock()
                    .get_mut(channel)
                    .map(|list| list.retain(|watch| watch.id != id));
                return Err(err.into());
            }
        }
        Ok(WatchHandle {
            hub: self.clone(),
            channel: channel.to_string(),
            id,
        })
    }

    pub async fn unwatch(&self, channel: &str, id: u64) {
        let emptied = {
            let mut watchers = self.lock();
            match watchers.get_mut(channel) {
                Some(list) => {
                    list.retain(|watch| watch.id != id);
                    if list.is_empty() {
                        watchers.remove(channel);
                        true
                    } else {
                        false
                    }
                }
                None => false,
            }
        };
        if emptied {
            if let Err(err) = self.backplane.unsubscribe_channel(channel).await {
                error!(channel, error = %err, "failed to unsubscribe emptied channel");
            }
        }
    }

    /// Extend every watcher deadline on a channel (heartbeat path).
    pub fn reset_watchers(&self, channel: &str, expires_at: Instant) {
        if let Some(list) = self.lock().get_mut(channel) {
            for watch in list {
                watch.expires_at = expires_at;
            }
        }
    }

    pub fn watched_operation_channels(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    /// Channels with at least one watcher past its deadline.
    pub fn expired_watched_operation_channels(&self, now: Instant) -> Vec<String> {
        self.lock()
            .iter()
            .filter(|(_, list)| list.iter().any(|watch| watch.expires_at <= now))
            .map(|(channel, _)| channel.clone())
            .collect()
    }

    /// Remove expired watchers on a channel and deliver their terminal
    /// observation.
    fn terminate_expired(&self, channel: &str, now: Instant) {
        let (terminated, emptied) = {
            let mut watchers = self.lock();
            let list = match watchers.get_mut(channel) {
                Some(list) => list,
                None => return,
            };
            let mut terminated = Vec::new();
            list.retain(|watch| {
                if watch.expires_at <= now {
                    terminated.push(watch.watcher.clone());
                    false
                } else {
                    true
                }
            });
            let emptied = list.is_empty();
            if emptied {
                watchers.remove(channel);
            }
            (terminated, emptied)
        };
        for watcher in &terminated {
            info!(channel, "terminating expired watcher");
            watcher.observe(None);
        }
        if emptied {
            self.pending_unsubscribe
                .lock()
                .expect("pending poisoned")
                .push(channel.to_string());
        }
    }

    /// Fan an operation (or its removal) out to every watcher on a channel.
    fn deliver(&self, channel: &str, operation: Option<Operation>) {
        let done = operation.as_ref().map(|op| op.done).unwrap_or(true);
        let observers = {
            let mut watchers = self.lock();
            let list = match watchers.get_mut(channel) {
                Some(list) => list,
                None => return,
            };
            let expires_at = self.next_expires_at();
            for watch in list.iter_mut() {
                watch.expires_at = expires_at;
            }
            let observers: Vec<Arc<dyn Watcher>> =
                list.iter().map(|watch| watch.watcher.clone()).collect();
            if done {
                watchers.remove(channel);
            }
            observers
        };
        for watcher in &observers {
            watcher.observe(operation.clone());
        }
        if done && !observers.is_empty() {
            self.pending_unsubscribe
                .lock()
                .expect("pending poisoned")
                .push(channel.to_string());
        }
    }

    /// Periodic maintenance: publish `expire` on channels holding expired
    /// watchers and drain pending unsubscribes. Run this on an interval
    /// from the frontend.
    pub async fn sweep(&self) {
        let pending: Vec<String> = std::mem::take(
            &mut *self
                .pending_unsubscribe
                .lock()
                .expect("pending poisoned"),
        );
        for channel in pending {
            // A watcher may have re-registered since the channel emptied.
            if self.lock().contains_key(&channel) {
                continue;
            }
            if let Err(err) = self.backplane.unsubscribe_channel(&channel).await {
                error!(channel, error = %err, "failed to unsubscribe");
            }
        }
        for channel in self.expired_watched_operation_channels(Instant::now()) {
            debug!(channel, "publishing expire for stale watchers");
            if let Err(err) = self.backplane.publish_expire(&channel).await {
                error!(channel, error = %err, "failed to publish expire");
            }
        }
    }
}

impl OperationListener for WatcherHub {
    fn on_message(&self, channel: &str, message: ChannelMessage) {
        match message {
            ChannelMessage::Expire => self.terminate_expired(channel, Instant::now()),
            ChannelMessage::Operation(operation) => self.deliver(channel, Some(operation)),
            ChannelMessage::Removed => self.deliver(channel, None),
        }
    }

    fn on_reset(&self, channel: &str, operation: Option<Operation>) {
        // Reconnect: re-resolve watcher state from the stored operation.
        self.deliver(channel, operation);
    }
}

#[cfg(test)]
mod tests {
    use granary_api::ExecutionStage;
    use granary_backend_memory::MemoryBackplane;
    use granary_backplane::operation_channel;

    use super::*;

    struct RecordingWatcher {
        observed: Mutex<Vec<Option<Operation>>>,
    }

    impl RecordingWatcher {
        fn new() -> Arc<RecordingWatcher> {
            Arc::new(RecordingWatcher {
                observed: Mutex::new(Vec::new()),
            })
        }

        fn observed(&self) -> Vec<Option<Operation>> {
            self.observed.lock().expect("observed poisoned").clone()
        }
    }

    impl Watcher for RecordingWatcher {
        fn observe(&self, operation: Option<Operation>) {
            self.observed
                .lock()
                .expect("observed poisoned")
                .push(operation);
        }
    }

    async fn hub_with_backplane(ttl: Duration) -> (Arc<WatcherHub>, Arc<MemoryBackplane>) {
        let backplane = Arc::new(MemoryBackplane::default());
        let hub = WatcherHub::new(backplane.clone(), ttl);
        backplane
            .start(hub.clone())
            .await
            .expect("start backplane");
        (hub, backplane)
    }

    fn operation(name: &str, stage: ExecutionStage, done: bool) -> Operation {
        Operation {
            name: name.to_string(),
            done,
            ..Default::default()
        }
        .with_execute_metadata(granary_api::ExecuteOperationMetadata {
            stage: stage as i32,
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn watchers_receive_each_transition() {
        let (hub, backplane) = hub_with_backplane(Duration::from_secs(10)).await;
        let channel = operation_channel("op-w");
        let watcher = RecordingWatcher::new();
        hub.watch(&channel, watcher.clone())
            .await
            .expect("watch");

        backplane
            .put_operation(
                &operation("op-w", ExecutionStage::Queued, false),
                ExecutionStage::Executing,
            )
            .await
            .expect("put");
        // Stage publishes fan out to the hub synchronously in-process.
        let observed = watcher.observed();
        assert_eq!(observed.len(), 1);
        assert!(observed[0].is_some());
    }

    #[tokio::test]
    async fn terminal_delivery_happens_exactly_once() {
        let (hub, _backplane) = hub_with_backplane(Duration::from_secs(10)).await;
        let channel = operation_channel("op-done");
        let first = RecordingWatcher::new();
        let second = RecordingWatcher::new();
        hub.watch(&channel, first.clone()).await.expect("watch");
        hub.watch(&channel, second.clone()).await.expect("watch");

        let done = operation("op-done", ExecutionStage::Completed, true);
        hub.on_message(&channel, ChannelMessage::Operation(done.clone()));
        // A duplicate publish after completion reaches nobody.
        hub.on_message(&channel, ChannelMessage::Operation(done));

        for watcher in [&first, &second] {
            let observed = watcher.observed();
            assert_eq!(observed.len(), 1);
            assert!(observed[0].as_ref().expect("operation").done);
        }
        assert!(hub.watched_operation_channels().is_empty());
    }

    #[tokio::test]
    async fn expire_terminates_only_stale_watchers() {
        let (hub, _backplane) = hub_with_backplane(Duration::from_millis(0)).await;
        let stale_channel = operation_channel("op-stale");
        let fresh_channel = operation_channel("op-fresh");
        let stale = RecordingWatcher::new();
        let fresh = RecordingWatcher::new();
        hub.watch(&stale_channel, stale.clone()).await.expect("watch");
        hub.watch(&fresh_channel, fresh.clone()).await.expect("watch");
        // Keep the fresh watcher alive past the zero TTL.
        hub.reset_watchers(&fresh_channel, Instant::now() + Duration::from_secs(60));

        assert_eq!(
            hub.expired_watched_operation_channels(Instant::now()),
            vec![stale_channel.clone()]
        );
        hub.on_message(&stale_channel, ChannelMessage::Expire);
        hub.on_message(&fresh_channel, ChannelMessage::Expire);

        assert_eq!(stale.observed(), vec![None]);
        assert!(fresh.observed().is_empty());
        assert_eq!(hub.watched_operation_channels(), vec![fresh_channel]);
    }

    #[tokio::test]
    async fn sweep_unsubscribes_emptied_channels() {
        let (hub, backplane) = hub_with_backplane(Duration::from_millis(0)).await;
        let channel = operation_channel("op-sweep");
        let watcher = RecordingWatcher::new();
        hub.watch(&channel, watcher.clone()).await.expect("watch");

        hub.on_message(&channel, ChannelMessage::Expire);
        hub.sweep().await;
        assert_eq!(watcher.observed(), vec![None]);

        // After the sweep the channel is unsubscribed: publishes are silent.
        backplane
            .put_operation(
                &operation("op-sweep", ExecutionStage::Executing, false),
                ExecutionStage::Executing,
            )
            .await
            .expect("put");
        assert_eq!(watcher.observed(), vec![None]);
    }

    #[tokio::test]
    async fn reconnect_reset_replays_the_stored_state() {
        let (hub, _backplane) = hub_with_backplane(Duration::from_secs(10)).await;
        let live_channel = operation_channel("op-live");
        let gone_channel = operation_channel("op-gone");
        let live = RecordingWatcher::new();
        let gone = RecordingWatcher::new();
        hub.watch(&live_channel, live.clone()).await.expect("watch");
        hub.watch(&gone_channel, gone.clone()).await.expect("watch");

        // The subscription reconnected: the backplane replays whatever the
        // operations hash holds now.
        hub.on_reset(
            &live_channel,
            Some(operation("op-live", ExecutionStage::Executing, false)),
        );
        hub.on_reset(&gone_channel, None);

        let observed = live.observed();
        assert_eq!(observed.len(), 1);
        assert_eq!(
            observed[0].as_ref().expect("operation").stage(),
            ExecutionStage::Executing
        );
        // The deleted operation is terminal for its watcher.
        assert_eq!(gone.observed(), vec![None]);
        assert_eq!(hub.watched_operation_channels(), vec![live_channel]);
    }

    #[tokio::test]
    async fn unwatch_via_handle_removes_the_watcher() {
        let (hub, _backplane) = hub_with_backplane(Duration::from_secs(10)).await;
        let channel = operation_channel("op-cancel");
        let watcher = RecordingWatcher::new();
        let handle = hub.watch(&channel, watcher.clone()).await.expect("watch");
        handle.cancel().await;

        hub.on_message(
            &channel,
            ChannelMessage::Operation(operation("op-cancel", ExecutionStage::Executing, false)),
        );
        assert!(watcher.observed().is_empty());
        assert!(hub.watched_operation_channels().is_empty());
    }
}
