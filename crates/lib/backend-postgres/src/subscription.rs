//! LISTEN/NOTIFY subscription.
//!
//! One physical notification channel carries every logical operation
//! channel; the subscriber filters by the subscribed set and hands messages
//! to the listener. On a dropped connection it reconnects and re-resolves
//! every watched channel from the operations table, and gives up through
//! the unsubscribe hook when the connection cannot be restored.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use prost::Message;
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgListener;
use sqlx::{PgPool, Row};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use granary_api::Operation;
use granary_backplane::{ChannelMessage, OnUnsubscribe, OperationListener};

pub(crate) const NOTIFY_CHANNEL: &str = "granary_operations";

const RECONNECT_ATTEMPTS: u32 = 5;
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct Envelope {
    pub channel: String,
    pub kind: String,
    #[serde(default)]
    pub payload: String,
}

impl Envelope {
    pub fn operation(channel: &str, operation: &Operation) -> Envelope {
        Envelope {
            channel: channel.to_string(),
            kind: "operation".to_string(),
            payload: hex::encode(operation.encode_to_vec()),
        }
    }

    pub fn expire(channel: &str) -> Envelope {
        Envelope {
            channel: channel.to_string(),
            kind: "expire".to_string(),
            payload: String::new(),
        }
    }

    pub fn removed(channel: &str) -> Envelope {
        Envelope {
            channel: channel.to_string(),
            kind: "removed".to_string(),
            payload: String::new(),
        }
    }

    fn message(&self) -> Option<ChannelMessage> {
        match self.kind.as_str() {
            "expire" => Some(ChannelMessage::Expire),
            "removed" => Some(ChannelMessage::Removed),
            "operation" => {
                let bytes = hex::decode(&self.payload).ok()?;
                let operation = Operation::decode(bytes.as_slice()).ok()?;
                Some(ChannelMessage::Operation(operation))
            }
            _ => None,
        }
    }
}

struct SubscriptionState {
    listener: Option<Arc<dyn OperationListener>>,
    cancel: Option<CancellationToken>,
    on_unsubscribe: Option<OnUnsubscribe>,
}

pub(crate) struct Subscription {
    pool: PgPool,
    subscribed: Arc<Mutex<HashSet<String>>>,
    state: Mutex<SubscriptionState>,
}

impl Subscription {
    pub fn new(pool: PgPool) -> Subscription {
        Subscription {
            pool,
            subscribed: Arc::new(Mutex::new(HashSet::new())),
            state: Mutex::new(SubscriptionState {
                listener: None,
                cancel: None,
                on_unsubscribe: None,
            }),
        }
    }

    pub fn subscribe(&self, channel: &str) {
        self.subscribed
            .lock()
            .expect("subscribed poisoned")
            .insert(channel.to_string());
    }

    pub fn unsubscribe(&self, channel: &str) {
        self.subscribed
            .lock()
            .expect("subscribed poisoned")
            .remove(channel);
    }

    pub fn set_on_unsubscribe(&self, on_unsubscribe: OnUnsubscribe) {
        self.state
            .lock()
            .expect("subscription state poisoned")
            .on_unsubscribe = Some(on_unsubscribe);
    }

    pub fn is_stopped(&self) -> bool {
        self.state
            .lock()
            .expect("subscription state poisoned")
            .cancel
            .is_none()
    }

    pub fn stop(&self) {
        let mut state = self.state.lock().expect("subscription state poisoned");
        if let Some(cancel) = state.cancel.take() {
            cancel.cancel();
        }
        state.listener = None;
    }

    pub fn start(&self, listener: Arc<dyn OperationListener>) {
        let cancel = CancellationToken::new();
        let on_unsubscribe = {
            let mut state = self.state.lock().expect("subscription state poisoned");
            state.listener = Some(listener.clone());
            state.cancel = Some(cancel.clone());
            state.on_unsubscribe.clone()
        };
        let pool = self.pool.clone();
        let subscribed = self.subscribed.clone();
        tokio::spawn(run(pool, subscribed, listener, cancel, on_unsubscribe));
    }
}

async fn run(
    pool: PgPool,
    subscribed: Arc<Mutex<HashSet<String>>>,
    listener: Arc<dyn OperationListener>,
    cancel: CancellationToken,
    on_unsubscribe: Option<OnUnsubscribe>,
) {
    let mut first_connect = true;
    'reconnect: loop {
        let mut pg_listener = match connect(&pool).await {
            Some(pg_listener) => pg_listener,
            None => break,
        };
        info!("operation subscription listening");
        if !first_connect {
            resolve_watched(&pool, &subscribed, listener.as_ref()).await;
        }
        first_connect = false;

        loop {
            let notification = tokio::select! {
                _ = cancel.cancelled() => {
                    info!("operation subscription stopped");
                    return;
                }
                notification = pg_listener.recv() => notification,
            };
            match notification {
                Ok(notification) => {
                    let envelope: Envelope =
                        match serde_json::from_str(notification.payload()) {
                            Ok(envelope) => envelope,
                            Err(err) => {
                                warn!(error = %err, "undecodable notification");
                                continue;
                            }
                        };
                    let interested = subscribed
                        .lock()
                        .expect("subscribed poisoned")
                        .contains(&envelope.channel);
                    if !interested {
                        continue;
                    }
                    match envelope.message() {
                        Some(message) => listener.on_message(&envelope.channel, message),
                        None => warn!(kind = envelope.kind, "unknown notification kind"),
                    }
                }
                Err(err) => {
                    warn!(error = %err, "subscription connection lost; reconnecting");
                    continue 'reconnect;
                }
            }
        }
    }

    error!("operation subscription gave up");
    if let Some(on_unsubscribe) = on_unsubscribe {
        (*on_unsubscribe)();
    }
}

async fn connect(pool: &PgPool) -> Option<PgListener> {
    for attempt in 1..=RECONNECT_ATTEMPTS {
        match PgListener::connect_with(pool).await {
            Ok(mut pg_listener) => match pg_listener.listen(NOTIFY_CHANNEL).await {
                Ok(()) => return Some(pg_listener),
                Err(err) => warn!(attempt, error = %err, "listen failed"),
            },
            Err(err) => warn!(attempt, error = %err, "listener connect failed"),
        }
        tokio::time::sleep(RECONNECT_DELAY * attempt).await;
    }
    None
}

/// After a reconnect, watchers may have missed transitions: re-read the
/// stored operation for every watched channel and replay it.
async fn resolve_watched(
    pool: &PgPool,
    subscribed: &Arc<Mutex<HashSet<String>>>,
    listener: &dyn OperationListener,
) {
    let channels: Vec<String> = subscribed
        .lock()
        .expect("subscribed poisoned")
        .iter()
        .cloned()
        .collect();
    for channel in channels {
        let operation_name = match channel.strip_prefix("operation.") {
            Some(operation_name) => operation_name.to_string(),
            None => continue,
        };
        let row = sqlx::query("SELECT operation FROM operations WHERE name = $1")
            .bind(&operation_name)
            .fetch_optional(pool)
            .await;
        match row {
            Ok(Some(row)) => {
                let bytes: Vec<u8> = row.get("operation");
                match Operation::decode(bytes.as_slice()) {
                    Ok(operation) => listener.on_reset(&channel, Some(operation)),
                    Err(err) => {
                        warn!(channel, error = %err, "undecodable stored operation")
                    }
                }
            }
            Ok(None) => listener.on_reset(&channel, None),
            Err(err) => warn!(channel, error = %err, "failed to re-resolve watcher state"),
        }
    }
}
