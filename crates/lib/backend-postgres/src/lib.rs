//! PostgreSQL backplane.
//!
//! Queue discipline maps onto `FOR UPDATE SKIP LOCKED` claims inside
//! transactions; the dispatched insert is `ON CONFLICT DO NOTHING`, which
//! gives the set-if-absent dispatch guarantee. Pub/sub rides LISTEN/NOTIFY
//! on one notification channel with a JSON envelope carrying the logical
//! operation channel and the hex-encoded stripped operation.

mod subscription;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use prost::Message;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tracing::warn;

use granary_api::{
    ActionKey, ActionResult, Digest, Directory, DispatchedOperation, ExecuteEntry, ExecutionStage,
    Operation, QueueEntry,
};
use granary_backplane::{
    operation_channel, ActionCacheScan, Backplane, BackplaneError, BackplaneResult, OnUnsubscribe,
    OperationListener, DISPATCH_DEADLINE_MILLIS,
};

use subscription::{Envelope, Subscription, NOTIFY_CHANNEL};

const SCHEMA: &str = include_str!("../migrations/schema.sql");

/// How long the cached worker set is trusted.
const WORKER_SET_STALENESS: Duration = Duration::from_secs(3);

/// How long queue pops wait before reporting an empty queue.
const POP_WAIT: Duration = Duration::from_secs(1);
const POP_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Clone, Debug)]
pub struct PostgresBackplaneConfig {
    pub max_queue_depth: i64,
    pub max_prequeue_depth: i64,
    pub max_connections: u32,
}

impl Default for PostgresBackplaneConfig {
    fn default() -> Self {
        Self {
            max_queue_depth: 10_000,
            max_prequeue_depth: 10_000,
            max_connections: 16,
        }
    }
}

pub struct PostgresBackplane {
    pool: PgPool,
    config: PostgresBackplaneConfig,
    subscription: Subscription,
    worker_set: Mutex<Option<(Instant, HashSet<String>)>>,
}

fn db_err(err: sqlx::Error) -> BackplaneError {
    match err {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
            BackplaneError::Unavailable(err.to_string())
        }
        other => BackplaneError::Internal(other.to_string()),
    }
}

fn decode_message<M: Message + Default>(bytes: &[u8]) -> BackplaneResult<M> {
    M::decode(bytes).map_err(BackplaneError::Decode)
}

fn encode_directories(directories: &[Directory]) -> Vec<u8> {
    let mut buf = Vec::new();
    for directory in directories {
        buf.extend(directory.encode_length_delimited_to_vec());
    }
    buf
}

fn decode_directories(mut bytes: &[u8]) -> BackplaneResult<Vec<Directory>> {
    let mut directories = Vec::new();
    while !bytes.is_empty() {
        let directory =
            Directory::decode_length_delimited(&mut bytes).map_err(BackplaneError::Decode)?;
        directories.push(directory);
    }
    Ok(directories)
}

impl PostgresBackplane {
    pub async fn connect(database_url: &str) -> BackplaneResult<PostgresBackplane> {
        Self::connect_with(database_url, PostgresBackplaneConfig::default()).await
    }

    pub async fn connect_with(
        database_url: &str,
        config: PostgresBackplaneConfig,
    ) -> BackplaneResult<PostgresBackplane> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(database_url)
            .await
            .map_err(db_err)?;
        for statement in SCHEMA.split(';') {
            let statement = statement.trim();
            if statement.is_empty() {
                continue;
            }
            sqlx::query(statement)
                .execute(&pool)
                .await
                .map_err(db_err)?;
        }
        Ok(PostgresBackplane {
            subscription: Subscription::new(pool.clone()),
            pool,
            config,
            worker_set: Mutex::new(None),
        })
    }

    async fn notify(&self, envelope: &Envelope) -> BackplaneResult<()> {
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(NOTIFY_CHANNEL)
            .bind(encode_envelope(envelope)?)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }
}

fn encode_envelope(envelope: &Envelope) -> BackplaneResult<String> {
    serde_json::to_string(envelope).map_err(|err| BackplaneError::Internal(err.to_string()))
}

/// NOTIFY is transactional: queued inside `tx`, delivered on commit, so the
/// publish is atomic with the queue-state move.
async fn notify_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    envelope: &Envelope,
) -> BackplaneResult<()> {
    sqlx::query("SELECT pg_notify($1, $2)")
        .bind(NOTIFY_CHANNEL)
        .bind(encode_envelope(envelope)?)
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;
    Ok(())
}

#[async_trait::async_trait]
impl Backplane for PostgresBackplane {
    async fn start(&self, listener: Arc<dyn OperationListener>) -> BackplaneResult<()> {
        self.subscription.start(listener);
        Ok(())
    }

    async fn stop(&self) -> BackplaneResult<()> {
        self.subscription.stop();
        Ok(())
    }

    fn is_stopped(&self) -> bool {
        self.subscription.is_stopped()
    }

    fn set_on_unsubscribe(&self, on_unsubscribe: OnUnsubscribe) {
        self.subscription.set_on_unsubscribe(on_unsubscribe);
    }

    async fn subscribe_channel(&self, channel: &str) -> BackplaneResult<()> {
        self.subscription.subscribe(channel);
        Ok(())
    }

    async fn unsubscribe_channel(&self, channel: &str) -> BackplaneResult<()> {
        self.subscription.unsubscribe(channel);
        Ok(())
    }

    async fn publish_expire(&self, channel: &str) -> BackplaneResult<()> {
        self.notify(&Envelope::expire(channel)).await
    }

    async fn add_worker(&self, worker_name: &str) -> BackplaneResult<bool> {
        let result = sqlx::query("INSERT INTO workers (name) VALUES ($1) ON CONFLICT DO NOTHING")
            .bind(worker_name)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        *self.worker_set.lock().expect("worker set poisoned") = None;
        Ok(result.rows_affected() > 0)
    }

    async fn remove_worker(&self, worker_name: &str) -> BackplaneResult<bool> {
        let result = sqlx::query("DELETE FROM workers WHERE name = $1")
            .bind(worker_name)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        if let Some((_, workers)) = self
            .worker_set
            .lock()
            .expect("worker set poisoned")
            .as_mut()
        {
            workers.remove(worker_name);
        }
        Ok(result.rows_affected() > 0)
    }

    async fn get_workers(&self) -> BackplaneResult<HashSet<String>> {
        {
            let cached = self.worker_set.lock().expect("worker set poisoned");
            if let Some((fetched_at, workers)) = cached.as_ref() {
                if fetched_at.elapsed() < WORKER_SET_STALENESS {
                    return Ok(workers.clone());
                }
            }
        }
        let rows = sqlx::query("SELECT name FROM workers")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        let workers: HashSet<String> = rows
            .into_iter()
            .map(|row| row.get::<String, _>("name"))
            .collect();
        *self.worker_set.lock().expect("worker set poisoned") =
            Some((Instant::now(), workers.clone()));
        Ok(workers)
    }

    async fn get_action_result(&self, key: &ActionKey) -> BackplaneResult<Option<ActionResult>> {
        let row = sqlx::query("SELECT action_result FROM action_cache WHERE action_key = $1")
            .bind(key.digest().to_key())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        let row = match row {
            None => return Ok(None),
            Some(row) => row,
        };
        let bytes: Vec<u8> = row.get("action_result");
        match decode_message::<ActionResult>(&bytes) {
            Ok(result) => Ok(Some(result)),
            Err(err) => {
                warn!(key = key.digest().to_key(), error = %err, "removing undecodable action result");
                self.remove_action_result(key).await?;
                Ok(None)
            }
        }
    }

    async fn put_action_result(
        &self,
        key: &ActionKey,
        result: &ActionResult,
    ) -> BackplaneResult<()> {
        sqlx::query(
            "INSERT INTO action_cache (action_key, action_result) VALUES ($1, $2) \
             ON CONFLICT (action_key) DO UPDATE SET action_result = $2, stored_at = now()",
        )
        .bind(key.digest().to_key())
        .bind(result.encode_to_vec())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn remove_action_result(&self, key: &ActionKey) -> BackplaneResult<()> {
        sqlx::query("DELETE FROM action_cache WHERE action_key = $1")
            .bind(key.digest().to_key())
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn remove_action_results(&self, keys: &[ActionKey]) -> BackplaneResult<()> {
        let keys: Vec<String> = keys.iter().map(|key| key.digest().to_key()).collect();
        sqlx::query("DELETE FROM action_cache WHERE action_key = ANY($1)")
            .bind(&keys)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn scan_action_cache(
        &self,
        token: Option<String>,
        count: usize,
    ) -> BackplaneResult<ActionCacheScan> {
        let rows = sqlx::query(
            "SELECT action_key, action_result FROM action_cache WHERE action_key > $1 \
             ORDER BY action_key LIMIT $2",
        )
        .bind(token.unwrap_or_default())
        .bind(count as i64 + 1)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let mut entries = Vec::new();
        for row in &rows {
            let key: String = row.get("action_key");
            let bytes: Vec<u8> = row.get("action_result");
            if let (Some(digest), Ok(result)) =
                (Digest::parse_key(&key), decode_message::<ActionResult>(&bytes))
            {
                entries.push((ActionKey(digest), result));
            }
        }
        if entries.len() > count {
            entries.truncate(count);
            let next = entries
                .last()
                .map(|(key, _)| key.digest().to_key());
            Ok(ActionCacheScan {
                token: next,
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
        sqlx::query(
            "INSERT INTO blob_locations (blob_key, worker_name) VALUES ($1, $2) \
             ON CONFLICT DO NOTHING",
        )
        .bind(digest.to_key())
        .bind(worker_name)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn add_blobs_location(
        &self,
        digests: &[Digest],
        worker_name: &str,
    ) -> BackplaneResult<()> {
        let keys: Vec<String> = digests.iter().map(Digest::to_key).collect();
        sqlx::query(
            "INSERT INTO blob_locations (blob_key, worker_name) \
             SELECT unnest($1::text[]), $2 ON CONFLICT DO NOTHING",
        )
        .bind(&keys)
        .bind(worker_name)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn remove_blob_location(
        &self,
        digest: &Digest,
        worker_name: &str,
    ) -> BackplaneResult<()> {
        sqlx::query("DELETE FROM blob_locations WHERE blob_key = $1 AND worker_name = $2")
            .bind(digest.to_key())
            .bind(worker_name)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn remove_blobs_location(
        &self,
        digests: &[Digest],
        worker_name: &str,
    ) -> BackplaneResult<()> {
        let keys: Vec<String> = digests.iter().map(Digest::to_key).collect();
        sqlx::query("DELETE FROM blob_locations WHERE blob_key = ANY($1) AND worker_name = $2")
            .bind(&keys)
            .bind(worker_name)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn adjust_blob_locations(
        &self,
        digest: &Digest,
        add: &HashSet<String>,
        remove: &HashSet<String>,
    ) -> BackplaneResult<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let add: Vec<String> = add.iter().cloned().collect();
        let remove: Vec<String> = remove.iter().cloned().collect();
        sqlx::query(
            "INSERT INTO blob_locations (blob_key, worker_name) \
             SELECT $1, unnest($2::text[]) ON CONFLICT DO NOTHING",
        )
        .bind(digest.to_key())
        .bind(&add)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        sqlx::query("DELETE FROM blob_locations WHERE blob_key = $1 AND worker_name = ANY($2)")
            .bind(digest.to_key())
            .bind(&remove)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn get_blob_location_set(&self, digest: &Digest) -> BackplaneResult<HashSet<String>> {
        let rows = sqlx::query("SELECT worker_name FROM blob_locations WHERE blob_key = $1")
            .bind(digest.to_key())
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(rows
            .into_iter()
            .map(|row| row.get::<String, _>("worker_name"))
            .collect())
    }

    async fn get_blob_digests_workers(
        &self,
        digests: &[Digest],
    ) -> BackplaneResult<HashMap<Digest, HashSet<String>>> {
        let keys: Vec<String> = digests.iter().map(Digest::to_key).collect();
        let rows = sqlx::query(
            "SELECT blob_key, worker_name FROM blob_locations WHERE blob_key = ANY($1)",
        )
        .bind(&keys)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        let mut locations: HashMap<Digest, HashSet<String>> = HashMap::new();
        for row in rows {
            let key: String = row.get("blob_key");
            if let Some(digest) = Digest::parse_key(&key) {
                locations
                    .entry(digest)
                    .or_default()
                    .insert(row.get::<String, _>("worker_name"));
            }
        }
        Ok(locations)
    }

    async fn get_operation(&self, operation_name: &str) -> BackplaneResult<Option<Operation>> {
        let row = sqlx::query("SELECT operation FROM operations WHERE name = $1")
            .bind(operation_name)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        match row {
            None => Ok(None),
            Some(row) => {
                let bytes: Vec<u8> = row.get("operation");
                Ok(Some(decode_message(&bytes)?))
            }
        }
    }

    async fn put_operation(
        &self,
        operation: &Operation,
        stage: ExecutionStage,
    ) -> BackplaneResult<bool> {
        let queue = stage == ExecutionStage::Queued;
        let complete = !queue && operation.done;
        let publish = !queue && stage != ExecutionStage::Unknown;

        let mut tx = self.pool.begin().await.map_err(db_err)?;
        if complete {
            sqlx::query("DELETE FROM dispatched_operations WHERE operation_name = $1")
                .bind(&operation.name)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
            sqlx::query("DELETE FROM queueing_operations WHERE operation_name = $1")
                .bind(&operation.name)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
            sqlx::query("INSERT INTO completed_operations (operation_name) VALUES ($1)")
                .bind(&operation.name)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        }
        sqlx::query(
            "INSERT INTO operations (name, operation) VALUES ($1, $2) \
             ON CONFLICT (name) DO UPDATE SET operation = $2, updated_at = now()",
        )
        .bind(&operation.name)
        .bind(operation.encode_to_vec())
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        if publish {
            let envelope =
                Envelope::operation(&operation_channel(&operation.name), &operation.stripped());
            notify_tx(&mut tx, &envelope).await?;
        }
        tx.commit().await.map_err(db_err)?;
        Ok(true)
    }

    async fn delete_operation(&self, operation_name: &str) -> BackplaneResult<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        for statement in [
            "DELETE FROM dispatched_operations WHERE operation_name = $1",
            "DELETE FROM queued_operations WHERE operation_name = $1",
            "DELETE FROM prequeue WHERE operation_name = $1",
            "DELETE FROM completed_operations WHERE operation_name = $1",
            "DELETE FROM queueing_operations WHERE operation_name = $1",
            "DELETE FROM operations WHERE name = $1",
        ] {
            sqlx::query(statement)
                .bind(operation_name)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        }
        notify_tx(&mut tx, &Envelope::removed(&operation_channel(operation_name))).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn get_operations(&self) -> BackplaneResult<Vec<String>> {
        let rows = sqlx::query(
            "SELECT operation_name FROM queued_operations \
             UNION SELECT operation_name FROM dispatched_operations \
             UNION SELECT operation_name FROM completed_operations",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(rows
            .into_iter()
            .map(|row| row.get::<String, _>("operation_name"))
            .collect())
    }

    async fn prequeue(&self, entry: &ExecuteEntry, operation: &Operation) -> BackplaneResult<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        sqlx::query(
            "INSERT INTO operations (name, operation) VALUES ($1, $2) \
             ON CONFLICT (name) DO UPDATE SET operation = $2, updated_at = now()",
        )
        .bind(&operation.name)
        .bind(operation.encode_to_vec())
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        sqlx::query("INSERT INTO prequeue (operation_name, execute_entry) VALUES ($1, $2)")
            .bind(&entry.operation_name)
            .bind(entry.encode_to_vec())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn deprequeue_operation(&self) -> BackplaneResult<Option<ExecuteEntry>> {
        let waited = Instant::now();
        loop {
            let row = sqlx::query(
                "DELETE FROM prequeue WHERE id = ( \
                   SELECT id FROM prequeue ORDER BY id LIMIT 1 FOR UPDATE SKIP LOCKED \
                 ) RETURNING execute_entry",
            )
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
            if let Some(row) = row {
                let bytes: Vec<u8> = row.get("execute_entry");
                return Ok(Some(decode_message(&bytes)?));
            }
            if waited.elapsed() >= POP_WAIT {
                return Ok(None);
            }
            tokio::time::sleep(POP_INTERVAL).await;
        }
    }

    async fn queueing(&self, operation_name: &str) -> BackplaneResult<()> {
        sqlx::query(
            "INSERT INTO queueing_operations (operation_name, deadline_at) VALUES ($1, $2) \
             ON CONFLICT (operation_name) DO UPDATE SET deadline_at = $2",
        )
        .bind(operation_name)
        .bind(Utc::now().timestamp_millis() + DISPATCH_DEADLINE_MILLIS)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn queue(&self, entry: &QueueEntry, operation: &Operation) -> BackplaneResult<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        sqlx::query("DELETE FROM dispatched_operations WHERE operation_name = $1")
            .bind(&operation.name)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        sqlx::query("DELETE FROM queueing_operations WHERE operation_name = $1")
            .bind(&operation.name)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        sqlx::query(
            "INSERT INTO operations (name, operation) VALUES ($1, $2) \
             ON CONFLICT (name) DO UPDATE SET operation = $2, updated_at = now()",
        )
        .bind(&operation.name)
        .bind(operation.encode_to_vec())
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        sqlx::query(
            "INSERT INTO queued_operations (operation_name, queue_entry) VALUES ($1, $2) \
             ON CONFLICT (operation_name) DO NOTHING",
        )
        .bind(&operation.name)
        .bind(entry.encode_to_vec())
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        let envelope =
            Envelope::operation(&operation_channel(&operation.name), &operation.stripped());
        notify_tx(&mut tx, &envelope).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn dispatch_operation(&self) -> BackplaneResult<Option<QueueEntry>> {
        let waited = Instant::now();
        loop {
            let mut tx = self.pool.begin().await.map_err(db_err)?;
            let row = sqlx::query(
                "DELETE FROM queued_operations WHERE id = ( \
                   SELECT id FROM queued_operations ORDER BY id LIMIT 1 FOR UPDATE SKIP LOCKED \
                 ) RETURNING operation_name, queue_entry",
            )
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?;
            match row {
                Some(row) => {
                    let operation_name: String = row.get("operation_name");
                    let bytes: Vec<u8> = row.get("queue_entry");
                    let claimed = sqlx::query(
                        "INSERT INTO dispatched_operations (operation_name, requeue_at, queue_entry) \
                         VALUES ($1, $2, $3) ON CONFLICT (operation_name) DO NOTHING",
                    )
                    .bind(&operation_name)
                    .bind(Utc::now().timestamp_millis() + DISPATCH_DEADLINE_MILLIS)
                    .bind(&bytes)
                    .execute(&mut *tx)
                    .await
                    .map_err(db_err)?;
                    tx.commit().await.map_err(db_err)?;
                    if claimed.rows_affected() == 0 {
                        // Already dispatched under this name; drop the
                        // stale queue copy.
                        return Ok(None);
                    }
                    return Ok(Some(decode_message(&bytes)?));
                }
                None => {
                    tx.commit().await.map_err(db_err)?;
                    if waited.elapsed() >= POP_WAIT {
                        return Ok(None);
                    }
                    tokio::time::sleep(POP_INTERVAL).await;
                }
            }
        }
    }

    async fn poll_operation(
        &self,
        entry: &QueueEntry,
        _stage: ExecutionStage,
        requeue_at: i64,
    ) -> BackplaneResult<bool> {
        let operation_name = entry
            .execute_entry
            .as_ref()
            .map(|execute_entry| execute_entry.operation_name.as_str())
            .unwrap_or_default();
        let result =
            sqlx::query("UPDATE dispatched_operations SET requeue_at = $2 WHERE operation_name = $1")
                .bind(operation_name)
                .bind(requeue_at)
                .execute(&self.pool)
                .await
                .map_err(db_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn requeue_dispatched_operation(&self, entry: &QueueEntry) -> BackplaneResult<()> {
        let operation_name = entry
            .execute_entry
            .as_ref()
            .map(|execute_entry| execute_entry.operation_name.clone())
            .unwrap_or_default();
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        sqlx::query("DELETE FROM dispatched_operations WHERE operation_name = $1")
            .bind(&operation_name)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        sqlx::query(
            "INSERT INTO queued_operations (operation_name, queue_entry) VALUES ($1, $2) \
             ON CONFLICT (operation_name) DO NOTHING",
        )
        .bind(&operation_name)
        .bind(entry.encode_to_vec())
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn complete_operation(&self, operation_name: &str) -> BackplaneResult<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let removed =
            sqlx::query("DELETE FROM dispatched_operations WHERE operation_name = $1")
                .bind(operation_name)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        if removed.rows_affected() == 0 {
            warn!(operation = operation_name, "completed operation was not dispatched");
        }
        sqlx::query(
            "INSERT INTO completed_operations (operation_name) \
             SELECT $1 WHERE NOT EXISTS ( \
               SELECT 1 FROM completed_operations WHERE operation_name = $1)",
        )
        .bind(operation_name)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn get_dispatched_operations(&self) -> BackplaneResult<Vec<DispatchedOperation>> {
        let rows = sqlx::query(
            "SELECT operation_name, requeue_at, queue_entry FROM dispatched_operations",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        let mut dispatched = Vec::new();
        for row in rows {
            let bytes: Vec<u8> = row.get("queue_entry");
            dispatched.push(DispatchedOperation {
                name: row.get("operation_name"),
                requeue_at: row.get("requeue_at"),
                queue_entry: Some(decode_message(&bytes)?),
            });
        }
        Ok(dispatched)
    }

    async fn destroy_oldest_completed_operations(&self, limit: u64) -> BackplaneResult<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let rows = sqlx::query(
            "DELETE FROM completed_operations WHERE id NOT IN ( \
               SELECT id FROM completed_operations ORDER BY id DESC LIMIT $1 \
             ) RETURNING operation_name",
        )
        .bind(limit as i64)
        .fetch_all(&mut *tx)
        .await
        .map_err(db_err)?;
        let names: Vec<String> = rows
            .into_iter()
            .map(|row| row.get::<String, _>("operation_name"))
            .collect();
        if !names.is_empty() {
            sqlx::query("DELETE FROM operations WHERE name = ANY($1)")
                .bind(&names)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn put_tree(
        &self,
        root_digest: &Digest,
        directories: &[Directory],
    ) -> BackplaneResult<()> {
        sqlx::query(
            "INSERT INTO trees (root_key, directories) VALUES ($1, $2) \
             ON CONFLICT (root_key) DO UPDATE SET directories = $2",
        )
        .bind(root_digest.to_key())
        .bind(encode_directories(directories))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_tree(&self, root_digest: &Digest) -> BackplaneResult<Option<Vec<Directory>>> {
        let row = sqlx::query("SELECT directories FROM trees WHERE root_key = $1")
            .bind(root_digest.to_key())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        match row {
            None => Ok(None),
            Some(row) => {
                let bytes: Vec<u8> = row.get("directories");
                Ok(Some(decode_directories(&bytes)?))
            }
        }
    }

    async fn remove_tree(&self, root_digest: &Digest) -> BackplaneResult<()> {
        sqlx::query("DELETE FROM trees WHERE root_key = $1")
            .bind(root_digest.to_key())
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn can_queue(&self) -> BackplaneResult<bool> {
        let row = sqlx::query("SELECT count(*) AS depth FROM queued_operations")
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(row.get::<i64, _>("depth") < self.config.max_queue_depth)
    }

    async fn can_prequeue(&self) -> BackplaneResult<bool> {
        let row = sqlx::query("SELECT count(*) AS depth FROM prequeue")
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(row.get::<i64, _>("depth") < self.config.max_prequeue_depth)
    }
}
