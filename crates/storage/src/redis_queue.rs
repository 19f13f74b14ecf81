//! Redis Streams-based scene queue.
//!
//! Each queue is a stream read through one consumer group. A delivery is
//! leased while it sits in the group's pending list; once it has been idle
//! longer than the visibility timeout another receive claims it. Requeued
//! messages are re-added with their attempt count so the delivery budget
//! survives the round trip.
//!
//! Blocking reads never share a connection with acks and lease renewals:
//! Redis serves one connection's commands in order, so a parked XREADGROUP
//! would hold every other worker's commands behind it.

use async_trait::async_trait;
use redis::{
    aio::MultiplexedConnection,
    streams::{StreamClaimReply, StreamId, StreamReadOptions, StreamReadReply},
    AsyncCommands, Client,
};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, instrument, warn};

use conflux_common::{ConfluxError, ConfluxResult};

use crate::queue::{dead_letter_name, FailOutcome, QueueConfig, SceneMessage, SceneQueue};

const KEY_PREFIX: &str = "conflux:queue:";
const CONSUMER_GROUP: &str = "conflux-workers";
const FIELD_SCENE_ID: &str = "scene_id";
const FIELD_ATTEMPTS: &str = "attempts";

/// Milliseconds XREADGROUP blocks waiting for new entries.
const READ_BLOCK_MS: usize = 2000;

/// Pending entry as reported by extended XPENDING:
/// (entry id, consumer, idle ms, times delivered).
type PendingEntry = (String, String, u64, u64);

/// Redis Streams scene queue.
pub struct RedisSceneQueue {
    client: Client,
    /// Shared connection for non-blocking commands.
    conn: MultiplexedConnection,
    /// Connections for blocking reads, one checked out per receive.
    readers: IdlePool<MultiplexedConnection>,
    name: String,
    stream_key: String,
    dead_letter_key: String,
    consumer: String,
    config: QueueConfig,
}

impl RedisSceneQueue {
    /// Connect to Redis and make sure the stream and consumer group exist.
    pub async fn connect(redis_url: &str, name: &str, config: QueueConfig) -> ConfluxResult<Self> {
        let client = Client::open(redis_url)
            .map_err(|e| ConfluxError::QueueUnavailable(format!("Redis connection failed: {}", e)))?;

        let mut conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| ConfluxError::QueueUnavailable(format!("Redis connection failed: {}", e)))?;

        let stream_key = format!("{}{}", KEY_PREFIX, name);

        // Create consumer group if it doesn't exist
        let _: Result<(), _> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&stream_key)
            .arg(CONSUMER_GROUP)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        let consumer = format!("conflux-{}", uuid::Uuid::new_v4());
        debug!(queue = %name, consumer = %consumer, "Connected to scene queue");

        Ok(Self {
            client,
            conn,
            readers: IdlePool::default(),
            name: name.to_string(),
            dead_letter_key: format!("{}{}", KEY_PREFIX, dead_letter_name(name)),
            stream_key,
            consumer,
            config,
        })
    }

    /// Create the queue and its dead-letter stream if they do not exist.
    pub async fn create(redis_url: &str, name: &str, config: QueueConfig) -> ConfluxResult<Self> {
        let queue = Self::connect(redis_url, name, config).await?;
        let mut conn = queue.conn.clone();
        let _: Result<(), _> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&queue.dead_letter_key)
            .arg(CONSUMER_GROUP)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;
        debug!(queue = %queue.name, "Created scene queue and dead-letter stream");
        Ok(queue)
    }

    /// Delete the queue stream and its dead-letter stream.
    ///
    /// Fails with `QueueNotEmpty` unless `force` is set and entries remain.
    pub async fn delete(self, force: bool) -> ConfluxResult<()> {
        let depth = self.depth().await?;
        if depth > 0 && !force {
            return Err(ConfluxError::QueueNotEmpty {
                queue: self.name.clone(),
                depth,
            });
        }
        let mut conn = self.conn.clone();
        let _: () = conn
            .del(&[&self.stream_key, &self.dead_letter_key])
            .await
            .map_err(|e| ConfluxError::QueueUnavailable(format!("DEL failed: {}", e)))?;
        debug!(queue = %self.name, depth, "Deleted scene queue");
        Ok(())
    }

    /// Check out a connection for a blocking read, opening one if the pool
    /// is empty.
    async fn checkout_reader(&self) -> ConfluxResult<MultiplexedConnection> {
        match self.readers.take() {
            Some(conn) => Ok(conn),
            None => self
                .client
                .get_multiplexed_async_connection()
                .await
                .map_err(|e| ConfluxError::QueueUnavailable(format!("Redis connection failed: {}", e))),
        }
    }

    /// Entries in the stream, leased or not.
    pub async fn depth(&self) -> ConfluxResult<u64> {
        let mut conn = self.conn.clone();
        conn.xlen(&self.stream_key)
            .await
            .map_err(|e| ConfluxError::QueueUnavailable(format!("XLEN failed: {}", e)))
    }

    fn to_message(&self, entry: &StreamId, times_delivered: u64) -> Option<SceneMessage> {
        let scene_id: String = entry.get(FIELD_SCENE_ID)?;
        let attempts: u64 = entry.get(FIELD_ATTEMPTS).unwrap_or(0);
        let delivery_count = (attempts + times_delivered) as u32;
        Some(SceneMessage {
            scene_id,
            receipt: format!("{}@{}", entry.id, times_delivered),
            delivery_count,
        })
    }

    /// Claim pending entries whose lease has run out.
    async fn reclaim_expired(
        &self,
        conn: &mut MultiplexedConnection,
        max_messages: usize,
    ) -> ConfluxResult<Vec<SceneMessage>> {
        let min_idle = self.config.visibility_timeout().as_millis() as u64;

        let pending: Vec<PendingEntry> = redis::cmd("XPENDING")
            .arg(&self.stream_key)
            .arg(CONSUMER_GROUP)
            .arg("IDLE")
            .arg(min_idle)
            .arg("-")
            .arg("+")
            .arg(max_messages)
            .query_async(conn)
            .await
            .map_err(|e| ConfluxError::QueueUnavailable(format!("XPENDING failed: {}", e)))?;

        let mut messages = Vec::new();
        for (id, previous_consumer, _idle, times_delivered) in pending {
            let claimed: StreamClaimReply = conn
                .xclaim(
                    &self.stream_key,
                    CONSUMER_GROUP,
                    &self.consumer,
                    min_idle,
                    &[&id],
                )
                .await
                .map_err(|e| ConfluxError::QueueUnavailable(format!("XCLAIM failed: {}", e)))?;

            // Another consumer may have won the claim, or the entry was deleted.
            for entry in claimed.ids {
                match self.to_message(&entry, times_delivered + 1) {
                    Some(message) => {
                        debug!(
                            scene_id = %message.scene_id,
                            previous_consumer = %previous_consumer,
                            delivery_count = message.delivery_count,
                            "Reclaimed expired lease"
                        );
                        messages.push(message);
                    }
                    None => warn!(entry_id = %entry.id, "Skipping malformed queue entry"),
                }
            }
        }
        Ok(messages)
    }

    /// Resolve a receipt to its entry id, failing if this delivery no longer
    /// holds the lease.
    async fn check_lease(
        &self,
        conn: &mut MultiplexedConnection,
        message: &SceneMessage,
    ) -> ConfluxResult<String> {
        let (id, delivered) = message
            .receipt
            .rsplit_once('@')
            .ok_or_else(|| ConfluxError::LeaseExpired(message.receipt.clone()))?;

        let pending: Vec<PendingEntry> = redis::cmd("XPENDING")
            .arg(&self.stream_key)
            .arg(CONSUMER_GROUP)
            .arg(id)
            .arg(id)
            .arg(1)
            .query_async(conn)
            .await
            .map_err(|e| ConfluxError::QueueUnavailable(format!("XPENDING failed: {}", e)))?;

        match pending.first() {
            Some((_, consumer, _, times_delivered))
                if consumer == &self.consumer && times_delivered.to_string() == delivered =>
            {
                Ok(id.to_string())
            }
            _ => Err(ConfluxError::LeaseExpired(message.receipt.clone())),
        }
    }
}

#[async_trait]
impl SceneQueue for RedisSceneQueue {
    fn name(&self) -> &str {
        &self.name
    }

    fn config(&self) -> &QueueConfig {
        &self.config
    }

    #[instrument(skip(self), fields(queue = %self.name))]
    async fn receive(&self, max_messages: usize) -> ConfluxResult<Vec<SceneMessage>> {
        let mut conn = self.conn.clone();
        let mut messages = self.reclaim_expired(&mut conn, max_messages).await?;
        if messages.len() >= max_messages {
            return Ok(messages);
        }

        let opts = StreamReadOptions::default()
            .group(CONSUMER_GROUP, &self.consumer)
            .count(max_messages - messages.len())
            .block(READ_BLOCK_MS);

        let mut reader = self.checkout_reader().await?;
        let reply: Option<StreamReadReply> = reader
            .xread_options(&[&self.stream_key], &[">"], &opts)
            .await
            .map_err(|e| ConfluxError::QueueUnavailable(format!("Read failed: {}", e)))?;
        // A connection that errored is dropped above rather than pooled.
        self.readers.put(reader);

        for stream_key in reply.map(|r| r.keys).unwrap_or_default() {
            for entry in stream_key.ids {
                match self.to_message(&entry, 1) {
                    Some(message) => messages.push(message),
                    None => warn!(entry_id = %entry.id, "Skipping malformed queue entry"),
                }
            }
        }
        Ok(messages)
    }

    async fn extend(&self, message: &SceneMessage, duration: Duration) -> ConfluxResult<()> {
        let mut conn = self.conn.clone();
        let id = self.check_lease(&mut conn, message).await?;

        let visibility = self.config.visibility_timeout();
        if duration > visibility {
            warn!(
                scene_id = %message.scene_id,
                requested_secs = duration.as_secs(),
                visibility_secs = visibility.as_secs(),
                "Lease extension capped at the visibility timeout"
            );
        }

        // Claiming our own entry with JUSTID sets its idle time without
        // bumping the delivery counter. Reclaim fires once idle reaches the
        // visibility timeout, so the lease ends `duration` from now.
        let claimed: Vec<String> = redis::cmd("XCLAIM")
            .arg(&self.stream_key)
            .arg(CONSUMER_GROUP)
            .arg(&self.consumer)
            .arg(0)
            .arg(&id)
            .arg("IDLE")
            .arg(lease_idle_ms(visibility, duration))
            .arg("JUSTID")
            .query_async(&mut conn)
            .await
            .map_err(|e| ConfluxError::QueueUnavailable(format!("XCLAIM failed: {}", e)))?;

        if claimed.is_empty() {
            return Err(ConfluxError::LeaseExpired(message.receipt.clone()));
        }
        Ok(())
    }

    #[instrument(skip(self, message), fields(queue = %self.name, scene_id = %message.scene_id))]
    async fn ack(&self, message: &SceneMessage) -> ConfluxResult<()> {
        let mut conn = self.conn.clone();
        let id = self.check_lease(&mut conn, message).await?;

        let _: () = redis::pipe()
            .atomic()
            .xack(&self.stream_key, CONSUMER_GROUP, &[&id])
            .ignore()
            .xdel(&self.stream_key, &[&id])
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(|e| ConfluxError::QueueUnavailable(format!("Ack failed: {}", e)))?;

        Ok(())
    }

    #[instrument(skip(self, message), fields(queue = %self.name, scene_id = %message.scene_id))]
    async fn fail(&self, message: &SceneMessage, reason: &str) -> ConfluxResult<FailOutcome> {
        let mut conn = self.conn.clone();
        let id = self.check_lease(&mut conn, message).await?;

        let outcome = if self.config.should_dead_letter(message.delivery_count) {
            FailOutcome::DeadLettered
        } else {
            FailOutcome::Requeued
        };
        let target = match outcome {
            FailOutcome::DeadLettered => &self.dead_letter_key,
            FailOutcome::Requeued => &self.stream_key,
        };

        let _: () = redis::pipe()
            .atomic()
            .cmd("XADD")
            .arg(target)
            .arg("*")
            .arg(FIELD_SCENE_ID)
            .arg(&message.scene_id)
            .arg(FIELD_ATTEMPTS)
            .arg(message.delivery_count)
            .arg("reason")
            .arg(reason)
            .ignore()
            .xack(&self.stream_key, CONSUMER_GROUP, &[&id])
            .ignore()
            .xdel(&self.stream_key, &[&id])
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(|e| ConfluxError::QueueUnavailable(format!("Fail failed: {}", e)))?;

        Ok(outcome)
    }

    async fn push(&self, scene_id: &str) -> ConfluxResult<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("XADD")
            .arg(&self.stream_key)
            .arg("*")
            .arg(FIELD_SCENE_ID)
            .arg(scene_id)
            .arg(FIELD_ATTEMPTS)
            .arg(0)
            .query_async(&mut conn)
            .await
            .map_err(|e| ConfluxError::QueueUnavailable(format!("Enqueue failed: {}", e)))?;
        Ok(())
    }
}

/// Connections not currently checked out. Each checkout is exclusive, so
/// concurrent receives never share a connection.
struct IdlePool<C> {
    idle: Mutex<Vec<C>>,
}

impl<C> Default for IdlePool<C> {
    fn default() -> Self {
        Self {
            idle: Mutex::new(Vec::new()),
        }
    }
}

impl<C> IdlePool<C> {
    fn take(&self) -> Option<C> {
        self.idle.lock().unwrap_or_else(|e| e.into_inner()).pop()
    }

    fn put(&self, conn: C) {
        self.idle.lock().unwrap_or_else(|e| e.into_inner()).push(conn);
    }
}

/// Idle time to stamp on an entry so that it becomes reclaimable `duration`
/// from now. Durations longer than the visibility timeout are capped.
fn lease_idle_ms(visibility: Duration, duration: Duration) -> u64 {
    visibility.saturating_sub(duration).as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idle_pool_hands_each_connection_to_one_reader() {
        let pool = IdlePool::default();
        assert_eq!(pool.take(), None);

        pool.put("reader-1");
        pool.put("reader-2");
        let first = pool.take().unwrap();
        let second = pool.take().unwrap();
        assert_ne!(first, second);
        assert_eq!(pool.take(), None);

        pool.put(first);
        assert_eq!(pool.take(), Some(first));
    }

    #[test]
    fn test_lease_idle_honours_requested_duration() {
        let visibility = Duration::from_secs(18 * 60);
        // A 5 minute extension leaves 13 minutes already "spent".
        assert_eq!(lease_idle_ms(visibility, Duration::from_secs(300)), 13 * 60 * 1000);
        // A full-timeout extension resets the idle clock.
        assert_eq!(lease_idle_ms(visibility, visibility), 0);
        // Longer requests are capped at one visibility timeout.
        assert_eq!(lease_idle_ms(visibility, Duration::from_secs(3600)), 0);
    }
}
