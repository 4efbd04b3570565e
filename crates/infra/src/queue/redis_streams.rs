//! Redis Streams-backed work queue (durable, at-least-once delivery).
//!
//! - **Stream**: `{ns}:queue`, one entry per scheduled run of a job
//! - **Consumer group**: `{ns}-workers`; each entry goes to one consumer
//! - **Delayed retries**: `{ns}:queue:delayed` sorted set scored by due time,
//!   promoted back onto the stream by whichever consumer polls first
//! - **Dead-letter queue**: `{ns}:queue:dlq` stream
//! - **Exclusivity**: `{ns}:queue:active:{job}` lease held while a delivery
//!   runs, valued with the delivery's entry id
//!
//! The shared connection is multiplexed, so reads poll instead of using
//! `BLOCK`. Deliveries lost to a crashed consumer are not recovered here: the
//! watchdog reclaims their jobs once they look stuck, and a late settle of
//! the lost delivery no longer owns the lease.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::streams::StreamReadReply;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use fetchq_core::JobId;

use super::types::{DeadLetterEntry, Delivery, JobPayload, NackOutcome, QueueCounts, RetryPolicy};
use super::{QueueError, WorkQueue, WorkSource};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Default lease on a job while one delivery of it runs.
const DEFAULT_ACTIVE_LEASE: Duration = Duration::from_secs(15 * 60);

/// Wait before retrying a delivery whose job was still leased elsewhere.
const BUSY_REQUEUE_DELAY: Duration = Duration::from_secs(1);

const PROMOTE_BATCH: usize = 32;

/// Drop the lease only if it still belongs to the delivery settling it.
const RELEASE_LEASE: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
";

impl From<redis::RedisError> for QueueError {
    fn from(e: redis::RedisError) -> Self {
        if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout() {
            QueueError::Connection(e.to_string())
        } else {
            QueueError::Command(e.to_string())
        }
    }
}

/// A run waiting in the delayed set.
#[derive(Debug, Serialize, Deserialize)]
struct Scheduled {
    payload: JobPayload,
    attempt: u32,
}

enum Settled {
    Superseded,
    Rerun,
    Done,
}

#[derive(Clone)]
pub struct RedisStreamsWorkQueue {
    conn: ConnectionManager,
    stream_key: String,
    group: String,
    consumer: String,
    delayed_key: String,
    dlq_key: String,
    namespace: String,
    policy: RetryPolicy,
    poll_interval: Duration,
    active_lease: Duration,
}

impl std::fmt::Debug for RedisStreamsWorkQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStreamsWorkQueue")
            .field("stream_key", &self.stream_key)
            .field("group", &self.group)
            .field("consumer", &self.consumer)
            .finish_non_exhaustive()
    }
}

impl RedisStreamsWorkQueue {
    /// Connect and make sure the consumer group exists.
    ///
    /// * `conn` - shared connection (see `RedisStore::connection`)
    /// * `namespace` - key prefix, e.g. "fetchq"
    pub async fn new(
        conn: ConnectionManager,
        namespace: impl Into<String>,
        policy: RetryPolicy,
    ) -> Result<Self, QueueError> {
        let namespace = namespace.into();
        let queue = Self {
            conn,
            stream_key: format!("{namespace}:queue"),
            group: format!("{namespace}-workers"),
            consumer: format!("consumer-{}", uuid::Uuid::now_v7()),
            delayed_key: format!("{namespace}:queue:delayed"),
            dlq_key: format!("{namespace}:queue:dlq"),
            namespace,
            policy,
            poll_interval: DEFAULT_POLL_INTERVAL,
            active_lease: DEFAULT_ACTIVE_LEASE,
        };
        queue.ensure_consumer_group().await?;
        Ok(queue)
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_active_lease(mut self, active_lease: Duration) -> Self {
        self.active_lease = active_lease;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    fn active_key(&self, id: JobId) -> String {
        format!("{}:queue:active:{id}", self.namespace)
    }

    fn waiting_key(&self, id: JobId) -> String {
        format!("{}:queue:waiting:{id}", self.namespace)
    }

    fn rerun_key(&self, id: JobId) -> String {
        format!("{}:queue:rerun:{id}", self.namespace)
    }

    fn counter_key(&self, name: &str) -> String {
        format!("{}:queue:{name}", self.namespace)
    }

    async fn ensure_consumer_group(&self) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        // Fails with BUSYGROUP when the group already exists.
        let created: redis::RedisResult<String> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match created {
            Ok(_) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn push(&self, payload: &JobPayload, attempt: u32) -> Result<String, QueueError> {
        let body = serde_json::to_string(payload).map_err(|e| QueueError::Payload(e.to_string()))?;
        let mut conn = self.conn.clone();
        let id: String = redis::cmd("XADD")
            .arg(&self.stream_key)
            .arg("*")
            .arg("job_id")
            .arg(payload.job_id.to_string())
            .arg("attempt")
            .arg(attempt)
            .arg("payload")
            .arg(body)
            .query_async(&mut conn)
            .await?;
        Ok(id)
    }

    async fn schedule(&self, payload: &JobPayload, attempt: u32, delay: Duration) -> Result<(), QueueError> {
        let member = serde_json::to_string(&Scheduled {
            payload: payload.clone(),
            attempt,
        })
        .map_err(|e| QueueError::Payload(e.to_string()))?;
        let due = Utc::now().timestamp_millis() + delay.as_millis() as i64;

        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("ZADD")
            .arg(&self.delayed_key)
            .arg(due)
            .arg(member)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    /// Move due delayed runs back onto the stream. ZREM decides which
    /// consumer promotes a given run.
    async fn promote_due(&self) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let due: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(&self.delayed_key)
            .arg("-inf")
            .arg(Utc::now().timestamp_millis())
            .arg("LIMIT")
            .arg(0)
            .arg(PROMOTE_BATCH)
            .query_async(&mut conn)
            .await?;

        for member in due {
            let removed: i64 = redis::cmd("ZREM")
                .arg(&self.delayed_key)
                .arg(&member)
                .query_async(&mut conn)
                .await?;
            if removed == 0 {
                continue;
            }
            match serde_json::from_str::<Scheduled>(&member) {
                Ok(run) => {
                    self.push(&run.payload, run.attempt).await?;
                }
                Err(e) => warn!(error = %e, "dropping undecodable delayed run"),
            }
        }
        Ok(())
    }

    async fn read_one(&self) -> Result<Option<(String, JobPayload, u32)>, QueueError> {
        let mut conn = self.conn.clone();
        let reply: Option<StreamReadReply> = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.group)
            .arg(&self.consumer)
            .arg("COUNT")
            .arg(1)
            .arg("STREAMS")
            .arg(&self.stream_key)
            .arg(">")
            .query_async(&mut conn)
            .await?;

        let Some(entry) = reply
            .into_iter()
            .flat_map(|r| r.keys)
            .flat_map(|k| k.ids)
            .next()
        else {
            return Ok(None);
        };

        let attempt = entry.get::<u32>("attempt").unwrap_or(1);
        let payload = entry
            .get::<String>("payload")
            .ok_or_else(|| QueueError::Payload(format!("entry {} has no payload", entry.id)))
            .and_then(|raw| serde_json::from_str::<JobPayload>(&raw).map_err(|e| QueueError::Payload(e.to_string())));

        match payload {
            Ok(payload) => Ok(Some((entry.id, payload, attempt))),
            Err(e) => {
                warn!(entry_id = %entry.id, error = %e, "discarding undecodable queue entry");
                self.remove_entry(&entry.id).await?;
                Ok(None)
            }
        }
    }

    async fn remove_entry(&self, entry_id: &str) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.cmd("XACK").arg(&self.stream_key).arg(&self.group).arg(entry_id).ignore();
        pipe.cmd("XDEL").arg(&self.stream_key).arg(entry_id).ignore();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    /// Finish a delivery.
    async fn settle(&self, delivery: &Delivery, counter: &str) -> Result<Settled, QueueError> {
        self.remove_entry(&delivery.tag).await?;

        let id = delivery.job_id();
        let mut conn = self.conn.clone();
        let released: i64 = redis::Script::new(RELEASE_LEASE)
            .key(self.active_key(id))
            .arg(&delivery.tag)
            .invoke_async(&mut conn)
            .await?;
        if released == 0 {
            debug!(%id, entry_id = %delivery.tag, "settle for a reclaimed delivery ignored");
            return Ok(Settled::Superseded);
        }

        let mut pipe = redis::pipe();
        pipe.cmd("INCR").arg(self.counter_key(counter)).ignore();
        pipe.cmd("DEL").arg(self.rerun_key(id));
        let (rerun,): (i64,) = pipe.query_async(&mut conn).await?;

        if rerun > 0 {
            debug!(%id, "running job again after settle");
            self.push(&delivery.payload, 1).await?;
            return Ok(Settled::Rerun);
        }
        Ok(Settled::Done)
    }

    async fn count(&self, cmd: &str, key: &str) -> Result<u64, QueueError> {
        let mut conn = self.conn.clone();
        let n: i64 = redis::cmd(cmd).arg(key).query_async(&mut conn).await?;
        Ok(n.max(0) as u64)
    }

    async fn counter(&self, name: &str) -> Result<u64, QueueError> {
        let mut conn = self.conn.clone();
        let n: Option<i64> = redis::cmd("GET").arg(self.counter_key(name)).query_async(&mut conn).await?;
        Ok(n.unwrap_or(0).max(0) as u64)
    }
}

#[async_trait]
impl WorkQueue for RedisStreamsWorkQueue {
    #[instrument(skip(self, payload), err)]
    async fn enqueue(&self, job_id: JobId, payload: JobPayload) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let active: i64 = redis::cmd("EXISTS").arg(self.active_key(job_id)).query_async(&mut conn).await?;
        if active > 0 {
            let _: () = redis::cmd("SET")
                .arg(self.rerun_key(job_id))
                .arg(1)
                .arg("PX")
                .arg(self.active_lease.as_millis() as u64)
                .query_async(&mut conn)
                .await?;
            debug!(%job_id, "job is active; scheduling a rerun");
            return Ok(());
        }

        // Marker cleared when the entry is delivered.
        let fresh: Option<String> = redis::cmd("SET")
            .arg(self.waiting_key(job_id))
            .arg(1)
            .arg("NX")
            .arg("PX")
            .arg(self.active_lease.as_millis() as u64)
            .query_async(&mut conn)
            .await?;
        if fresh.is_none() {
            debug!(%job_id, "job already waiting");
            return Ok(());
        }

        self.push(&payload, 1).await?;
        Ok(())
    }

    #[instrument(skip(self, payload), err)]
    async fn reclaim(&self, job_id: JobId, payload: JobPayload) -> Result<bool, QueueError> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.cmd("DEL").arg(self.active_key(job_id));
        pipe.cmd("DEL").arg(self.rerun_key(job_id)).ignore();
        let (dropped,): (i64,) = pipe.query_async(&mut conn).await?;
        if dropped > 0 {
            warn!(%job_id, "taking job back from its executor");
        }

        let fresh: Option<String> = redis::cmd("SET")
            .arg(self.waiting_key(job_id))
            .arg(1)
            .arg("NX")
            .arg("PX")
            .arg(self.active_lease.as_millis() as u64)
            .query_async(&mut conn)
            .await?;
        if fresh.is_none() {
            debug!(%job_id, "job already waiting");
            return Ok(false);
        }

        self.push(&payload, 1).await?;
        Ok(true)
    }

    async fn counts(&self) -> Result<QueueCounts, QueueError> {
        let mut conn = self.conn.clone();
        // XPENDING summary: [count, min-id, max-id, consumers]
        let summary: redis::Value = redis::cmd("XPENDING")
            .arg(&self.stream_key)
            .arg(&self.group)
            .query_async(&mut conn)
            .await?;
        let active = match summary {
            redis::Value::Bulk(items) => match items.first() {
                Some(redis::Value::Int(n)) => (*n).max(0) as u64,
                _ => 0,
            },
            _ => 0,
        };

        let entries = self.count("XLEN", &self.stream_key).await?;
        Ok(QueueCounts {
            waiting: entries.saturating_sub(active),
            active,
            delayed: self.count("ZCARD", &self.delayed_key).await?,
            completed: self.counter("completed").await?,
            failed: self.counter("failed").await?,
            dead_lettered: self.count("XLEN", &self.dlq_key).await?,
        })
    }
}

#[async_trait]
impl WorkSource for RedisStreamsWorkQueue {
    async fn next(&self) -> Result<Delivery, QueueError> {
        loop {
            self.promote_due().await?;

            let Some((entry_id, payload, attempt)) = self.read_one().await? else {
                tokio::time::sleep(self.poll_interval).await;
                continue;
            };

            let id = payload.job_id;
            let mut conn = self.conn.clone();
            let _: i64 = redis::cmd("DEL").arg(self.waiting_key(id)).query_async(&mut conn).await?;
            let leased: Option<String> = redis::cmd("SET")
                .arg(self.active_key(id))
                .arg(&entry_id)
                .arg("NX")
                .arg("PX")
                .arg(self.active_lease.as_millis() as u64)
                .query_async(&mut conn)
                .await?;

            if leased.is_none() {
                debug!(%id, "job leased by another consumer; delaying");
                self.remove_entry(&entry_id).await?;
                self.schedule(&payload, attempt, BUSY_REQUEUE_DELAY).await?;
                continue;
            }

            return Ok(Delivery {
                payload,
                attempt,
                tag: entry_id,
            });
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        self.settle(delivery, "completed").await.map(|_| ())
    }

    #[instrument(skip(self, delivery), fields(job_id = %delivery.job_id(), attempt = delivery.attempt), err)]
    async fn nack(&self, delivery: &Delivery, retry: bool, reason: &str) -> Result<NackOutcome, QueueError> {
        match self.settle(delivery, "failed").await? {
            Settled::Superseded => return Ok(NackOutcome::Superseded),
            Settled::Rerun => return Ok(NackOutcome::Retrying { delay: Duration::ZERO }),
            Settled::Done => {}
        }

        if retry && self.policy.should_retry(delivery.attempt) {
            let delay = self.policy.redelivery_delay(delivery.job_id(), delivery.attempt);
            self.schedule(&delivery.payload, delivery.attempt + 1, delay).await?;
            return Ok(NackOutcome::Retrying { delay });
        }

        let entry = DeadLetterEntry::new(delivery.payload.clone(), delivery.attempt, reason);
        let body = serde_json::to_string(&entry).map_err(|e| QueueError::Payload(e.to_string()))?;
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("XADD")
            .arg(&self.dlq_key)
            .arg("*")
            .arg("original_message_id")
            .arg(&delivery.tag)
            .arg("attempts")
            .arg(delivery.attempt)
            .arg("payload")
            .arg(body)
            .query_async(&mut conn)
            .await?;

        warn!(job_id = %delivery.job_id(), attempts = delivery.attempt, reason, "job sent to dead-letter queue");
        Ok(NackOutcome::DeadLettered)
    }

    fn will_retry(&self, delivery: &Delivery) -> bool {
        self.policy.should_retry(delivery.attempt)
    }
}
