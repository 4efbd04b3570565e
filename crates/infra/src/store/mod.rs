//! Shared key/value store capability.
//!
//! Every piece of cross-process job state (records, idempotency entries,
//! concurrency counters, the processing set) lives behind this trait. The
//! operations are deliberately the primitive, individually atomic commands a
//! Redis-like store offers; callers compose them but never hold locks across
//! them.
//!
//! ## Implementations
//!
//! - [`InMemoryStore`]: process-local, for tests and single-process dev mode
//! - `RedisStore` (feature `redis`): one shared connection per process

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis;

pub use in_memory::InMemoryStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisStore;

pub type StoreResult<T> = Result<T, StoreError>;

/// Store failure. All variants map to `StoreUnavailable` at the orchestrator
/// boundary; retrying is the store client's concern.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("store connection error: {0}")]
    Connection(String),

    #[error("store command error: {0}")]
    Command(String),

    #[error("store lock poisoned")]
    Poisoned,
}

/// Messages from a pub/sub channel, delivered to this subscriber only while
/// it stays connected (no replay).
pub type ChannelReceiver = mpsc::UnboundedReceiver<String>;

#[async_trait]
pub trait SharedStore: Send + Sync + 'static {
    /// Set hash fields, optionally (re)setting the whole-key expiry.
    ///
    /// Without a TTL an existing expiry is preserved.
    async fn hset_all(&self, key: &str, fields: &[(&str, String)], ttl: Option<Duration>) -> StoreResult<()>;

    /// All fields of a hash; empty when the key is missing or expired.
    async fn hget_all(&self, key: &str) -> StoreResult<HashMap<String, String>>;

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool>;

    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Set-if-absent with expiry. Returns `true` when this call created the key.
    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool>;

    /// Atomic increment (negative `delta` decrements). Missing keys start at 0.
    async fn incr_by(&self, key: &str, delta: i64) -> StoreResult<i64>;

    async fn del(&self, key: &str) -> StoreResult<bool>;

    async fn zadd(&self, key: &str, member: &str, score: f64) -> StoreResult<()>;

    /// Add only if the member is not already present.
    async fn zadd_nx(&self, key: &str, member: &str, score: f64) -> StoreResult<bool>;

    async fn zrem(&self, key: &str, member: &str) -> StoreResult<bool>;

    async fn zscore(&self, key: &str, member: &str) -> StoreResult<Option<f64>>;

    /// Members with `min <= score <= max`, lowest score first.
    async fn zrange_by_score(&self, key: &str, min: f64, max: f64) -> StoreResult<Vec<(String, f64)>>;

    /// Keys starting with `prefix`.
    async fn scan_prefix(&self, prefix: &str) -> StoreResult<Vec<String>>;

    /// Fire-and-forget publish. Returns the number of receivers reached.
    async fn publish(&self, channel: &str, payload: &str) -> StoreResult<usize>;

    async fn subscribe(&self, channel: &str) -> StoreResult<ChannelReceiver>;

    /// Connectivity probe for health reporting.
    async fn ping(&self) -> StoreResult<()>;
}

#[async_trait]
impl<S> SharedStore for Arc<S>
where
    S: SharedStore + ?Sized,
{
    async fn hset_all(&self, key: &str, fields: &[(&str, String)], ttl: Option<Duration>) -> StoreResult<()> {
        (**self).hset_all(key, fields, ttl).await
    }

    async fn hget_all(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        (**self).hget_all(key).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        (**self).expire(key, ttl).await
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        (**self).get(key).await
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        (**self).set_nx_ex(key, value, ttl).await
    }

    async fn incr_by(&self, key: &str, delta: i64) -> StoreResult<i64> {
        (**self).incr_by(key, delta).await
    }

    async fn del(&self, key: &str) -> StoreResult<bool> {
        (**self).del(key).await
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> StoreResult<()> {
        (**self).zadd(key, member, score).await
    }

    async fn zadd_nx(&self, key: &str, member: &str, score: f64) -> StoreResult<bool> {
        (**self).zadd_nx(key, member, score).await
    }

    async fn zrem(&self, key: &str, member: &str) -> StoreResult<bool> {
        (**self).zrem(key, member).await
    }

    async fn zscore(&self, key: &str, member: &str) -> StoreResult<Option<f64>> {
        (**self).zscore(key, member).await
    }

    async fn zrange_by_score(&self, key: &str, min: f64, max: f64) -> StoreResult<Vec<(String, f64)>> {
        (**self).zrange_by_score(key, min, max).await
    }

    async fn scan_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        (**self).scan_prefix(prefix).await
    }

    async fn publish(&self, channel: &str, payload: &str) -> StoreResult<usize> {
        (**self).publish(channel, payload).await
    }

    async fn subscribe(&self, channel: &str) -> StoreResult<ChannelReceiver> {
        (**self).subscribe(channel).await
    }

    async fn ping(&self) -> StoreResult<()> {
        (**self).ping().await
    }
}
