//! Durable work queue capability.
//!
//! The orchestrator only enqueues; workers consume through [`WorkSource`].
//! Implementations must hand a given job id to at most one executor at a
//! time and retry failed deliveries according to their [`RetryPolicy`].
//!
//! ## Implementations
//!
//! - [`InMemoryWorkQueue`]: process-local, for tests and single-process dev mode
//! - `RedisStreamsWorkQueue` (feature `redis`): consumer-group stream with
//!   delayed retries and a dead-letter stream

use async_trait::async_trait;

use fetchq_core::JobId;

pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis_streams;
pub mod types;

pub use in_memory::InMemoryWorkQueue;
#[cfg(feature = "redis")]
pub use redis_streams::RedisStreamsWorkQueue;
pub use types::{
    Backoff, DeadLetterEntry, Delivery, JobPayload, NackOutcome, QueueCounts, RetryPolicy,
};

/// Queue error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueError {
    #[error("queue connection error: {0}")]
    Connection(String),
    #[error("queue command error: {0}")]
    Command(String),
    #[error("queue payload error: {0}")]
    Payload(String),
    #[error("queue lock poisoned")]
    Poisoned,
}

/// Producer side.
#[async_trait]
pub trait WorkQueue: Send + Sync + 'static {
    /// Schedule `job_id` for execution.
    ///
    /// Enqueuing a job that is already waiting is a no-op; enqueuing one
    /// that is being executed schedules one more run after it settles.
    async fn enqueue(&self, job_id: JobId, payload: JobPayload) -> Result<(), QueueError>;

    /// Schedule a fresh delivery of `job_id`, taking the job away from any
    /// executor that still holds it. Settling the old delivery afterwards
    /// has no effect on the new one.
    ///
    /// Returns `false` when the job was already waiting for delivery.
    async fn reclaim(&self, job_id: JobId, payload: JobPayload) -> Result<bool, QueueError>;

    async fn counts(&self) -> Result<QueueCounts, QueueError>;
}

/// Consumer side, used by the worker pool.
#[async_trait]
pub trait WorkSource: Send + Sync + 'static {
    /// Wait for the next delivery.
    async fn next(&self) -> Result<Delivery, QueueError>;

    /// The delivery succeeded (or needs no further work).
    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// The delivery failed. With `retry`, it is redelivered if the policy
    /// allows; otherwise it is dead-lettered.
    async fn nack(&self, delivery: &Delivery, retry: bool, reason: &str) -> Result<NackOutcome, QueueError>;

    /// Whether a retryable failure of `delivery` would be redelivered.
    fn will_retry(&self, delivery: &Delivery) -> bool;
}
