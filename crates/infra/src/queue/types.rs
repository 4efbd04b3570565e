//! Work queue payloads and retry policy.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use fetchq_core::{JobId, JobRecord, OwnerId, SubjectId};

/// What an executor needs to run a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobPayload {
    pub job_id: JobId,
    pub subject_id: SubjectId,
    pub owner_id: OwnerId,
}

impl From<&JobRecord> for JobPayload {
    fn from(record: &JobRecord) -> Self {
        Self {
            job_id: record.id,
            subject_id: record.subject_id.clone(),
            owner_id: record.owner_id.clone(),
        }
    }
}

/// One hand-off of a job to one executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub payload: JobPayload,
    /// 1 on the first delivery after an enqueue.
    pub attempt: u32,
    /// Backend-specific handle (e.g. a stream entry id).
    pub tag: String,
}

impl Delivery {
    pub fn job_id(&self) -> JobId {
        self.payload.job_id
    }
}

/// What the queue did with a negatively acknowledged delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackOutcome {
    /// Will be delivered again after `delay`.
    Retrying { delay: Duration },
    /// Retries exhausted or not wanted.
    DeadLettered,
    /// The job was handed out again while this delivery ran; the newer
    /// delivery owns it now and this one was dropped.
    Superseded,
}

/// Aggregate counts for health reporting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub waiting: u64,
    pub active: u64,
    pub delayed: u64,
    pub completed: u64,
    pub failed: u64,
    pub dead_lettered: u64,
}

/// Entry in the dead-letter queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub payload: JobPayload,
    pub attempts: u32,
    pub reason: String,
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetterEntry {
    pub fn new(payload: JobPayload, attempts: u32, reason: impl Into<String>) -> Self {
        Self {
            payload,
            attempts,
            reason: reason.into(),
            dead_lettered_at: Utc::now(),
        }
    }
}

/// Wait before a failed delivery is handed out again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backoff {
    Constant { delay: Duration },
    /// `step * n` after the n-th failed delivery, up to `cap`.
    Linear { step: Duration, cap: Duration },
    /// `base * 2^(n-1)` after the n-th failed delivery, up to `cap`.
    Exponential { base: Duration, cap: Duration },
}

impl Backoff {
    fn after(&self, failed_attempt: u32) -> Duration {
        let n = failed_attempt.max(1);
        match *self {
            Backoff::Constant { delay } => delay,
            Backoff::Linear { step, cap } => step.saturating_mul(n).min(cap),
            Backoff::Exponential { base, cap } => {
                let factor = 1u32.checked_shl(n - 1).unwrap_or(u32::MAX);
                base.saturating_mul(factor).min(cap)
            }
        }
    }
}

/// How often, and how far apart, one enqueue of a job may be delivered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Deliveries per enqueue, the first one included.
    pub max_attempts: u32,
    pub backoff: Backoff,
    /// Extra delay of up to this percentage, fixed per job, so jobs that
    /// failed together are not redelivered together.
    pub spread_percent: u8,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(3, Duration::from_secs(2), Duration::from_secs(60))
    }
}

impl RetryPolicy {
    /// A single delivery, never retried.
    pub fn once() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn constant(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Constant { delay },
            spread_percent: 0,
        }
    }

    pub fn exponential(max_attempts: u32, base: Duration, cap: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Exponential { base, cap },
            spread_percent: 10,
        }
    }

    /// Whether delivery number `attempt` (1-based) may be followed by another.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Delay before redelivering `job_id` after its `attempt`-th delivery failed.
    pub fn redelivery_delay(&self, job_id: JobId, attempt: u32) -> Duration {
        let delay = self.backoff.after(attempt);
        let spread_ms = delay.as_millis() as u64 * u64::from(self.spread_percent.min(100)) / 100;
        if spread_ms == 0 {
            return delay;
        }
        // Low UUID bits are random, and stable for the job.
        let offset = (job_id.as_uuid().as_u128() as u64) % (spread_ms + 1);
        delay + Duration::from_millis(offset)
    }
}
