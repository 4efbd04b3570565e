//! Events broadcast to live observers of a job.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::JobId;
use crate::job::{JobRecord, JobState};

/// A notification about one job.
///
/// Events are lossy (live observers only); the Job Record stays the source of
/// truth, so observers that join late start from a [`JobEventKind::Status`]
/// snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobEvent {
    pub job_id: JobId,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: JobEventKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEventKind {
    /// Current state snapshot (sent on subscribe).
    Status { state: JobState, progress: u8 },
    Progress { progress: u8 },
    Completed { result_locator: String },
    Failed { reason: String, retryable: bool },
}

impl JobEvent {
    pub fn new(job_id: JobId, kind: JobEventKind) -> Self {
        Self {
            job_id,
            at: Utc::now(),
            kind,
        }
    }

    pub fn progress(job_id: JobId, progress: u8) -> Self {
        Self::new(job_id, JobEventKind::Progress { progress })
    }

    pub fn completed(job_id: JobId, result_locator: impl Into<String>) -> Self {
        Self::new(
            job_id,
            JobEventKind::Completed {
                result_locator: result_locator.into(),
            },
        )
    }

    pub fn failed(job_id: JobId, reason: impl Into<String>, retryable: bool) -> Self {
        Self::new(
            job_id,
            JobEventKind::Failed {
                reason: reason.into(),
                retryable,
            },
        )
    }

    /// Snapshot of a record, followed by its terminal event if it has one.
    pub fn from_record(record: &JobRecord) -> Vec<Self> {
        let mut events = vec![Self::new(
            record.id,
            JobEventKind::Status {
                state: record.state,
                progress: record.progress,
            },
        )];

        match record.state {
            JobState::Completed => {
                if let Some(locator) = &record.result_locator {
                    events.push(Self::completed(record.id, locator.clone()));
                }
            }
            JobState::Failed => {
                let reason = record.failure_reason.clone().unwrap_or_default();
                events.push(Self::failed(record.id, reason, record.retryable));
            }
            JobState::Queued | JobState::Processing => {}
        }

        events
    }

    /// A subscription ends after delivering this event.
    pub fn closes_stream(&self) -> bool {
        matches!(
            self.kind,
            JobEventKind::Completed { .. } | JobEventKind::Failed { .. }
        )
    }
}
