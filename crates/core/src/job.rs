//! The Job Record and its state machine.
//!
//! ## Lifecycle
//!
//! ```text
//! queued ──▶ processing ──▶ completed
//!    ▲            │
//!    │            ▼
//!    └──────── failed (retryable) ──▶ failed (non-retryable)
//! ```
//!
//! Every mutator here is a pure function over the record: it validates the
//! transition, applies it in memory and reports whether anything changed.
//! Persisting the result is the orchestrator's job.

use std::collections::HashMap;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainResult, JobError};
use crate::id::{JobId, OwnerId, SubjectId};

/// Highest progress value a job may report before completion.
///
/// `100` is reserved for `completed`.
pub const MAX_IN_FLIGHT_PROGRESS: u8 = 99;

/// Job lifecycle state.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting for an executor
    Queued,
    /// An executor is working on it
    Processing,
    /// Finished successfully
    Completed,
    /// Finished unsuccessfully (see `retryable`)
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Processing => "processing",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }
}

impl core::fmt::Display for JobState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobState::Queued),
            "processing" => Ok(JobState::Processing),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            other => Err(JobError::corrupt(format!("unknown status `{other}`"))),
        }
    }
}

/// Outcome of applying a mutator.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Transition {
    /// The record changed and must be persisted.
    Applied,
    /// The mutator was an idempotent replay or a silently rejected update.
    Unchanged,
    /// The mutator did not fit the current state (logged and swallowed).
    Rejected,
}

impl Transition {
    pub fn is_applied(&self) -> bool {
        matches!(self, Transition::Applied)
    }
}

/// Canonical job entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub subject_id: SubjectId,
    pub owner_id: OwnerId,
    pub state: JobState,
    pub progress: u8,
    pub result_locator: Option<String>,
    pub failure_reason: Option<String>,
    pub retryable: bool,
    pub attempt_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    /// Create a fresh `queued` record.
    pub fn new(id: JobId, subject_id: SubjectId, owner_id: OwnerId, now: DateTime<Utc>) -> Self {
        Self {
            id,
            subject_id,
            owner_id,
            state: JobState::Queued,
            progress: 0,
            result_locator: None,
            failure_reason: None,
            retryable: false,
            attempt_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// No further worker-driven transition will occur.
    pub fn is_terminal(&self) -> bool {
        match self.state {
            JobState::Completed => true,
            JobState::Failed => !self.retryable,
            JobState::Queued | JobState::Processing => false,
        }
    }

    /// The job still occupies one of its owner's concurrency slots.
    ///
    /// A retryable failure keeps its slot because the queue will re-attempt.
    pub fn holds_slot(&self) -> bool {
        match self.state {
            JobState::Queued | JobState::Processing => true,
            JobState::Failed => self.retryable,
            JobState::Completed => false,
        }
    }

    /// `queued → processing`.
    ///
    /// Also accepted from a retryable failure: that is the work queue
    /// delivering its own retry of the same job.
    pub fn start_processing(&mut self, now: DateTime<Utc>) -> DomainResult<Transition> {
        match self.state {
            JobState::Processing => Ok(Transition::Unchanged),
            JobState::Queued => {
                self.state = JobState::Processing;
                self.touch(now);
                Ok(Transition::Applied)
            }
            JobState::Failed if self.retryable => {
                self.state = JobState::Processing;
                self.failure_reason = None;
                self.retryable = false;
                self.touch(now);
                Ok(Transition::Applied)
            }
            from => Err(JobError::invalid_transition(from, "start processing")),
        }
    }

    /// Record in-flight progress, clamped to `[0, 99]`.
    ///
    /// A value lower than the stored one is dropped; the stored value is kept.
    pub fn advance_progress(&mut self, percent: i64, now: DateTime<Utc>) -> DomainResult<Transition> {
        if self.state != JobState::Processing {
            return Err(JobError::invalid_transition(self.state, "update progress of"));
        }

        let clamped = percent.clamp(0, i64::from(MAX_IN_FLIGHT_PROGRESS)) as u8;
        if clamped <= self.progress {
            return Ok(Transition::Unchanged);
        }

        self.progress = clamped;
        self.touch(now);
        Ok(Transition::Applied)
    }

    /// `processing → completed`.
    pub fn complete(&mut self, result_locator: impl Into<String>, now: DateTime<Utc>) -> DomainResult<Transition> {
        match self.state {
            JobState::Completed => Ok(Transition::Unchanged),
            JobState::Processing => {
                self.state = JobState::Completed;
                self.progress = 100;
                self.result_locator = Some(result_locator.into());
                self.failure_reason = None;
                self.retryable = false;
                self.touch(now);
                Ok(Transition::Applied)
            }
            from => Err(JobError::invalid_transition(from, "complete")),
        }
    }

    /// `* → failed` as reported by an executor.
    ///
    /// A completed record stays completed, and a terminal failure is not
    /// overwritten by a late duplicate report.
    pub fn fail(
        &mut self,
        reason: impl Into<String>,
        retryable: bool,
        attempt_count: u32,
        now: DateTime<Utc>,
    ) -> DomainResult<Transition> {
        match self.state {
            JobState::Completed => Err(JobError::invalid_transition(JobState::Completed, "fail")),
            JobState::Failed if !self.retryable => Ok(Transition::Unchanged),
            JobState::Queued | JobState::Processing | JobState::Failed => {
                self.state = JobState::Failed;
                self.failure_reason = Some(reason.into());
                self.retryable = retryable;
                self.attempt_count = self.attempt_count.max(attempt_count);
                self.result_locator = None;
                self.touch(now);
                Ok(Transition::Applied)
            }
        }
    }

    /// System-initiated terminal failure (watchdog correction).
    ///
    /// Unlike [`JobRecord::fail`] this also applies to completed records whose
    /// artifact has disappeared; their progress drops back below 100.
    pub fn force_fail(&mut self, reason: impl Into<String>, now: DateTime<Utc>) -> DomainResult<Transition> {
        if self.state == JobState::Failed && !self.retryable {
            return Ok(Transition::Unchanged);
        }

        self.state = JobState::Failed;
        self.failure_reason = Some(reason.into());
        self.retryable = false;
        self.result_locator = None;
        self.progress = self.progress.min(MAX_IN_FLIGHT_PROGRESS);
        self.touch(now);
        Ok(Transition::Applied)
    }

    /// Put a stuck or retryably-failed job back in the queue for another attempt.
    pub fn requeue(&mut self, now: DateTime<Utc>) -> DomainResult<Transition> {
        match self.state {
            JobState::Processing => {}
            JobState::Failed if self.retryable => {}
            from => return Err(JobError::invalid_transition(from, "requeue")),
        }

        self.state = JobState::Queued;
        self.progress = 0;
        self.failure_reason = None;
        self.retryable = false;
        self.attempt_count += 1;
        self.touch(now);
        Ok(Transition::Applied)
    }

    /// A queued job handed to the queue again because its delivery was lost.
    /// Only the timestamp moves.
    pub fn redeliver(&mut self, now: DateTime<Utc>) -> DomainResult<Transition> {
        if self.state != JobState::Queued {
            return Err(JobError::invalid_transition(self.state, "redeliver"));
        }
        self.touch(now);
        Ok(Transition::Applied)
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now.max(self.updated_at);
    }

    /// Encode into the flat, string-valued storage layout.
    pub fn to_fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("id", self.id.to_string()),
            ("subjectId", self.subject_id.to_string()),
            ("ownerId", self.owner_id.to_string()),
            ("status", self.state.as_str().to_string()),
            ("progress", self.progress.to_string()),
            ("resultLocator", self.result_locator.clone().unwrap_or_default()),
            ("error", self.failure_reason.clone().unwrap_or_default()),
            ("retryable", self.retryable.to_string()),
            ("attempts", self.attempt_count.to_string()),
            ("createdAt", encode_time(self.created_at)),
            ("updatedAt", encode_time(self.updated_at)),
        ]
    }

    /// Decode from the storage layout produced by [`JobRecord::to_fields`].
    pub fn from_fields(fields: &HashMap<String, String>) -> DomainResult<Self> {
        let field = |name: &str| {
            fields
                .get(name)
                .map(String::as_str)
                .ok_or_else(|| JobError::corrupt(format!("missing field `{name}`")))
        };
        let optional = |name: &str| {
            fields
                .get(name)
                .filter(|v| !v.is_empty())
                .cloned()
        };

        let progress: u8 = field("progress")?
            .parse()
            .map_err(|e| JobError::corrupt(format!("progress: {e}")))?;
        let retryable: bool = field("retryable")?
            .parse()
            .map_err(|e| JobError::corrupt(format!("retryable: {e}")))?;
        let attempt_count: u32 = field("attempts")?
            .parse()
            .map_err(|e| JobError::corrupt(format!("attempts: {e}")))?;

        Ok(Self {
            id: field("id")?.parse().map_err(|e: JobError| JobError::corrupt(e.to_string()))?,
            subject_id: SubjectId::new(field("subjectId")?)
                .map_err(|e| JobError::corrupt(e.to_string()))?,
            owner_id: OwnerId::new(field("ownerId")?).map_err(|e| JobError::corrupt(e.to_string()))?,
            state: field("status")?.parse()?,
            progress: progress.min(100),
            result_locator: optional("resultLocator"),
            failure_reason: optional("error"),
            retryable,
            attempt_count,
            created_at: decode_time(field("createdAt")?)?,
            updated_at: decode_time(field("updatedAt")?)?,
        })
    }
}

fn encode_time(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn decode_time(raw: &str) -> DomainResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| JobError::corrupt(format!("timestamp `{raw}`: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn record() -> JobRecord {
        JobRecord::new(
            JobId::new(),
            SubjectId::new("70007").unwrap(),
            OwnerId::new("u1").unwrap(),
            Utc::now(),
        )
    }

    fn check_invariants(job: &JobRecord) {
        assert_eq!(job.progress == 100, job.state == JobState::Completed);
        assert_eq!(job.result_locator.is_some(), job.state == JobState::Completed);
        assert_eq!(job.failure_reason.is_some(), job.state == JobState::Failed);
        if job.state == JobState::Queued {
            assert_eq!(job.progress, 0);
        }
    }

    #[test]
    fn happy_path_lifecycle() {
        let mut job = record();
        let now = Utc::now();
        check_invariants(&job);

        assert_eq!(job.start_processing(now).unwrap(), Transition::Applied);
        assert_eq!(job.start_processing(now).unwrap(), Transition::Unchanged);
        assert_eq!(job.advance_progress(50, now).unwrap(), Transition::Applied);
        check_invariants(&job);

        assert_eq!(job.complete("https://cdn/x", now).unwrap(), Transition::Applied);
        assert_eq!(job.progress, 100);
        assert!(job.is_terminal());
        assert!(!job.holds_slot());
        check_invariants(&job);

        assert_eq!(job.complete("https://cdn/y", now).unwrap(), Transition::Unchanged);
        assert_eq!(job.result_locator.as_deref(), Some("https://cdn/x"));
    }

    #[test]
    fn lower_progress_is_dropped() {
        let mut job = record();
        let now = Utc::now();
        job.start_processing(now).unwrap();
        job.advance_progress(50, now).unwrap();

        assert_eq!(job.advance_progress(30, now).unwrap(), Transition::Unchanged);
        assert_eq!(job.progress, 50);
    }

    #[test]
    fn progress_is_clamped_below_completion() {
        let mut job = record();
        let now = Utc::now();
        job.start_processing(now).unwrap();

        job.advance_progress(100, now).unwrap();
        assert_eq!(job.progress, 99);
        assert_eq!(job.advance_progress(-5, now).unwrap(), Transition::Unchanged);
    }

    #[test]
    fn progress_requires_processing() {
        let mut job = record();
        assert!(matches!(
            job.advance_progress(10, Utc::now()),
            Err(JobError::InvalidTransition { from: JobState::Queued, .. })
        ));
    }

    #[test]
    fn terminal_states_reject_processing() {
        let now = Utc::now();
        let mut done = record();
        done.start_processing(now).unwrap();
        done.complete("loc", now).unwrap();
        assert!(done.start_processing(now).is_err());

        let mut dead = record();
        dead.fail("gone", false, 1, now).unwrap();
        assert!(dead.start_processing(now).is_err());
    }

    #[test]
    fn retryable_failure_keeps_slot_and_accepts_queue_retry() {
        let now = Utc::now();
        let mut job = record();
        job.start_processing(now).unwrap();
        job.fail("timeout", true, 1, now).unwrap();

        assert!(job.holds_slot());
        assert!(!job.is_terminal());
        assert_eq!(job.start_processing(now).unwrap(), Transition::Applied);
        assert!(job.failure_reason.is_none());
        check_invariants(&job);
    }

    #[test]
    fn completed_job_cannot_be_failed_by_a_worker() {
        let now = Utc::now();
        let mut job = record();
        job.start_processing(now).unwrap();
        job.complete("loc", now).unwrap();

        assert!(job.fail("late", false, 1, now).is_err());
        assert_eq!(job.force_fail("artifact missing", now).unwrap(), Transition::Applied);
        check_invariants(&job);
        assert!(job.is_terminal());
    }

    #[test]
    fn terminal_failure_is_not_overwritten() {
        let now = Utc::now();
        let mut job = record();
        job.fail("first", false, 2, now).unwrap();

        assert_eq!(job.fail("second", true, 3, now).unwrap(), Transition::Unchanged);
        assert_eq!(job.failure_reason.as_deref(), Some("first"));
    }

    #[test]
    fn requeue_resets_progress_and_bumps_attempts() {
        let now = Utc::now();
        let mut job = record();
        job.start_processing(now).unwrap();
        job.advance_progress(40, now).unwrap();

        job.requeue(now).unwrap();
        assert_eq!(job.state, JobState::Queued);
        assert_eq!(job.progress, 0);
        assert_eq!(job.attempt_count, 1);
        check_invariants(&job);
    }

    #[test]
    fn redelivery_only_moves_the_timestamp_of_a_queued_job() {
        let mut job = record();
        let later = job.updated_at + chrono::Duration::minutes(20);
        assert_eq!(job.redeliver(later).unwrap(), Transition::Applied);
        assert_eq!(job.state, JobState::Queued);
        assert_eq!(job.attempt_count, 0);
        assert_eq!(job.updated_at, later);

        job.start_processing(later).unwrap();
        assert!(job.redeliver(later).is_err());
    }

    #[test]
    fn storage_layout_round_trips() {
        let now = Utc::now();
        let mut job = record();
        job.start_processing(now).unwrap();
        job.fail("network down", true, 2, now).unwrap();

        let fields: HashMap<String, String> = job
            .to_fields()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();

        assert_eq!(fields["status"], "failed");
        assert_eq!(fields["resultLocator"], "");

        let decoded = JobRecord::from_fields(&fields).unwrap();
        assert_eq!(decoded.state, JobState::Failed);
        assert_eq!(decoded.failure_reason.as_deref(), Some("network down"));
        assert!(decoded.result_locator.is_none());
        assert_eq!(decoded.attempt_count, 2);
    }

    #[test]
    fn missing_fields_are_corrupt() {
        let fields = HashMap::from([("id".to_string(), JobId::new().to_string())]);
        assert!(matches!(JobRecord::from_fields(&fields), Err(JobError::Corrupt(_))));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Start,
        Progress(i64),
        Complete,
        Fail(bool),
        ForceFail,
        Requeue,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            Just(Op::Start),
            (-20i64..140).prop_map(Op::Progress),
            Just(Op::Complete),
            any::<bool>().prop_map(Op::Fail),
            Just(Op::ForceFail),
            Just(Op::Requeue),
        ]
    }

    proptest! {
        #[test]
        fn invariants_hold_for_any_sequence(ops in proptest::collection::vec(op(), 0..40)) {
            let mut job = record();
            let now = Utc::now();

            for op in ops {
                let before = job.clone();
                let _ = match op {
                    Op::Start => job.start_processing(now),
                    Op::Progress(p) => job.advance_progress(p, now),
                    Op::Complete => job.complete("loc", now),
                    Op::Fail(retryable) => job.fail("boom", retryable, 1, now),
                    Op::ForceFail => job.force_fail("forced", now),
                    Op::Requeue => job.requeue(now),
                };

                check_invariants(&job);

                // Progress only moves backwards across a requeue or a forced failure.
                if matches!(op, Op::Progress(_) | Op::Start | Op::Complete) {
                    prop_assert!(job.progress >= before.progress);
                }
                if before.state == JobState::Completed && !matches!(op, Op::ForceFail) {
                    prop_assert_eq!(&job, &before);
                }
            }
        }
    }
}
