//! Job orchestrator: the only writer of Job Records.
//!
//! ## Responsibilities
//!
//! - Create jobs (idempotency, per-owner rate limiting, enqueue)
//! - Apply the state machine for worker callbacks and watchdog corrections
//! - Keep the processing set and the owner's concurrency counter in step
//!   with each transition
//! - Publish job events to live observers
//!
//! Expected outcomes (`RateLimited`, `NotFound`) are typed errors; an illegal
//! transition is logged and reported as [`Transition::Rejected`]. Only store
//! failures surface as `StoreUnavailable`.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, instrument, warn};

use fetchq_core::{
    DomainResult, JobError, JobEvent, JobEventKind, JobId, JobRecord, JobState, OwnerId, SubjectId, Transition,
};

use super::broadcast::{ProgressBroadcaster, Subscription};
use super::idempotency::IdempotencyIndex;
use super::keys::Keys;
use super::limiter::ConcurrencyLimiter;
use super::processing::ProcessingSet;
use crate::config::OrchestratorConfig;
use crate::queue::{JobPayload, QueueCounts, QueueError, WorkQueue};
use crate::store::{SharedStore, StoreError};

/// Failure reason for a job the queue refused at creation.
pub const NOT_ENQUEUED: &str = "could not be enqueued";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OrchestratorError {
    /// The owner is at its concurrency limit. Nothing was written.
    #[error("too many jobs in flight; retry after {}s", retry_after.as_secs())]
    RateLimited { retry_after: Duration },

    #[error("job not found or expired: {0}")]
    NotFound(JobId),

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("corrupt job record: {0}")]
    Corrupt(String),
}

impl From<StoreError> for OrchestratorError {
    fn from(e: StoreError) -> Self {
        error!(error = %e, "shared store unavailable");
        OrchestratorError::StoreUnavailable(e.to_string())
    }
}

impl From<QueueError> for OrchestratorError {
    fn from(e: QueueError) -> Self {
        error!(error = %e, "work queue unavailable");
        OrchestratorError::StoreUnavailable(e.to_string())
    }
}

/// Result of [`JobOrchestrator::create_job`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreatedJob {
    pub job_id: JobId,
    /// `false` for an idempotent replay of an earlier request.
    pub is_new: bool,
}

/// What a mutator found and did.
enum Outcome {
    Missing,
    Rejected,
    Unchanged,
    Applied { before: JobRecord, after: JobRecord },
}

impl Outcome {
    fn transition(&self) -> Transition {
        match self {
            Outcome::Missing | Outcome::Rejected => Transition::Rejected,
            Outcome::Unchanged => Transition::Unchanged,
            Outcome::Applied { .. } => Transition::Applied,
        }
    }
}

#[derive(Clone)]
pub struct JobOrchestrator {
    store: Arc<dyn SharedStore>,
    queue: Arc<dyn WorkQueue>,
    keys: Keys,
    idempotency: IdempotencyIndex,
    limiter: ConcurrencyLimiter,
    processing: ProcessingSet,
    broadcaster: ProgressBroadcaster,
    config: OrchestratorConfig,
}

impl std::fmt::Debug for JobOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobOrchestrator")
            .field("keys", &self.keys)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl JobOrchestrator {
    pub fn new(store: Arc<dyn SharedStore>, queue: Arc<dyn WorkQueue>, config: OrchestratorConfig) -> Self {
        Self::with_keys(store, queue, Keys::default(), config)
    }

    pub fn with_keys(
        store: Arc<dyn SharedStore>,
        queue: Arc<dyn WorkQueue>,
        keys: Keys,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            idempotency: IdempotencyIndex::new(store.clone(), keys.clone(), config.retention),
            limiter: ConcurrencyLimiter::new(
                store.clone(),
                keys.clone(),
                config.max_concurrent_per_owner,
                config.retention,
            ),
            processing: ProcessingSet::new(store.clone(), keys.clone()),
            broadcaster: ProgressBroadcaster::new(store.clone(), keys.clone()),
            store,
            queue,
            keys,
            config,
        }
    }

    /// Close live subscriptions after `idle` without events.
    pub fn with_subscription_idle(mut self, idle: Duration) -> Self {
        self.broadcaster = self.broadcaster.with_idle_timeout(idle);
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn keys(&self) -> &Keys {
        &self.keys
    }

    pub fn store(&self) -> &Arc<dyn SharedStore> {
        &self.store
    }

    pub fn processing(&self) -> &ProcessingSet {
        &self.processing
    }

    pub fn limiter(&self) -> &ConcurrencyLimiter {
        &self.limiter
    }

    /// Register a job for `subject`, or return the job an earlier request
    /// with the same `dedup_token` created.
    #[instrument(skip(self, subject, owner), fields(subject = %subject, owner = %owner))]
    pub async fn create_job(
        &self,
        subject: SubjectId,
        owner: OwnerId,
        dedup_token: Option<&str>,
    ) -> Result<CreatedJob, OrchestratorError> {
        let token = dedup_token.map(str::trim).filter(|t| !t.is_empty());

        if let Some(token) = token {
            if let Some(existing) = self.idempotency.lookup(token).await? {
                info!(job_id = %existing, "idempotent replay");
                return Ok(CreatedJob {
                    job_id: existing,
                    is_new: false,
                });
            }
        }

        if !self.limiter.has_capacity(&owner).await? {
            debug!(max = self.limiter.max_in_flight(), "owner at concurrency limit");
            return Err(OrchestratorError::RateLimited {
                retry_after: self.config.rate_limit_retry_after,
            });
        }

        let job_id = JobId::new();
        if let Some(token) = token {
            if let Some(existing) = self.idempotency.check_and_reserve(token, job_id).await? {
                info!(job_id = %existing, "idempotent replay (concurrent request)");
                return Ok(CreatedJob {
                    job_id: existing,
                    is_new: false,
                });
            }
        }

        let record = JobRecord::new(job_id, subject, owner, Utc::now());
        if let Err(e) = self.register(&record).await {
            if let Some(token) = token {
                if let Err(release_err) = self.idempotency.release(token).await {
                    warn!(error = %release_err, "failed to release idempotency reservation");
                }
            }
            return Err(e);
        }

        info!(%job_id, "job created");
        Ok(CreatedJob { job_id, is_new: true })
    }

    async fn register(&self, record: &JobRecord) -> Result<(), OrchestratorError> {
        self.store
            .hset_all(&self.keys.job(record.id), &record.to_fields(), Some(self.config.retention))
            .await?;
        self.limiter.acquire(&record.owner_id).await?;

        if let Err(e) = self.queue.enqueue(record.id, JobPayload::from(record)).await {
            error!(job_id = %record.id, error = %e, "failed to enqueue new job");
            self.abandon(record).await;
            return Err(e.into());
        }
        Ok(())
    }

    /// Fail a job that never reached the queue and give its slot back. If
    /// the failure cannot be recorded the record stays queued, keeps its
    /// slot, and the watchdog redelivers it once it goes stale.
    async fn abandon(&self, record: &JobRecord) {
        let job_id = record.id;
        let mut failed = record.clone();
        if let Err(e) = failed.force_fail(NOT_ENQUEUED, Utc::now()) {
            error!(%job_id, error = %e, "cannot fail unenqueued job");
            return;
        }
        if let Err(e) = self.store.hset_all(&self.keys.job(job_id), &failed.to_fields(), None).await {
            error!(%job_id, error = %e, "failed to record enqueue failure; leaving job queued");
            return;
        }
        if let Err(e) = self.limiter.release(&record.owner_id).await {
            error!(%job_id, owner = %record.owner_id, error = %e, "failed to release slot of unenqueued job");
        }
    }

    /// Current Job Record.
    pub async fn get_job(&self, job_id: JobId) -> Result<JobRecord, OrchestratorError> {
        self.load(job_id).await?.ok_or(OrchestratorError::NotFound(job_id))
    }

    async fn load(&self, job_id: JobId) -> Result<Option<JobRecord>, OrchestratorError> {
        let fields = self.store.hget_all(&self.keys.job(job_id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        JobRecord::from_fields(&fields).map(Some).map_err(|e| {
            error!(%job_id, error = %e, "undecodable job record");
            OrchestratorError::Corrupt(e.to_string())
        })
    }

    /// `queued → processing`.
    pub async fn mark_processing(&self, job_id: JobId) -> Result<Transition, OrchestratorError> {
        let outcome = self
            .apply(job_id, "mark_processing", |r| r.start_processing(Utc::now()))
            .await?;

        if let Outcome::Applied { after, .. } = &outcome {
            self.broadcaster
                .publish(&JobEvent::new(
                    job_id,
                    JobEventKind::Status {
                        state: after.state,
                        progress: after.progress,
                    },
                ))
                .await;
        }
        Ok(outcome.transition())
    }

    /// Record in-flight progress. Lower values than the stored one are dropped.
    pub async fn update_progress(&self, job_id: JobId, percent: i64) -> Result<Transition, OrchestratorError> {
        let outcome = self
            .apply(job_id, "update_progress", |r| r.advance_progress(percent, Utc::now()))
            .await?;

        if let Outcome::Applied { after, .. } = &outcome {
            self.broadcaster.publish(&JobEvent::progress(job_id, after.progress)).await;
        }
        Ok(outcome.transition())
    }

    /// `processing → completed`.
    pub async fn mark_completed(
        &self,
        job_id: JobId,
        result_locator: impl Into<String>,
    ) -> Result<Transition, OrchestratorError> {
        let locator = result_locator.into();
        let outcome = self
            .apply(job_id, "mark_completed", |r| r.complete(locator.clone(), Utc::now()))
            .await?;

        if outcome.transition().is_applied() {
            self.broadcaster.publish(&JobEvent::completed(job_id, locator)).await;
        }
        Ok(outcome.transition())
    }

    /// `* → failed`. A retryable failure keeps the owner's slot reserved.
    pub async fn mark_failed(
        &self,
        job_id: JobId,
        reason: &str,
        retryable: bool,
        attempt_count: u32,
    ) -> Result<Transition, OrchestratorError> {
        let outcome = self
            .apply(job_id, "mark_failed", |r| {
                r.fail(reason, retryable, attempt_count, Utc::now())
            })
            .await?;

        if outcome.transition().is_applied() {
            self.broadcaster.publish(&JobEvent::failed(job_id, reason, retryable)).await;
        }
        Ok(outcome.transition())
    }

    /// Watchdog correction: put the job back in the queue with one more
    /// attempt. Any delivery still out for the job is taken back, so an
    /// executor that went silent cannot hold the job.
    pub async fn requeue(&self, job_id: JobId) -> Result<Transition, OrchestratorError> {
        let outcome = self.apply(job_id, "requeue", |r| r.requeue(Utc::now())).await?;

        if let Outcome::Applied { after, .. } = &outcome {
            if let Err(e) = self.queue.reclaim(job_id, JobPayload::from(after)).await {
                error!(%job_id, error = %e, "requeued job not handed to the queue; left for redelivery");
                return Err(e.into());
            }
            self.broadcaster
                .publish(&JobEvent::new(
                    job_id,
                    JobEventKind::Status {
                        state: after.state,
                        progress: after.progress,
                    },
                ))
                .await;
        }
        Ok(outcome.transition())
    }

    /// Watchdog correction: hand a queued job whose delivery went missing to
    /// the queue again. Returns `false` when the queue still had it waiting.
    pub async fn redeliver(&self, job_id: JobId) -> Result<bool, OrchestratorError> {
        let record = match self.load(job_id).await? {
            Some(record) if record.state == JobState::Queued => record,
            _ => return Ok(false),
        };

        if !self.queue.reclaim(job_id, JobPayload::from(&record)).await? {
            return Ok(false);
        }
        // Restart the staleness clock so the next sweep leaves it alone.
        self.apply(job_id, "redeliver", |r| r.redeliver(Utc::now())).await?;
        Ok(true)
    }

    /// Watchdog correction: terminal failure, also over a completed record.
    pub async fn force_fail(&self, job_id: JobId, reason: &str) -> Result<Transition, OrchestratorError> {
        let outcome = self.apply(job_id, "force_fail", |r| r.force_fail(reason, Utc::now())).await?;

        if outcome.transition().is_applied() {
            self.broadcaster.publish(&JobEvent::failed(job_id, reason, false)).await;
        }
        Ok(outcome.transition())
    }

    /// Live events for one job. Subscribe before reading the record so no
    /// transition falls between the snapshot and the stream.
    pub async fn subscribe(&self, job_id: JobId) -> Result<Subscription, OrchestratorError> {
        Ok(self.broadcaster.subscribe(job_id).await?)
    }

    pub async fn queue_counts(&self) -> Result<QueueCounts, OrchestratorError> {
        Ok(self.queue.counts().await?)
    }

    /// Connectivity probe for health reporting.
    pub async fn ping(&self) -> Result<(), OrchestratorError> {
        Ok(self.store.ping().await?)
    }

    /// Load, mutate, persist, then bring the processing set and the owner's
    /// counter in line with the new state.
    async fn apply<F>(&self, job_id: JobId, action: &'static str, op: F) -> Result<Outcome, OrchestratorError>
    where
        F: FnOnce(&mut JobRecord) -> DomainResult<Transition>,
    {
        let Some(before) = self.load(job_id).await? else {
            warn!(%job_id, action, "job missing or expired; ignoring");
            return Ok(Outcome::Missing);
        };

        let mut after = before.clone();
        match op(&mut after) {
            Ok(Transition::Applied) => {}
            Ok(Transition::Unchanged) => {
                debug!(%job_id, action, state = %before.state, "no change");
                return Ok(Outcome::Unchanged);
            }
            Ok(Transition::Rejected) => return Ok(Outcome::Rejected),
            Err(JobError::InvalidTransition { from, action: verb }) => {
                warn!(%job_id, action, %from, "invalid transition: cannot {verb} a {from} job");
                return Ok(Outcome::Rejected);
            }
            Err(e) => return Err(OrchestratorError::Corrupt(e.to_string())),
        }

        // No TTL: the record keeps the expiry it was created with.
        self.store.hset_all(&self.keys.job(job_id), &after.to_fields(), None).await?;
        debug!(
            %job_id,
            action,
            from = %before.state,
            to = %after.state,
            progress = after.progress,
            "job transition"
        );

        let was_processing = before.state == JobState::Processing;
        let is_processing = after.state == JobState::Processing;
        if is_processing && !was_processing {
            self.processing.insert(job_id, after.updated_at).await?;
        } else if was_processing && !is_processing {
            self.processing.remove(job_id).await?;
        }

        if before.holds_slot() && !after.holds_slot() {
            self.limiter.release(&after.owner_id).await?;
        }

        Ok(Outcome::Applied { before, after })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;

    use crate::queue::{InMemoryWorkQueue, WorkSource};
    use crate::store::{ChannelReceiver, InMemoryStore, StoreResult};

    struct Harness {
        orchestrator: JobOrchestrator,
        queue: Arc<InMemoryWorkQueue>,
    }

    fn harness(max: u32) -> Harness {
        let queue = Arc::new(InMemoryWorkQueue::default());
        let orchestrator = JobOrchestrator::new(
            InMemoryStore::arc(),
            queue.clone(),
            OrchestratorConfig::default().with_max_concurrent_per_owner(max),
        );
        Harness { orchestrator, queue }
    }

    fn subject(s: &str) -> SubjectId {
        SubjectId::new(s).unwrap()
    }

    fn owner(s: &str) -> OwnerId {
        OwnerId::new(s).unwrap()
    }

    /// In-memory queue that refuses new work while `down` is set.
    #[derive(Default)]
    struct FlakyQueue {
        inner: InMemoryWorkQueue,
        down: AtomicBool,
    }

    impl FlakyQueue {
        fn check(&self) -> Result<(), QueueError> {
            if self.down.load(Ordering::SeqCst) {
                return Err(QueueError::Connection("down".into()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl WorkQueue for FlakyQueue {
        async fn enqueue(&self, job_id: JobId, payload: JobPayload) -> Result<(), QueueError> {
            self.check()?;
            self.inner.enqueue(job_id, payload).await
        }

        async fn reclaim(&self, job_id: JobId, payload: JobPayload) -> Result<bool, QueueError> {
            self.check()?;
            self.inner.reclaim(job_id, payload).await
        }

        async fn counts(&self) -> Result<QueueCounts, QueueError> {
            self.inner.counts().await
        }
    }

    /// Yields before every read, so concurrent requests interleave between
    /// the idempotency lookup and the reservation.
    struct YieldingStore(InMemoryStore);

    #[async_trait]
    impl SharedStore for YieldingStore {
        async fn hset_all(&self, key: &str, fields: &[(&str, String)], ttl: Option<Duration>) -> StoreResult<()> {
            self.0.hset_all(key, fields, ttl).await
        }

        async fn hget_all(&self, key: &str) -> StoreResult<HashMap<String, String>> {
            self.0.hget_all(key).await
        }

        async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
            self.0.expire(key, ttl).await
        }

        async fn get(&self, key: &str) -> StoreResult<Option<String>> {
            tokio::task::yield_now().await;
            self.0.get(key).await
        }

        async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
            self.0.set_nx_ex(key, value, ttl).await
        }

        async fn incr_by(&self, key: &str, delta: i64) -> StoreResult<i64> {
            self.0.incr_by(key, delta).await
        }

        async fn del(&self, key: &str) -> StoreResult<bool> {
            self.0.del(key).await
        }

        async fn zadd(&self, key: &str, member: &str, score: f64) -> StoreResult<()> {
            self.0.zadd(key, member, score).await
        }

        async fn zadd_nx(&self, key: &str, member: &str, score: f64) -> StoreResult<bool> {
            self.0.zadd_nx(key, member, score).await
        }

        async fn zrem(&self, key: &str, member: &str) -> StoreResult<bool> {
            self.0.zrem(key, member).await
        }

        async fn zscore(&self, key: &str, member: &str) -> StoreResult<Option<f64>> {
            self.0.zscore(key, member).await
        }

        async fn zrange_by_score(&self, key: &str, min: f64, max: f64) -> StoreResult<Vec<(String, f64)>> {
            self.0.zrange_by_score(key, min, max).await
        }

        async fn scan_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
            self.0.scan_prefix(prefix).await
        }

        async fn publish(&self, channel: &str, payload: &str) -> StoreResult<usize> {
            self.0.publish(channel, payload).await
        }

        async fn subscribe(&self, channel: &str) -> StoreResult<ChannelReceiver> {
            self.0.subscribe(channel).await
        }

        async fn ping(&self) -> StoreResult<()> {
            self.0.ping().await
        }
    }

    #[tokio::test]
    async fn create_job_writes_a_queued_record_and_enqueues_it() {
        let h = harness(3);
        let created = h.orchestrator.create_job(subject("70007"), owner("u1"), None).await.unwrap();
        assert!(created.is_new);

        let record = h.orchestrator.get_job(created.job_id).await.unwrap();
        assert_eq!(record.state, JobState::Queued);
        assert_eq!(record.progress, 0);
        assert_eq!(record.subject_id, subject("70007"));

        let delivery = h.queue.next().await.unwrap();
        assert_eq!(delivery.job_id(), created.job_id);
        assert_eq!(h.orchestrator.limiter().current(&owner("u1")).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn same_dedup_token_returns_the_same_job() {
        let h = harness(3);
        let first = h
            .orchestrator
            .create_job(subject("70007"), owner("u1"), Some("t1"))
            .await
            .unwrap();
        let second = h
            .orchestrator
            .create_job(subject("70007"), owner("u1"), Some("t1"))
            .await
            .unwrap();

        assert!(first.is_new);
        assert!(!second.is_new);
        assert_eq!(first.job_id, second.job_id);
        assert_eq!(h.orchestrator.limiter().current(&owner("u1")).await.unwrap(), 1);

        let other = h.orchestrator.create_job(subject("70007"), owner("u1"), None).await.unwrap();
        assert!(other.is_new);
        assert_ne!(other.job_id, first.job_id);
    }

    #[tokio::test]
    async fn concurrent_requests_with_one_token_create_one_job() {
        let queue = Arc::new(InMemoryWorkQueue::default());
        let orchestrator = JobOrchestrator::new(
            Arc::new(YieldingStore(InMemoryStore::default())),
            queue.clone(),
            OrchestratorConfig::default(),
        );

        let (a, b) = tokio::join!(
            orchestrator.create_job(subject("70007"), owner("u1"), Some("t1")),
            orchestrator.create_job(subject("70007"), owner("u1"), Some("t1")),
        );
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_eq!(a.job_id, b.job_id);
        assert_eq!([a.is_new, b.is_new].iter().filter(|new| **new).count(), 1);
        assert_eq!(orchestrator.limiter().current(&owner("u1")).await.unwrap(), 1);
        assert_eq!(queue.counts().await.unwrap().waiting, 1);
    }

    #[tokio::test]
    async fn job_the_queue_refuses_is_failed_and_frees_its_slot() {
        let queue = Arc::new(FlakyQueue::default());
        queue.down.store(true, Ordering::SeqCst);
        let orchestrator = JobOrchestrator::new(InMemoryStore::arc(), queue.clone(), OrchestratorConfig::default());

        let err = orchestrator
            .create_job(subject("70007"), owner("u1"), Some("t1"))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::StoreUnavailable(_)));
        assert_eq!(orchestrator.limiter().current(&owner("u1")).await.unwrap(), 0);
        assert_eq!(orchestrator.idempotency.lookup("t1").await.unwrap(), None);

        let keys = orchestrator.store().scan_prefix(&orchestrator.keys().job_prefix()).await.unwrap();
        assert_eq!(keys.len(), 1);
        let record = JobRecord::from_fields(&orchestrator.store().hget_all(&keys[0]).await.unwrap()).unwrap();
        assert_eq!(record.state, JobState::Failed);
        assert_eq!(record.failure_reason.as_deref(), Some(NOT_ENQUEUED));
    }

    #[tokio::test]
    async fn requeue_the_queue_refuses_stays_queued_for_redelivery() {
        let queue = Arc::new(FlakyQueue::default());
        let orchestrator = JobOrchestrator::new(InMemoryStore::arc(), queue.clone(), OrchestratorConfig::default());
        let id = orchestrator.create_job(subject("x"), owner("u"), None).await.unwrap().job_id;
        let _lost = queue.inner.next().await.unwrap();
        orchestrator.mark_processing(id).await.unwrap();

        queue.down.store(true, Ordering::SeqCst);
        assert!(orchestrator.requeue(id).await.is_err());
        let record = orchestrator.get_job(id).await.unwrap();
        assert_eq!(record.state, JobState::Queued);
        assert_eq!(orchestrator.limiter().current(&owner("u")).await.unwrap(), 1);

        queue.down.store(false, Ordering::SeqCst);
        assert!(orchestrator.redeliver(id).await.unwrap());
        assert_eq!(queue.inner.next().await.unwrap().job_id(), id);
        assert!(orchestrator.get_job(id).await.unwrap().updated_at >= record.updated_at);
    }

    #[tokio::test]
    async fn redeliver_leaves_waiting_and_running_jobs_alone() {
        let h = harness(3);
        let id = h.orchestrator.create_job(subject("x"), owner("u"), None).await.unwrap().job_id;
        assert!(!h.orchestrator.redeliver(id).await.unwrap());
        assert_eq!(h.queue.counts().await.unwrap().waiting, 1);

        h.queue.next().await.unwrap();
        h.orchestrator.mark_processing(id).await.unwrap();
        assert!(!h.orchestrator.redeliver(id).await.unwrap());
        assert_eq!(h.queue.counts().await.unwrap().active, 1);
        assert!(!h.orchestrator.redeliver(JobId::new()).await.unwrap());
    }

    #[tokio::test]
    async fn fourth_job_is_rate_limited_until_one_finishes() {
        let h = harness(3);
        let mut ids = Vec::new();
        for i in 0..3 {
            let created = h
                .orchestrator
                .create_job(subject(&format!("s{i}")), owner("u2"), None)
                .await
                .unwrap();
            ids.push(created.job_id);
        }

        let err = h.orchestrator.create_job(subject("s3"), owner("u2"), None).await.unwrap_err();
        assert_eq!(
            err,
            OrchestratorError::RateLimited {
                retry_after: Duration::from_secs(30)
            }
        );
        // Other owners are unaffected.
        assert!(h.orchestrator.create_job(subject("s3"), owner("u3"), None).await.is_ok());

        h.orchestrator.mark_processing(ids[0]).await.unwrap();
        h.orchestrator.mark_completed(ids[0], "https://files/s0").await.unwrap();

        assert!(h.orchestrator.create_job(subject("s3"), owner("u2"), None).await.unwrap().is_new);
    }

    #[tokio::test]
    async fn rate_limited_request_writes_nothing() {
        let h = harness(1);
        h.orchestrator.create_job(subject("a"), owner("u"), None).await.unwrap();

        let err = h.orchestrator.create_job(subject("b"), owner("u"), Some("tok")).await;
        assert!(matches!(err, Err(OrchestratorError::RateLimited { .. })));
        assert_eq!(h.orchestrator.idempotency.lookup("tok").await.unwrap(), None);
        assert_eq!(h.queue.counts().await.unwrap().waiting, 1);
    }

    #[tokio::test]
    async fn progress_is_monotonic() {
        let h = harness(3);
        let id = h.orchestrator.create_job(subject("70007"), owner("u1"), None).await.unwrap().job_id;

        assert_eq!(h.orchestrator.mark_processing(id).await.unwrap(), Transition::Applied);
        assert_eq!(h.orchestrator.update_progress(id, 50).await.unwrap(), Transition::Applied);
        assert_eq!(h.orchestrator.update_progress(id, 30).await.unwrap(), Transition::Unchanged);
        assert_eq!(h.orchestrator.get_job(id).await.unwrap().progress, 50);

        h.orchestrator.update_progress(id, 250).await.unwrap();
        assert_eq!(h.orchestrator.get_job(id).await.unwrap().progress, 99);
    }

    #[tokio::test]
    async fn processing_set_tracks_active_jobs() {
        let h = harness(3);
        let id = h.orchestrator.create_job(subject("x"), owner("u"), None).await.unwrap().job_id;

        assert_eq!(h.orchestrator.mark_processing(id).await.unwrap(), Transition::Applied);
        assert_eq!(h.orchestrator.mark_processing(id).await.unwrap(), Transition::Unchanged);
        assert!(h.orchestrator.processing().started_at(id).await.unwrap().is_some());

        h.orchestrator.mark_completed(id, "loc").await.unwrap();
        assert!(h.orchestrator.processing().started_at(id).await.unwrap().is_none());

        let record = h.orchestrator.get_job(id).await.unwrap();
        assert_eq!(record.progress, 100);
        assert_eq!(record.result_locator.as_deref(), Some("loc"));
    }

    #[tokio::test]
    async fn late_callbacks_are_rejected_not_errors() {
        let h = harness(3);
        let id = h.orchestrator.create_job(subject("x"), owner("u"), None).await.unwrap().job_id;
        h.orchestrator.mark_processing(id).await.unwrap();
        h.orchestrator.mark_completed(id, "loc").await.unwrap();

        assert_eq!(h.orchestrator.mark_completed(id, "loc").await.unwrap(), Transition::Unchanged);
        assert_eq!(h.orchestrator.mark_processing(id).await.unwrap(), Transition::Rejected);
        assert_eq!(h.orchestrator.update_progress(id, 10).await.unwrap(), Transition::Rejected);
        assert_eq!(
            h.orchestrator.mark_failed(id, "late", false, 1).await.unwrap(),
            Transition::Rejected
        );
        assert_eq!(h.orchestrator.get_job(id).await.unwrap().state, JobState::Completed);
        assert_eq!(
            h.orchestrator.mark_processing(JobId::new()).await.unwrap(),
            Transition::Rejected
        );
    }

    #[tokio::test]
    async fn retryable_failure_keeps_the_slot() {
        let h = harness(3);
        let id = h.orchestrator.create_job(subject("x"), owner("u"), None).await.unwrap().job_id;
        h.orchestrator.mark_processing(id).await.unwrap();

        h.orchestrator.mark_failed(id, "timeout", true, 1).await.unwrap();
        assert_eq!(h.orchestrator.limiter().current(&owner("u")).await.unwrap(), 1);
        assert!(h.orchestrator.processing().started_at(id).await.unwrap().is_none());

        // The queue's retry picks it up again.
        assert_eq!(h.orchestrator.mark_processing(id).await.unwrap(), Transition::Applied);
        h.orchestrator.mark_failed(id, "not found", false, 2).await.unwrap();
        assert_eq!(h.orchestrator.limiter().current(&owner("u")).await.unwrap(), 0);

        // A duplicate terminal report does not release twice.
        assert_eq!(
            h.orchestrator.mark_failed(id, "not found", false, 2).await.unwrap(),
            Transition::Unchanged
        );
        assert_eq!(h.orchestrator.limiter().current(&owner("u")).await.unwrap(), 0);

        let record = h.orchestrator.get_job(id).await.unwrap();
        assert_eq!(record.attempt_count, 2);
        assert_eq!(record.failure_reason.as_deref(), Some("not found"));
    }

    #[tokio::test]
    async fn events_follow_transitions_and_publishing_alone_is_harmless() {
        let h = harness(3);
        let id = h.orchestrator.create_job(subject("x"), owner("u"), None).await.unwrap().job_id;

        // Nobody listening yet.
        h.orchestrator.mark_processing(id).await.unwrap();
        h.orchestrator.update_progress(id, 10).await.unwrap();

        let mut sub = h.orchestrator.subscribe(id).await.unwrap();
        h.orchestrator.update_progress(id, 60).await.unwrap();
        h.orchestrator.mark_completed(id, "loc").await.unwrap();

        assert_eq!(sub.next().await.unwrap().kind, JobEventKind::Progress { progress: 60 });
        assert!(matches!(sub.next().await.unwrap().kind, JobEventKind::Completed { .. }));
        assert!(sub.next().await.is_none());

        assert_eq!(h.orchestrator.get_job(id).await.unwrap().state, JobState::Completed);
    }

    #[tokio::test]
    async fn requeue_and_force_fail() {
        let h = harness(3);
        let id = h.orchestrator.create_job(subject("x"), owner("u"), None).await.unwrap().job_id;
        let first = h.queue.next().await.unwrap();
        h.orchestrator.mark_processing(id).await.unwrap();
        h.orchestrator.update_progress(id, 40).await.unwrap();

        assert_eq!(h.orchestrator.requeue(id).await.unwrap(), Transition::Applied);
        let record = h.orchestrator.get_job(id).await.unwrap();
        assert_eq!(record.state, JobState::Queued);
        assert_eq!(record.progress, 0);
        assert_eq!(record.attempt_count, 1);
        assert_eq!(h.orchestrator.limiter().current(&owner("u")).await.unwrap(), 1);

        // The first delivery is taken back; settling it late changes nothing.
        let second = h.queue.next().await.unwrap();
        assert_eq!(second.job_id(), id);
        h.queue.ack(&first).await.unwrap();
        assert_eq!(h.queue.counts().await.unwrap().active, 1);

        assert_eq!(h.orchestrator.force_fail(id, "gave up").await.unwrap(), Transition::Applied);
        assert_eq!(h.orchestrator.limiter().current(&owner("u")).await.unwrap(), 0);
        assert_eq!(h.orchestrator.requeue(id).await.unwrap(), Transition::Rejected);
    }

    #[tokio::test]
    async fn unknown_jobs_are_not_found() {
        let h = harness(3);
        let id = JobId::new();
        assert_eq!(h.orchestrator.get_job(id).await.unwrap_err(), OrchestratorError::NotFound(id));
    }

    #[tokio::test]
    async fn corrupt_records_surface_as_corrupt() {
        let h = harness(3);
        let id = JobId::new();
        h.orchestrator
            .store()
            .hset_all(&h.orchestrator.keys().job(id), &[("status", "exploded".into())], None)
            .await
            .unwrap();

        assert!(matches!(h.orchestrator.get_job(id).await, Err(OrchestratorError::Corrupt(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn records_expire_after_retention() {
        let queue = Arc::new(InMemoryWorkQueue::default());
        let orchestrator = JobOrchestrator::new(
            InMemoryStore::arc(),
            queue,
            OrchestratorConfig::default().with_retention(Duration::from_secs(60)),
        );
        let id = orchestrator.create_job(subject("x"), owner("u"), Some("tok")).await.unwrap().job_id;

        tokio::time::advance(Duration::from_secs(61)).await;

        assert_eq!(orchestrator.get_job(id).await.unwrap_err(), OrchestratorError::NotFound(id));
        assert_eq!(orchestrator.mark_processing(id).await.unwrap(), Transition::Rejected);
        let again = orchestrator.create_job(subject("x"), owner("u"), Some("tok")).await.unwrap();
        assert!(again.is_new);
    }
}
