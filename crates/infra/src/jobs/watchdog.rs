//! Watchdog / reconciler.
//!
//! Each sweep:
//!
//! 1. Requeues (or terminally fails) jobs stuck in `processing` past the
//!    stuck threshold, and prunes processing-set entries whose record is gone.
//! 2. Walks every live Job Record: completed records whose artifact is gone
//!    are failed with "artifact missing"; retryable failures the queue never
//!    picked back up are requeued or, with attempts exhausted, failed; queued
//!    records untouched for the stuck threshold are handed to the queue again.
//! 3. Flags artifacts no live record refers to, and deletes them only once
//!    they have stayed orphaned for the grace period.
//!
//! Every correction is logged at `warn`; nothing is reported to callers.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use fetchq_core::{JobRecord, JobState, SubjectId, Transition};

use super::orchestrator::{JobOrchestrator, OrchestratorError};
use crate::artifacts::{ArtifactError, ArtifactStore};
use crate::config::WatchdogConfig;

pub const ARTIFACT_MISSING: &str = "artifact missing";
pub const ATTEMPTS_EXHAUSTED: &str = "exceeded maximum attempts";

#[derive(Debug, Clone, thiserror::Error)]
pub enum WatchdogError {
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),

    #[error(transparent)]
    Artifacts(#[from] ArtifactError),
}

/// What one sweep changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Stuck jobs put back in the queue.
    pub requeued: u32,
    /// Stuck jobs failed because attempts ran out.
    pub force_failed: u32,
    /// Completed jobs failed because their artifact is gone.
    pub drift_failed: u32,
    /// Stale retryable failures put back in the queue.
    pub stale_requeued: u32,
    /// Stale retryable failures failed because attempts ran out.
    pub stale_failed: u32,
    /// Queued jobs whose delivery was lost, handed to the queue again.
    pub redelivered: u32,
    /// Processing-set entries dropped (record expired or no longer processing).
    pub pruned: u32,
    pub orphans_flagged: u32,
    pub orphans_deleted: u32,
    /// Orphan flags removed because a record for the subject exists again.
    pub orphans_cleared: u32,
}

impl SweepReport {
    pub fn corrections(&self) -> u32 {
        self.requeued
            + self.force_failed
            + self.drift_failed
            + self.stale_requeued
            + self.stale_failed
            + self.redelivered
    }
}

#[derive(Clone)]
pub struct Watchdog {
    orchestrator: JobOrchestrator,
    artifacts: Arc<dyn ArtifactStore>,
    config: WatchdogConfig,
}

impl Watchdog {
    pub fn new(orchestrator: JobOrchestrator, artifacts: Arc<dyn ArtifactStore>, config: WatchdogConfig) -> Self {
        Self {
            orchestrator,
            artifacts,
            config,
        }
    }

    /// One full pass.
    pub async fn sweep(&self) -> Result<SweepReport, WatchdogError> {
        let now = Utc::now();
        let cutoff = now - chrono::Duration::from_std(self.config.stuck_threshold).unwrap_or_default();
        let mut report = SweepReport::default();

        self.recover_stuck(cutoff, &mut report).await?;
        let live_subjects = self.reconcile_records(cutoff, &mut report).await?;
        self.reconcile_orphans(&live_subjects, now, &mut report).await?;

        if report.corrections() > 0 || report.orphans_deleted > 0 {
            info!(?report, "watchdog sweep applied corrections");
        } else {
            debug!(?report, "watchdog sweep clean");
        }
        Ok(report)
    }

    async fn recover_stuck(&self, cutoff: DateTime<Utc>, report: &mut SweepReport) -> Result<(), WatchdogError> {
        let processing = self.orchestrator.processing();

        for (job_id, started_at) in processing
            .started_before(cutoff)
            .await
            .map_err(OrchestratorError::from)?
        {
            let record = match self.orchestrator.get_job(job_id).await {
                Ok(record) => record,
                Err(OrchestratorError::NotFound(_)) => {
                    debug!(%job_id, "processing entry without a live record");
                    processing.remove(job_id).await.map_err(OrchestratorError::from)?;
                    report.pruned += 1;
                    continue;
                }
                Err(OrchestratorError::Corrupt(reason)) => {
                    warn!(%job_id, %reason, "skipping corrupt record");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            if record.state != JobState::Processing {
                processing.remove(job_id).await.map_err(OrchestratorError::from)?;
                report.pruned += 1;
                continue;
            }

            if self.retry_or_fail(&record, "stuck").await? {
                report.requeued += 1;
            } else {
                report.force_failed += 1;
            }
            debug!(%job_id, %started_at, "stuck job handled");
        }
        Ok(())
    }

    /// Returns the subjects that still have a live record.
    async fn reconcile_records(
        &self,
        cutoff: DateTime<Utc>,
        report: &mut SweepReport,
    ) -> Result<HashSet<SubjectId>, WatchdogError> {
        let store = self.orchestrator.store();
        let keys = store
            .scan_prefix(&self.orchestrator.keys().job_prefix())
            .await
            .map_err(OrchestratorError::from)?;

        let mut live_subjects = HashSet::new();
        for key in keys {
            let fields = store.hget_all(&key).await.map_err(OrchestratorError::from)?;
            if fields.is_empty() {
                continue;
            }
            let record = match JobRecord::from_fields(&fields) {
                Ok(record) => record,
                Err(e) => {
                    warn!(%key, error = %e, "skipping corrupt record");
                    continue;
                }
            };
            live_subjects.insert(record.subject_id.clone());

            match record.state {
                JobState::Completed => {
                    if !self.artifacts.exists(&record.subject_id).await? {
                        warn!(
                            job_id = %record.id,
                            correction = "drift",
                            attempts = record.attempt_count,
                            "completed job has no artifact; failing"
                        );
                        if self.orchestrator.force_fail(record.id, ARTIFACT_MISSING).await?.is_applied() {
                            report.drift_failed += 1;
                        }
                    }
                }
                JobState::Failed if record.retryable && record.updated_at < cutoff => {
                    if self.retry_or_fail(&record, "stale_failure").await? {
                        report.stale_requeued += 1;
                    } else {
                        report.stale_failed += 1;
                    }
                }
                JobState::Queued if record.updated_at < cutoff => {
                    if self.orchestrator.redeliver(record.id).await? {
                        warn!(
                            job_id = %record.id,
                            correction = "lost_delivery",
                            queued_since = %record.updated_at,
                            "queued job redelivered"
                        );
                        report.redelivered += 1;
                    }
                }
                _ => {}
            }
        }
        Ok(live_subjects)
    }

    async fn reconcile_orphans(
        &self,
        live_subjects: &HashSet<SubjectId>,
        now: DateTime<Utc>,
        report: &mut SweepReport,
    ) -> Result<(), WatchdogError> {
        let store = self.orchestrator.store();
        let orphans_key = self.orchestrator.keys().orphans();
        let now_ms = now.timestamp_millis() as f64;
        let grace_ms = self.config.orphan_grace.as_millis() as f64;

        let mut stored = HashSet::new();
        for artifact in self.artifacts.list().await? {
            let subject = artifact.subject_id;
            stored.insert(subject.as_str().to_string());

            if live_subjects.contains(&subject) {
                if store.zrem(&orphans_key, subject.as_str()).await.map_err(OrchestratorError::from)? {
                    debug!(%subject, "artifact has a record again; orphan flag cleared");
                    report.orphans_cleared += 1;
                }
                continue;
            }

            if store
                .zadd_nx(&orphans_key, subject.as_str(), now_ms)
                .await
                .map_err(OrchestratorError::from)?
            {
                info!(%subject, "orphan artifact flagged for deferred cleanup");
                report.orphans_flagged += 1;
                continue;
            }

            let flagged_at = store
                .zscore(&orphans_key, subject.as_str())
                .await
                .map_err(OrchestratorError::from)?
                .unwrap_or(now_ms);
            if now_ms - flagged_at >= grace_ms {
                if self.artifacts.delete(&subject).await? {
                    warn!(%subject, correction = "orphan_cleanup", "orphan artifact deleted");
                    report.orphans_deleted += 1;
                }
                store.zrem(&orphans_key, subject.as_str()).await.map_err(OrchestratorError::from)?;
            }
        }

        // Flags for artifacts that disappeared on their own.
        let flags = store
            .zrange_by_score(&orphans_key, f64::NEG_INFINITY, f64::INFINITY)
            .await
            .map_err(OrchestratorError::from)?;
        for (subject, _) in flags {
            if !stored.contains(&subject) {
                store.zrem(&orphans_key, &subject).await.map_err(OrchestratorError::from)?;
            }
        }
        Ok(())
    }

    /// Requeue when attempts remain, otherwise fail terminally. Returns
    /// `true` for a requeue.
    async fn retry_or_fail(&self, record: &JobRecord, correction: &'static str) -> Result<bool, OrchestratorError> {
        let max_attempts = self.orchestrator.config().max_attempts;
        let job_id = record.id;

        if record.attempt_count >= max_attempts {
            warn!(
                %job_id,
                correction,
                attempts = record.attempt_count,
                "attempts exhausted; failing job"
            );
            self.orchestrator.force_fail(job_id, ATTEMPTS_EXHAUSTED).await?;
            return Ok(false);
        }

        warn!(%job_id, correction, attempts = record.attempt_count + 1, "re-enqueuing job");
        if self.orchestrator.requeue(job_id).await? == Transition::Rejected {
            debug!(%job_id, "job moved on before it could be requeued");
        }
        Ok(true)
    }

    /// Run sweeps every `interval` until shut down. A failed sweep is
    /// logged and the loop carries on.
    pub fn spawn(self) -> WatchdogHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let interval = self.config.interval;

        let join = tokio::spawn(async move {
            info!(interval_secs = interval.as_secs(), "watchdog started");
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.sweep().await {
                            error!(error = %e, "watchdog sweep failed");
                        }
                    }
                }
            }
            info!("watchdog stopped");
        });

        WatchdogHandle {
            shutdown: shutdown_tx,
            join,
        }
    }
}

/// Handle to stop a spawned watchdog.
#[derive(Debug)]
pub struct WatchdogHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl WatchdogHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.join.await {
            error!(error = %e, "watchdog task ended abnormally");
        }
    }
}
