//! Worker pool.
//!
//! Each worker task pulls one delivery at a time from the [`WorkSource`] and
//! drives it through the orchestrator:
//!
//! ```text
//! delivery ─▶ mark_processing ─▶ handler.run ──▶ mark_completed / mark_failed ─▶ ack / nack
//!                                    │
//!                          ProgressReporter (mpsc)
//!                                    ▼
//!                             update_progress
//! ```
//!
//! Progress travels over a bounded channel and is applied in order by a
//! forwarding loop running beside the handler, so the handler never touches
//! the Job Record itself.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use fetchq_core::{JobId, JobRecord, Transition};

use crate::config::WorkerConfig;
use crate::jobs::JobOrchestrator;
use crate::queue::{Delivery, NackOutcome, WorkSource};

/// Pause after the queue itself fails, before polling again.
const SOURCE_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// A failed execution, classified by whether another attempt could succeed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{reason}")]
pub struct ExecutionFailure {
    pub reason: String,
    pub retryable: bool,
}

impl ExecutionFailure {
    /// Network or storage trouble; worth retrying.
    pub fn transient(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            retryable: true,
        }
    }

    /// Bad input or missing data; retrying will not help.
    pub fn permanent(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            retryable: false,
        }
    }
}

/// Sends progress from a running handler to the orchestrator.
#[derive(Debug)]
pub struct ProgressReporter {
    job_id: JobId,
    tx: mpsc::Sender<i64>,
}

impl ProgressReporter {
    pub fn new(job_id: JobId, tx: mpsc::Sender<i64>) -> Self {
        Self { job_id, tx }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Report `percent` (clamped and de-duplicated downstream). Waits if the
    /// orchestrator is behind.
    pub async fn report(&self, percent: i64) {
        if self.tx.send(percent).await.is_err() {
            debug!(job_id = %self.job_id, percent, "progress receiver gone");
        }
    }
}

/// The body of a job. Returns the result locator on success.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn run(&self, job: &JobRecord, progress: ProgressReporter) -> Result<String, ExecutionFailure>;
}

/// Worker runtime statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkerStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub jobs_retried: u64,
    /// Deliveries dropped because the job was not runnable.
    pub jobs_skipped: u64,
    pub current_running: usize,
    pub uptime_secs: u64,
}

/// Handle to control a running pool.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
    stats: Arc<Mutex<WorkerStats>>,
    started: Instant,
}

impl WorkerHandle {
    /// Stop pulling new deliveries and wait for in-flight ones to settle.
    /// Returns the final statistics.
    pub async fn shutdown(mut self) -> WorkerStats {
        let _ = self.shutdown.send(true);
        for join in self.joins.drain(..) {
            if let Err(e) = join.await {
                error!(error = %e, "worker task ended abnormally");
            }
        }
        self.stats()
    }

    pub fn stats(&self) -> WorkerStats {
        let mut stats = self.stats.lock().map(|s| s.clone()).unwrap_or_default();
        stats.uptime_secs = self.started.elapsed().as_secs();
        stats
    }
}

#[derive(Debug)]
pub struct WorkerPool;

impl WorkerPool {
    /// Spawn `config.concurrency` worker tasks.
    pub fn spawn(
        config: WorkerConfig,
        source: Arc<dyn WorkSource>,
        orchestrator: JobOrchestrator,
        handler: Arc<dyn JobHandler>,
    ) -> WorkerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = Arc::new(Mutex::new(WorkerStats::default()));
        let config = Arc::new(config);

        let joins = (0..config.concurrency.max(1))
            .map(|slot| {
                let worker = Worker {
                    name: format!("{}-{slot}", config.name),
                    config: config.clone(),
                    source: source.clone(),
                    orchestrator: orchestrator.clone(),
                    handler: handler.clone(),
                    stats: stats.clone(),
                };
                tokio::spawn(worker.run(shutdown_rx.clone()))
            })
            .collect();

        info!(pool = %config.name, concurrency = config.concurrency, "worker pool started");
        WorkerHandle {
            shutdown: shutdown_tx,
            joins,
            stats,
            started: Instant::now(),
        }
    }
}

struct Worker {
    name: String,
    config: Arc<WorkerConfig>,
    source: Arc<dyn WorkSource>,
    orchestrator: JobOrchestrator,
    handler: Arc<dyn JobHandler>,
    stats: Arc<Mutex<WorkerStats>>,
}

/// How a delivery ended, for stats.
enum Settled {
    Succeeded,
    Failed,
    Retrying,
    Skipped,
}

impl Worker {
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        debug!(worker = %self.name, "worker started");

        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                next = self.source.next() => next,
            };

            match next {
                Ok(delivery) => {
                    self.update_stats(|s| s.current_running += 1);
                    let settled = self.process(&delivery).await;
                    self.update_stats(|s| {
                        s.current_running = s.current_running.saturating_sub(1);
                        s.jobs_processed += 1;
                        match settled {
                            Settled::Succeeded => s.jobs_succeeded += 1,
                            Settled::Failed => s.jobs_failed += 1,
                            Settled::Retrying => s.jobs_retried += 1,
                            Settled::Skipped => s.jobs_skipped += 1,
                        }
                    });
                }
                Err(e) => {
                    error!(worker = %self.name, error = %e, "failed to pull from work queue");
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = tokio::time::sleep(SOURCE_ERROR_BACKOFF) => {}
                    }
                }
            }
        }

        debug!(worker = %self.name, "worker stopped");
    }

    async fn process(&self, delivery: &Delivery) -> Settled {
        let job_id = delivery.job_id();

        match self.orchestrator.mark_processing(job_id).await {
            Ok(Transition::Rejected) => {
                debug!(worker = %self.name, %job_id, "job not runnable; dropping delivery");
                self.ack(delivery).await;
                return Settled::Skipped;
            }
            Ok(_) => {}
            Err(e) => return self.nack(delivery, true, &e.to_string()).await,
        }

        let record = match self.orchestrator.get_job(job_id).await {
            Ok(record) => record,
            Err(e) => return self.nack(delivery, true, &e.to_string()).await,
        };

        let (tx, mut rx) = mpsc::channel(self.config.progress_buffer.max(1));
        let reporter = ProgressReporter::new(job_id, tx);

        let forward = async {
            while let Some(percent) = rx.recv().await {
                if let Err(e) = self.orchestrator.update_progress(job_id, percent).await {
                    warn!(%job_id, percent, error = %e, "failed to record progress");
                }
            }
        };
        let (result, ()) = tokio::join!(self.handler.run(&record, reporter), forward);

        match result {
            Ok(locator) => match self.orchestrator.mark_completed(job_id, locator).await {
                Ok(_) => {
                    self.ack(delivery).await;
                    Settled::Succeeded
                }
                Err(e) => self.nack(delivery, true, &e.to_string()).await,
            },
            Err(failure) => {
                // On the last permitted attempt the slot must be released.
                let retry = failure.retryable && self.source.will_retry(delivery);
                debug!(%job_id, attempt = delivery.attempt, retry, reason = %failure.reason, "job failed");

                if let Err(e) = self
                    .orchestrator
                    .mark_failed(job_id, &failure.reason, retry, delivery.attempt)
                    .await
                {
                    error!(%job_id, error = %e, "failed to record job failure");
                }
                self.nack(delivery, retry, &failure.reason).await
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) {
        if let Err(e) = self.source.ack(delivery).await {
            error!(job_id = %delivery.job_id(), error = %e, "failed to ack delivery");
        }
    }

    async fn nack(&self, delivery: &Delivery, retry: bool, reason: &str) -> Settled {
        match self.source.nack(delivery, retry, reason).await {
            Ok(NackOutcome::Retrying { delay }) => {
                debug!(job_id = %delivery.job_id(), delay_ms = delay.as_millis() as u64, "delivery will be retried");
                Settled::Retrying
            }
            Ok(NackOutcome::DeadLettered) => Settled::Failed,
            Ok(NackOutcome::Superseded) => {
                debug!(job_id = %delivery.job_id(), "job was reclaimed while this delivery ran");
                Settled::Skipped
            }
            Err(e) => {
                error!(job_id = %delivery.job_id(), error = %e, "failed to nack delivery");
                Settled::Failed
            }
        }
    }

    fn update_stats(&self, f: impl FnOnce(&mut WorkerStats)) {
        if let Ok(mut stats) = self.stats.lock() {
            f(&mut stats);
        }
    }
}
