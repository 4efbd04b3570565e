//! In-memory work queue for tests/dev.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

use fetchq_core::JobId;

use super::types::{DeadLetterEntry, Delivery, JobPayload, NackOutcome, QueueCounts, RetryPolicy};
use super::{QueueError, WorkQueue, WorkSource};

#[derive(Debug, Default)]
struct Inner {
    waiting: VecDeque<JobId>,
    delayed: Vec<(Instant, JobId)>,
    /// Job id to the tag of the delivery currently out for it.
    active: HashMap<JobId, String>,
    /// Enqueued again while active; runs once more after it settles.
    rerun: HashSet<JobId>,
    /// Payload and deliveries so far, per enqueued job.
    jobs: HashMap<JobId, (JobPayload, u32)>,
    completed: u64,
    failed: u64,
    dead_letters: Vec<DeadLetterEntry>,
    deliveries: u64,
}

enum Settled {
    /// The job was reclaimed while this delivery ran.
    Superseded,
    /// A rerun was pending; the job went straight back to waiting.
    Rerun,
    Done,
}

impl Inner {
    fn promote_due(&mut self, now: Instant) {
        let mut i = 0;
        while i < self.delayed.len() {
            if self.delayed[i].0 <= now {
                let (_, id) = self.delayed.swap_remove(i);
                self.waiting.push_back(id);
            } else {
                i += 1;
            }
        }
    }

    fn next_due(&self) -> Option<Instant> {
        self.delayed.iter().map(|(at, _)| *at).min()
    }

    fn is_scheduled(&self, id: JobId) -> bool {
        self.waiting.contains(&id) || self.delayed.iter().any(|(_, d)| *d == id)
    }

    fn settle(&mut self, delivery: &Delivery) -> Settled {
        let id = delivery.job_id();
        if self.active.get(&id) != Some(&delivery.tag) {
            return Settled::Superseded;
        }
        self.active.remove(&id);
        if self.rerun.remove(&id) {
            if let Some((_, attempts)) = self.jobs.get_mut(&id) {
                *attempts = 0;
            }
            self.waiting.push_back(id);
            return Settled::Rerun;
        }
        Settled::Done
    }
}

/// Process-local queue with the same delivery rules as the Redis one:
/// one executor per job id at a time, delayed retries, dead letters.
#[derive(Debug)]
pub struct InMemoryWorkQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    policy: RetryPolicy,
}

impl Default for InMemoryWorkQueue {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

impl InMemoryWorkQueue {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
            policy,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn dead_letters(&self) -> Result<Vec<DeadLetterEntry>, QueueError> {
        Ok(self.lock()?.dead_letters.clone())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, QueueError> {
        self.inner.lock().map_err(|_| QueueError::Poisoned)
    }
}

#[async_trait]
impl WorkQueue for InMemoryWorkQueue {
    async fn enqueue(&self, job_id: JobId, payload: JobPayload) -> Result<(), QueueError> {
        {
            let mut inner = self.lock()?;
            if inner.active.contains_key(&job_id) {
                debug!(%job_id, "job is active; scheduling a rerun");
                inner.rerun.insert(job_id);
                inner.jobs.insert(job_id, (payload, 0));
                return Ok(());
            }
            if inner.is_scheduled(job_id) {
                debug!(%job_id, "job already waiting");
                return Ok(());
            }
            inner.jobs.insert(job_id, (payload, 0));
            inner.waiting.push_back(job_id);
        }
        self.notify.notify_one();
        Ok(())
    }

    async fn reclaim(&self, job_id: JobId, payload: JobPayload) -> Result<bool, QueueError> {
        {
            let mut inner = self.lock()?;
            inner.rerun.remove(&job_id);
            if inner.active.remove(&job_id).is_some() {
                warn!(%job_id, "taking job back from its executor");
            }
            if inner.is_scheduled(job_id) {
                debug!(%job_id, "job already waiting");
                return Ok(false);
            }
            inner.jobs.insert(job_id, (payload, 0));
            inner.waiting.push_back(job_id);
        }
        self.notify.notify_one();
        Ok(true)
    }

    async fn counts(&self) -> Result<QueueCounts, QueueError> {
        let inner = self.lock()?;
        Ok(QueueCounts {
            waiting: inner.waiting.len() as u64,
            active: inner.active.len() as u64,
            delayed: inner.delayed.len() as u64,
            completed: inner.completed,
            failed: inner.failed,
            dead_lettered: inner.dead_letters.len() as u64,
        })
    }
}

#[async_trait]
impl WorkSource for InMemoryWorkQueue {
    async fn next(&self) -> Result<Delivery, QueueError> {
        loop {
            let wake_at = {
                let mut inner = self.lock()?;
                inner.promote_due(Instant::now());

                while let Some(id) = inner.waiting.pop_front() {
                    let Some((payload, attempts)) = inner.jobs.get_mut(&id) else {
                        continue;
                    };
                    *attempts += 1;
                    let (payload, attempt) = (payload.clone(), *attempts);
                    inner.deliveries += 1;
                    let delivery = Delivery {
                        payload,
                        attempt,
                        tag: format!("{id}#{}", inner.deliveries),
                    };
                    inner.active.insert(id, delivery.tag.clone());
                    return Ok(delivery);
                }
                inner.next_due()
            };

            match wake_at {
                Some(at) => {
                    tokio::select! {
                        _ = self.notify.notified() => {}
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
                None => self.notify.notified().await,
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let id = delivery.job_id();
        let rerun = {
            let mut inner = self.lock()?;
            match inner.settle(delivery) {
                Settled::Superseded => {
                    debug!(%id, "ack for a reclaimed delivery ignored");
                    return Ok(());
                }
                Settled::Rerun => {
                    inner.completed += 1;
                    true
                }
                Settled::Done => {
                    inner.completed += 1;
                    inner.jobs.remove(&id);
                    false
                }
            }
        };
        if rerun {
            self.notify.notify_one();
        }
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery, retry: bool, reason: &str) -> Result<NackOutcome, QueueError> {
        let id = delivery.job_id();
        let outcome = {
            let mut inner = self.lock()?;
            let settled = inner.settle(delivery);
            if matches!(settled, Settled::Superseded) {
                debug!(%id, "nack for a reclaimed delivery ignored");
                return Ok(NackOutcome::Superseded);
            }
            inner.failed += 1;

            if matches!(settled, Settled::Rerun) {
                NackOutcome::Retrying { delay: Duration::ZERO }
            } else if retry && self.policy.should_retry(delivery.attempt) {
                let delay = self.policy.redelivery_delay(delivery.job_id(), delivery.attempt);
                inner.delayed.push((Instant::now() + delay, id));
                NackOutcome::Retrying { delay }
            } else {
                let (payload, attempts) = inner
                    .jobs
                    .remove(&id)
                    .unwrap_or_else(|| (delivery.payload.clone(), delivery.attempt));
                warn!(%id, attempts, reason, "job dead-lettered");
                inner.dead_letters.push(DeadLetterEntry::new(payload, attempts, reason));
                NackOutcome::DeadLettered
            }
        };
        self.notify.notify_one();
        Ok(outcome)
    }

    fn will_retry(&self, delivery: &Delivery) -> bool {
        self.policy.should_retry(delivery.attempt)
    }
}
