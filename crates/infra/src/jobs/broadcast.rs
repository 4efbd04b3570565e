//! Per-job progress broadcast over the shared store's pub/sub.
//!
//! Workers publish, zero or more observers subscribe. Publishing never fails
//! the caller: with nobody listening the event is simply dropped, since the
//! Job Record is the durable source of truth.

use std::sync::Arc;
use std::time::Duration;

use futures::Stream;
use tracing::{debug, warn};

use fetchq_core::{JobEvent, JobId};

use super::keys::Keys;
use crate::store::{ChannelReceiver, SharedStore, StoreResult};

/// Default idle period after which a subscription with no events is closed.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

#[derive(Clone)]
pub struct ProgressBroadcaster {
    store: Arc<dyn SharedStore>,
    keys: Keys,
    idle_timeout: Duration,
}

impl ProgressBroadcaster {
    pub fn new(store: Arc<dyn SharedStore>, keys: Keys) -> Self {
        Self {
            store,
            keys,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Fire-and-forget publish. Returns how many subscribers were reached.
    pub async fn publish(&self, event: &JobEvent) -> usize {
        let payload = match serde_json::to_string(event) {
            Ok(p) => p,
            Err(e) => {
                warn!(job_id = %event.job_id, error = %e, "failed to encode job event");
                return 0;
            }
        };

        match self.store.publish(&self.keys.events(event.job_id), &payload).await {
            Ok(reached) => {
                debug!(job_id = %event.job_id, reached, "published job event");
                reached
            }
            Err(e) => {
                warn!(job_id = %event.job_id, error = %e, "failed to publish job event");
                0
            }
        }
    }

    /// Live events for one job, in publish order.
    pub async fn subscribe(&self, job_id: JobId) -> StoreResult<Subscription> {
        let rx = self.store.subscribe(&self.keys.events(job_id)).await?;
        Ok(Subscription {
            job_id,
            rx,
            idle_timeout: self.idle_timeout,
            closed: false,
        })
    }
}

/// One observer's view of a job's broadcast channel.
///
/// Ends when the observer unsubscribes, after a `completed`/`failed` event has
/// been delivered, or after `idle_timeout` without any event.
#[derive(Debug)]
pub struct Subscription {
    job_id: JobId,
    rx: ChannelReceiver,
    idle_timeout: Duration,
    closed: bool,
}

impl Subscription {
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Next event, or `None` once the subscription has ended.
    pub async fn next(&mut self) -> Option<JobEvent> {
        while !self.closed {
            let raw = match tokio::time::timeout(self.idle_timeout, self.rx.recv()).await {
                Ok(Some(raw)) => raw,
                Ok(None) => {
                    self.closed = true;
                    return None;
                }
                Err(_) => {
                    debug!(job_id = %self.job_id, "subscription idle; closing");
                    self.close();
                    return None;
                }
            };

            let event: JobEvent = match serde_json::from_str(&raw) {
                Ok(event) => event,
                Err(e) => {
                    warn!(job_id = %self.job_id, error = %e, "dropping undecodable job event");
                    continue;
                }
            };

            if event.closes_stream() {
                self.close();
            }
            return Some(event);
        }
        None
    }

    /// Explicit teardown by the observer.
    pub fn unsubscribe(mut self) {
        self.close();
    }

    pub fn into_stream(self) -> impl Stream<Item = JobEvent> + Send {
        futures::stream::unfold(self, |mut sub| async move { sub.next().await.map(|event| (event, sub)) })
    }

    fn close(&mut self) {
        self.closed = true;
        self.rx.close();
    }
}
