//! Per-owner concurrency counter.

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use fetchq_core::OwnerId;

use super::keys::Keys;
use crate::store::{SharedStore, StoreResult};

/// Bounds the number of in-flight jobs per owner.
///
/// The check and the increment are separate store calls, so a burst of
/// concurrent requests may overshoot the limit slightly; the watchdog and the
/// counter expiry bring the count back in line.
#[derive(Clone)]
pub struct ConcurrencyLimiter {
    store: Arc<dyn SharedStore>,
    keys: Keys,
    max_in_flight: u32,
    ttl: Duration,
}

impl ConcurrencyLimiter {
    pub fn new(store: Arc<dyn SharedStore>, keys: Keys, max_in_flight: u32, ttl: Duration) -> Self {
        Self {
            store,
            keys,
            max_in_flight,
            ttl,
        }
    }

    pub fn max_in_flight(&self) -> u32 {
        self.max_in_flight
    }

    pub async fn current(&self, owner: &OwnerId) -> StoreResult<i64> {
        let raw = self.store.get(&self.keys.active_count(owner)).await?;
        Ok(raw.and_then(|s| s.parse().ok()).unwrap_or(0).max(0))
    }

    /// `true` when the owner has a free slot.
    pub async fn has_capacity(&self, owner: &OwnerId) -> StoreResult<bool> {
        Ok(self.current(owner).await? < i64::from(self.max_in_flight))
    }

    pub async fn acquire(&self, owner: &OwnerId) -> StoreResult<i64> {
        let key = self.keys.active_count(owner);
        let count = self.store.incr_by(&key, 1).await?;
        self.store.expire(&key, self.ttl).await?;
        Ok(count)
    }

    /// Release one slot, healing the counter if it would go negative.
    pub async fn release(&self, owner: &OwnerId) -> StoreResult<i64> {
        let key = self.keys.active_count(owner);
        let count = self.store.incr_by(&key, -1).await?;
        if count < 0 {
            warn!(owner = %owner, count, "concurrency counter went negative; resetting");
        }
        if count <= 0 {
            self.store.del(&key).await?;
            return Ok(0);
        }
        Ok(count)
    }
}
