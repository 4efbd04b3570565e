//! Idempotency index: dedup token → job id.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use fetchq_core::JobId;

use super::keys::Keys;
use crate::store::{SharedStore, StoreResult};

#[derive(Clone)]
pub struct IdempotencyIndex {
    store: Arc<dyn SharedStore>,
    keys: Keys,
    ttl: Duration,
}

impl IdempotencyIndex {
    pub fn new(store: Arc<dyn SharedStore>, keys: Keys, ttl: Duration) -> Self {
        Self { store, keys, ttl }
    }

    /// Job already registered for `token`, if any.
    pub async fn lookup(&self, token: &str) -> StoreResult<Option<JobId>> {
        let raw = self.store.get(&self.keys.idempotency(token)).await?;
        Ok(raw.and_then(|s| s.parse().ok()))
    }

    /// Read, then conditionally create the entry pointing at `candidate`.
    ///
    /// Returns the job id that owns the token when it is not `candidate`.
    /// The create is a set-if-absent, so of two racing requests exactly one
    /// reserves the token and the other is handed the winner's id.
    pub async fn check_and_reserve(&self, token: &str, candidate: JobId) -> StoreResult<Option<JobId>> {
        if let Some(existing) = self.lookup(token).await? {
            return Ok(Some(existing));
        }

        let key = self.keys.idempotency(token);
        if self.store.set_nx_ex(&key, &candidate.to_string(), self.ttl).await? {
            return Ok(None);
        }

        let winner = self.lookup(token).await?;
        debug!(token, winner = ?winner, "lost idempotency reservation race");
        Ok(winner)
    }

    /// Drop a reservation whose job could not be created.
    pub async fn release(&self, token: &str) -> StoreResult<()> {
        self.store.del(&self.keys.idempotency(token)).await?;
        Ok(())
    }
}
