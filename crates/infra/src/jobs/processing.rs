//! Processing set: job ids believed to be executing, ordered by start time.

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};

use fetchq_core::JobId;

use super::keys::Keys;
use crate::store::{SharedStore, StoreResult};

#[derive(Clone)]
pub struct ProcessingSet {
    store: Arc<dyn SharedStore>,
    keys: Keys,
}

impl ProcessingSet {
    pub fn new(store: Arc<dyn SharedStore>, keys: Keys) -> Self {
        Self { store, keys }
    }

    pub async fn insert(&self, id: JobId, started_at: DateTime<Utc>) -> StoreResult<()> {
        self.store
            .zadd(&self.keys.processing(), &id.to_string(), started_at.timestamp_millis() as f64)
            .await
    }

    pub async fn remove(&self, id: JobId) -> StoreResult<bool> {
        self.store.zrem(&self.keys.processing(), &id.to_string()).await
    }

    pub async fn started_at(&self, id: JobId) -> StoreResult<Option<DateTime<Utc>>> {
        let score = self.store.zscore(&self.keys.processing(), &id.to_string()).await?;
        Ok(score.and_then(from_score))
    }

    /// Entries that started at or before `cutoff`, oldest first.
    ///
    /// Members that are not valid job ids are dropped from the set.
    pub async fn started_before(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<(JobId, DateTime<Utc>)>> {
        let key = self.keys.processing();
        let raw = self
            .store
            .zrange_by_score(&key, f64::NEG_INFINITY, cutoff.timestamp_millis() as f64)
            .await?;

        let mut entries = Vec::with_capacity(raw.len());
        for (member, score) in raw {
            match (member.parse::<JobId>(), from_score(score)) {
                (Ok(id), Some(at)) => entries.push((id, at)),
                _ => {
                    self.store.zrem(&key, &member).await?;
                }
            }
        }
        Ok(entries)
    }
}

fn from_score(score: f64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(score as i64).single()
}
