//! In-memory shared store for tests/dev.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::{ChannelReceiver, SharedStore, StoreError, StoreResult};

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    Hash(HashMap<String, String>),
    SortedSet(HashMap<String, f64>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: Value) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// In-memory shared store.
///
/// - Each operation runs under one lock, so every primitive is atomic
/// - Expired keys are evicted lazily on access (uses `tokio::time`, so paused
///   test clocks drive expiry)
/// - Pub/sub is best-effort fan-out to currently connected receivers
#[derive(Debug, Default)]
pub struct InMemoryStore {
    data: Mutex<HashMap<String, Entry>>,
    channels: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<String>>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn data(&self) -> StoreResult<MutexGuard<'_, HashMap<String, Entry>>> {
        self.data.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Live entry for `key`, evicting it first if it has expired.
    fn live<'a>(data: &'a mut HashMap<String, Entry>, key: &str) -> Option<&'a mut Entry> {
        if data.get(key).is_some_and(|e| e.is_expired(Instant::now())) {
            data.remove(key);
        }
        data.get_mut(key)
    }
}

fn wrong_type(key: &str) -> StoreError {
    StoreError::Command(format!("WRONGTYPE operation against key `{key}`"))
}

fn sorted_set<'a>(data: &'a mut HashMap<String, Entry>, key: &str) -> StoreResult<&'a mut HashMap<String, f64>> {
    if InMemoryStore::live(data, key).is_none() {
        data.insert(key.to_string(), Entry::new(Value::SortedSet(HashMap::new())));
    }
    match data.get_mut(key).map(|e| &mut e.value) {
        Some(Value::SortedSet(set)) => Ok(set),
        _ => Err(wrong_type(key)),
    }
}

#[async_trait]
impl SharedStore for InMemoryStore {
    async fn hset_all(&self, key: &str, fields: &[(&str, String)], ttl: Option<Duration>) -> StoreResult<()> {
        let mut data = self.data()?;
        if Self::live(&mut data, key).is_none() {
            data.insert(key.to_string(), Entry::new(Value::Hash(HashMap::new())));
        }

        let entry = data.get_mut(key).ok_or_else(|| wrong_type(key))?;
        let Value::Hash(hash) = &mut entry.value else {
            return Err(wrong_type(key));
        };
        for (field, value) in fields {
            hash.insert((*field).to_string(), value.clone());
        }
        if let Some(ttl) = ttl {
            entry.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }

    async fn hget_all(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        let mut data = self.data()?;
        match Self::live(&mut data, key).map(|e| &e.value) {
            None => Ok(HashMap::new()),
            Some(Value::Hash(hash)) => Ok(hash.clone()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        let mut data = self.data()?;
        match Self::live(&mut data, key) {
            Some(entry) => {
                entry.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut data = self.data()?;
        match Self::live(&mut data, key).map(|e| &e.value) {
            None => Ok(None),
            Some(Value::Str(s)) => Ok(Some(s.clone())),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        let mut data = self.data()?;
        if Self::live(&mut data, key).is_some() {
            return Ok(false);
        }
        data.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn incr_by(&self, key: &str, delta: i64) -> StoreResult<i64> {
        let mut data = self.data()?;
        let Some(entry) = Self::live(&mut data, key) else {
            data.insert(key.to_string(), Entry::new(Value::Str(delta.to_string())));
            return Ok(delta);
        };

        let Value::Str(raw) = &mut entry.value else {
            return Err(wrong_type(key));
        };
        let current: i64 = raw
            .parse()
            .map_err(|_| StoreError::Command(format!("value at `{key}` is not an integer")))?;
        let next = current + delta;
        *raw = next.to_string();
        Ok(next)
    }

    async fn del(&self, key: &str) -> StoreResult<bool> {
        let mut data = self.data()?;
        let existed = Self::live(&mut data, key).is_some();
        data.remove(key);
        Ok(existed)
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> StoreResult<()> {
        let mut data = self.data()?;
        sorted_set(&mut data, key)?.insert(member.to_string(), score);
        Ok(())
    }

    async fn zadd_nx(&self, key: &str, member: &str, score: f64) -> StoreResult<bool> {
        let mut data = self.data()?;
        let set = sorted_set(&mut data, key)?;
        if set.contains_key(member) {
            return Ok(false);
        }
        set.insert(member.to_string(), score);
        Ok(true)
    }

    async fn zrem(&self, key: &str, member: &str) -> StoreResult<bool> {
        let mut data = self.data()?;
        match Self::live(&mut data, key).map(|e| &mut e.value) {
            None => Ok(false),
            Some(Value::SortedSet(set)) => Ok(set.remove(member).is_some()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn zscore(&self, key: &str, member: &str) -> StoreResult<Option<f64>> {
        let mut data = self.data()?;
        match Self::live(&mut data, key).map(|e| &e.value) {
            None => Ok(None),
            Some(Value::SortedSet(set)) => Ok(set.get(member).copied()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn zrange_by_score(&self, key: &str, min: f64, max: f64) -> StoreResult<Vec<(String, f64)>> {
        let mut data = self.data()?;
        let set = match Self::live(&mut data, key).map(|e| &e.value) {
            None => return Ok(Vec::new()),
            Some(Value::SortedSet(set)) => set,
            Some(_) => return Err(wrong_type(key)),
        };

        let mut members: Vec<(String, f64)> = set
            .iter()
            .filter(|(_, score)| **score >= min && **score <= max)
            .map(|(m, s)| (m.clone(), *s))
            .collect();
        members.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        Ok(members)
    }

    async fn scan_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let mut data = self.data()?;
        let now = Instant::now();
        data.retain(|_, entry| !entry.is_expired(now));

        let mut keys: Vec<String> = data.keys().filter(|k| k.starts_with(prefix)).cloned().collect();
        keys.sort();
        Ok(keys)
    }

    async fn publish(&self, channel: &str, payload: &str) -> StoreResult<usize> {
        let mut channels = self.channels.lock().map_err(|_| StoreError::Poisoned)?;
        let Some(subs) = channels.get_mut(channel) else {
            return Ok(0);
        };

        // Drop any dead subscribers while publishing.
        subs.retain(|tx| tx.send(payload.to_string()).is_ok());
        let reached = subs.len();
        if subs.is_empty() {
            channels.remove(channel);
        }
        Ok(reached)
    }

    async fn subscribe(&self, channel: &str) -> StoreResult<ChannelReceiver> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut channels = self.channels.lock().map_err(|_| StoreError::Poisoned)?;
        channels.entry(channel.to_string()).or_default().push(tx);
        Ok(rx)
    }

    async fn ping(&self) -> StoreResult<()> {
        self.data().map(|_| ())
    }
}
