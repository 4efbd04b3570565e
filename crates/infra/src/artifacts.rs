//! Artifact store capability.
//!
//! The byte-moving side of the system lives elsewhere; the orchestrator and
//! watchdog only need to ask whether an artifact exists, how large it is,
//! where a caller can fetch it from, and which artifacts are stored at all.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use fetchq_core::SubjectId;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ArtifactError {
    #[error("artifact not found: {0}")]
    NotFound(SubjectId),

    #[error("artifact store unavailable: {0}")]
    Unavailable(String),

    #[error("artifact store lock poisoned")]
    Poisoned,
}

/// A stored artifact as reported by [`ArtifactStore::list`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactMeta {
    pub subject_id: SubjectId,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
}

#[async_trait]
pub trait ArtifactStore: Send + Sync + 'static {
    async fn exists(&self, subject: &SubjectId) -> Result<bool, ArtifactError>;

    /// Size in bytes. `NotFound` when the artifact is missing.
    async fn size(&self, subject: &SubjectId) -> Result<u64, ArtifactError>;

    /// Time-limited retrieval URL.
    async fn presign(&self, subject: &SubjectId, ttl: Duration) -> Result<String, ArtifactError>;

    async fn list(&self) -> Result<Vec<ArtifactMeta>, ArtifactError>;

    /// Returns `true` if something was deleted.
    async fn delete(&self, subject: &SubjectId) -> Result<bool, ArtifactError>;
}

/// In-memory artifact store for tests/dev.
///
/// Presigned URLs have the form `{base_url}/{subject}?expires={unix_secs}`.
#[derive(Debug)]
pub struct InMemoryArtifactStore {
    base_url: String,
    objects: Mutex<BTreeMap<String, ArtifactMeta>>,
}

impl Default for InMemoryArtifactStore {
    fn default() -> Self {
        Self::new("memory://artifacts")
    }
}

impl InMemoryArtifactStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            objects: Mutex::new(BTreeMap::new()),
        }
    }

    /// Store (or replace) an artifact.
    pub fn put(&self, subject: &SubjectId, size: u64, last_modified: DateTime<Utc>) -> Result<(), ArtifactError> {
        self.objects()?.insert(
            subject.as_str().to_string(),
            ArtifactMeta {
                subject_id: subject.clone(),
                size,
                last_modified,
            },
        );
        Ok(())
    }

    fn objects(&self) -> Result<MutexGuard<'_, BTreeMap<String, ArtifactMeta>>, ArtifactError> {
        self.objects.lock().map_err(|_| ArtifactError::Poisoned)
    }
}

#[async_trait]
impl ArtifactStore for InMemoryArtifactStore {
    async fn exists(&self, subject: &SubjectId) -> Result<bool, ArtifactError> {
        Ok(self.objects()?.contains_key(subject.as_str()))
    }

    async fn size(&self, subject: &SubjectId) -> Result<u64, ArtifactError> {
        self.objects()?
            .get(subject.as_str())
            .map(|meta| meta.size)
            .ok_or_else(|| ArtifactError::NotFound(subject.clone()))
    }

    async fn presign(&self, subject: &SubjectId, ttl: Duration) -> Result<String, ArtifactError> {
        if !self.exists(subject).await? {
            return Err(ArtifactError::NotFound(subject.clone()));
        }
        let expires = Utc::now().timestamp() + ttl.as_secs() as i64;
        Ok(format!("{}/{}?expires={expires}", self.base_url, subject))
    }

    async fn list(&self) -> Result<Vec<ArtifactMeta>, ArtifactError> {
        Ok(self.objects()?.values().cloned().collect())
    }

    async fn delete(&self, subject: &SubjectId) -> Result<bool, ArtifactError> {
        Ok(self.objects()?.remove(subject.as_str()).is_some())
    }
}
