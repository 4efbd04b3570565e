//! Default job body: resolve an artifact and issue a retrieval URL for it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use fetchq_core::JobRecord;

use super::pool::{ExecutionFailure, JobHandler, ProgressReporter};
use crate::artifacts::{ArtifactError, ArtifactStore};

pub struct ArtifactFetchHandler {
    artifacts: Arc<dyn ArtifactStore>,
    presign_ttl: Duration,
}

impl ArtifactFetchHandler {
    pub fn new(artifacts: Arc<dyn ArtifactStore>, presign_ttl: Duration) -> Self {
        Self { artifacts, presign_ttl }
    }
}

impl From<ArtifactError> for ExecutionFailure {
    fn from(e: ArtifactError) -> Self {
        match e {
            ArtifactError::NotFound(_) => ExecutionFailure::permanent("artifact not found"),
            ArtifactError::Unavailable(_) | ArtifactError::Poisoned => ExecutionFailure::transient(e.to_string()),
        }
    }
}

#[async_trait]
impl JobHandler for ArtifactFetchHandler {
    async fn run(&self, job: &JobRecord, progress: ProgressReporter) -> Result<String, ExecutionFailure> {
        let subject = &job.subject_id;
        progress.report(10).await;

        if !self.artifacts.exists(subject).await? {
            return Err(ExecutionFailure::permanent("artifact not found"));
        }
        progress.report(40).await;

        let size = self.artifacts.size(subject).await?;
        debug!(job_id = %job.id, %subject, size, "artifact located");
        progress.report(70).await;

        let url = self.artifacts.presign(subject, self.presign_ttl).await?;
        progress.report(90).await;
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use fetchq_core::{JobId, OwnerId, SubjectId};
    use tokio::sync::mpsc;

    use crate::artifacts::InMemoryArtifactStore;

    fn job(subject: &str) -> JobRecord {
        JobRecord::new(
            JobId::new(),
            SubjectId::new(subject).unwrap(),
            OwnerId::new("u").unwrap(),
            Utc::now(),
        )
    }

    fn reporter(job: &JobRecord) -> (ProgressReporter, mpsc::Receiver<i64>) {
        let (tx, rx) = mpsc::channel(16);
        (ProgressReporter::new(job.id, tx), rx)
    }

    #[tokio::test]
    async fn issues_a_url_and_reports_each_step() {
        let store = Arc::new(InMemoryArtifactStore::new("https://files.test"));
        store.put(&SubjectId::new("70007").unwrap(), 2048, Utc::now()).unwrap();
        let handler = ArtifactFetchHandler::new(store, Duration::from_secs(3600));

        let job = job("70007");
        let (progress, mut rx) = reporter(&job);
        let url = handler.run(&job, progress).await.unwrap();
        assert!(url.starts_with("https://files.test/70007?expires="));

        let mut steps = Vec::new();
        while let Some(p) = rx.recv().await {
            steps.push(p);
        }
        assert_eq!(steps, vec![10, 40, 70, 90]);
    }

    #[tokio::test]
    async fn missing_artifact_is_a_permanent_failure() {
        let handler = ArtifactFetchHandler::new(Arc::new(InMemoryArtifactStore::default()), Duration::from_secs(60));
        let job = job("nope");
        let (progress, _rx) = reporter(&job);

        let failure = handler.run(&job, progress).await.unwrap_err();
        assert_eq!(failure, ExecutionFailure::permanent("artifact not found"));
    }

    #[test]
    fn store_outages_are_transient() {
        let failure = ExecutionFailure::from(ArtifactError::Unavailable("timeout".into()));
        assert!(failure.retryable);
    }
}
