//! Infrastructure wiring: picks the store/queue backend from config and
//! builds the orchestrator, worker pool and watchdog on top of it.

use std::sync::Arc;

use fetchq_infra::{
    artifacts::{ArtifactStore, InMemoryArtifactStore},
    config::{AppConfig, StreamConfig},
    jobs::{JobOrchestrator, Watchdog, WatchdogHandle},
    queue::{InMemoryWorkQueue, RetryPolicy, WorkQueue, WorkSource},
    store::{InMemoryStore, SharedStore},
    workers::{ArtifactFetchHandler, WorkerHandle, WorkerPool},
};
use tracing::info;

#[cfg(feature = "redis")]
use fetchq_infra::{jobs::keys::DEFAULT_NAMESPACE, queue::RedisStreamsWorkQueue, store::RedisStore};

/// Which backend the services run on (reported by `/health`).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Backend {
    InMemory,
    Redis,
}

impl Backend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::InMemory => "in_memory",
            Backend::Redis => "redis",
        }
    }
}

/// Services shared by all request handlers.
#[derive(Debug)]
pub struct AppServices {
    pub orchestrator: JobOrchestrator,
    pub stream: StreamConfig,
    pub backend: Backend,
}

/// Everything needed to serve requests and run jobs in this process.
pub struct ServiceStack {
    pub services: Arc<AppServices>,
    source: Arc<dyn WorkSource>,
    artifacts: Arc<dyn ArtifactStore>,
}

impl ServiceStack {
    /// Start the worker pool and the watchdog.
    pub fn start_background(&self, config: &AppConfig) -> Background {
        let orchestrator = self.services.orchestrator.clone();
        let handler = Arc::new(ArtifactFetchHandler::new(
            self.artifacts.clone(),
            config.worker.presign_ttl,
        ));

        let workers = WorkerPool::spawn(
            config.worker.clone(),
            self.source.clone(),
            orchestrator.clone(),
            handler,
        );
        let watchdog = Watchdog::new(orchestrator, self.artifacts.clone(), config.watchdog.clone()).spawn();

        Background { workers, watchdog }
    }
}

/// Running background tasks.
#[derive(Debug)]
pub struct Background {
    workers: WorkerHandle,
    watchdog: WatchdogHandle,
}

impl Background {
    pub async fn shutdown(self) {
        self.watchdog.shutdown().await;
        let stats = self.workers.shutdown().await;
        info!(
            processed = stats.jobs_processed,
            succeeded = stats.jobs_succeeded,
            failed = stats.jobs_failed,
            "background tasks stopped"
        );
    }
}

/// Build services from config: Redis when `redis_url` is set, in-memory otherwise.
///
/// The artifact store is always an empty [`InMemoryArtifactStore`]. Nothing
/// in this binary fills it, so every fetch fails with "not found" until an
/// embedding caller passes its own store to [`in_memory`].
pub async fn build_services(config: &AppConfig) -> anyhow::Result<ServiceStack> {
    let artifacts: Arc<dyn ArtifactStore> = Arc::new(InMemoryArtifactStore::default());

    match &config.redis_url {
        None => {
            info!("using in-memory store and queue");
            Ok(in_memory(config, artifacts))
        }
        #[cfg(feature = "redis")]
        Some(url) => redis(config, url, artifacts).await,
        #[cfg(not(feature = "redis"))]
        Some(_) => anyhow::bail!("FETCHQ_REDIS_URL is set but the `redis` feature is not enabled"),
    }
}

/// In-memory stack (single process; state is lost on restart).
pub fn in_memory(config: &AppConfig, artifacts: Arc<dyn ArtifactStore>) -> ServiceStack {
    let store: Arc<dyn SharedStore> = InMemoryStore::arc();
    let queue = Arc::new(InMemoryWorkQueue::new(retry_policy(config)));

    assemble(config, store, queue.clone(), queue, artifacts, Backend::InMemory)
}

#[cfg(feature = "redis")]
async fn redis(config: &AppConfig, url: &str, artifacts: Arc<dyn ArtifactStore>) -> anyhow::Result<ServiceStack> {
    use anyhow::Context;

    let store = RedisStore::connect(url)
        .await
        .with_context(|| format!("failed to connect to redis at {url}"))?;
    let queue = Arc::new(
        RedisStreamsWorkQueue::new(store.connection(), DEFAULT_NAMESPACE, retry_policy(config))
            .await
            .context("failed to prepare the work queue")?,
    );
    info!("using redis store and queue");

    Ok(assemble(config, Arc::new(store), queue.clone(), queue, artifacts, Backend::Redis))
}

fn retry_policy(config: &AppConfig) -> RetryPolicy {
    RetryPolicy {
        max_attempts: config.orchestrator.max_attempts,
        ..RetryPolicy::default()
    }
}

fn assemble(
    config: &AppConfig,
    store: Arc<dyn SharedStore>,
    queue: Arc<dyn WorkQueue>,
    source: Arc<dyn WorkSource>,
    artifacts: Arc<dyn ArtifactStore>,
    backend: Backend,
) -> ServiceStack {
    let orchestrator = JobOrchestrator::new(store, queue, config.orchestrator.clone())
        .with_subscription_idle(config.stream.subscription_idle);

    ServiceStack {
        services: Arc::new(AppServices {
            orchestrator,
            stream: config.stream.clone(),
            backend,
        }),
        source,
        artifacts,
    }
}
