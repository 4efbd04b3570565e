//! Process configuration, read once from the environment at start-up.
//!
//! Unset variables fall back to defaults; unparsable ones are logged and
//! also fall back, so a typo never prevents the process from starting.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

/// Limits and retention applied by the orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Non-terminal jobs one owner may hold at once.
    pub max_concurrent_per_owner: u32,
    /// Lifetime of Job Records and idempotency entries.
    pub retention: Duration,
    /// Hint returned with `RateLimited`.
    pub rate_limit_retry_after: Duration,
    /// Attempts after which the watchdog stops re-enqueuing a job.
    pub max_attempts: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_per_owner: 3,
            retention: Duration::from_secs(24 * 60 * 60),
            rate_limit_retry_after: Duration::from_secs(30),
            max_attempts: 3,
        }
    }
}

impl OrchestratorConfig {
    pub fn with_max_concurrent_per_owner(mut self, max: u32) -> Self {
        self.max_concurrent_per_owner = max;
        self
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_rate_limit_retry_after(mut self, retry_after: Duration) -> Self {
        self.rate_limit_retry_after = retry_after;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }
}

#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    pub interval: Duration,
    /// Processing longer than this counts as stuck.
    pub stuck_threshold: Duration,
    /// How long an orphan artifact stays flagged before deletion.
    pub orphan_grace: Duration,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5 * 60),
            stuck_threshold: Duration::from_secs(10 * 60),
            orphan_grace: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

impl WatchdogConfig {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_stuck_threshold(mut self, threshold: Duration) -> Self {
        self.stuck_threshold = threshold;
        self
    }

    pub fn with_orphan_grace(mut self, grace: Duration) -> Self {
        self.orphan_grace = grace;
        self
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Name for logging
    pub name: String,
    /// Jobs executed concurrently by this process
    pub concurrency: usize,
    /// Progress messages buffered between a handler and the orchestrator
    pub progress_buffer: usize,
    /// Lifetime of issued retrieval URLs
    pub presign_ttl: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "fetchq-worker".to_string(),
            concurrency: 4,
            progress_buffer: 16,
            presign_ttl: Duration::from_secs(60 * 60),
        }
    }
}

impl WorkerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_presign_ttl(mut self, ttl: Duration) -> Self {
        self.presign_ttl = ttl;
        self
    }
}

/// Event-stream (SSE) settings.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub keepalive: Duration,
    pub subscription_idle: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            keepalive: Duration::from_secs(15),
            subscription_idle: Duration::from_secs(30 * 60),
        }
    }
}

impl StreamConfig {
    pub fn with_keepalive(mut self, keepalive: Duration) -> Self {
        self.keepalive = keepalive;
        self
    }

    pub fn with_subscription_idle(mut self, idle: Duration) -> Self {
        self.subscription_idle = idle;
        self
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Unset means in-memory store and queue.
    pub redis_url: Option<String>,
    pub bind_addr: SocketAddr,
    pub orchestrator: OrchestratorConfig,
    pub watchdog: WatchdogConfig,
    pub worker: WorkerConfig,
    pub stream: StreamConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            orchestrator: OrchestratorConfig::default(),
            watchdog: WatchdogConfig::default(),
            worker: WorkerConfig::default(),
            stream: StreamConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source (tests pass a map).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        let env = Env { lookup: &lookup };

        Self {
            redis_url: env.raw("FETCHQ_REDIS_URL"),
            bind_addr: env.parse("FETCHQ_BIND_ADDR", d.bind_addr),
            orchestrator: OrchestratorConfig {
                max_concurrent_per_owner: env
                    .parse("FETCHQ_MAX_CONCURRENT_PER_OWNER", d.orchestrator.max_concurrent_per_owner),
                retention: env.secs("FETCHQ_RETENTION_SECS", d.orchestrator.retention),
                rate_limit_retry_after: env
                    .secs("FETCHQ_RATE_LIMIT_RETRY_AFTER_SECS", d.orchestrator.rate_limit_retry_after),
                max_attempts: env.parse("FETCHQ_MAX_ATTEMPTS", d.orchestrator.max_attempts),
            },
            watchdog: WatchdogConfig {
                interval: env.secs("FETCHQ_WATCHDOG_INTERVAL_SECS", d.watchdog.interval),
                stuck_threshold: env.secs("FETCHQ_STUCK_THRESHOLD_SECS", d.watchdog.stuck_threshold),
                orphan_grace: env.secs("FETCHQ_ORPHAN_GRACE_SECS", d.watchdog.orphan_grace),
            },
            worker: WorkerConfig {
                concurrency: env.parse("FETCHQ_WORKER_CONCURRENCY", d.worker.concurrency).max(1),
                presign_ttl: env.secs("FETCHQ_PRESIGN_TTL_SECS", d.worker.presign_ttl),
                ..d.worker
            },
            stream: StreamConfig {
                keepalive: env.secs("FETCHQ_SSE_KEEPALIVE_SECS", d.stream.keepalive),
                subscription_idle: env.secs("FETCHQ_SUBSCRIPTION_IDLE_SECS", d.stream.subscription_idle),
            },
        }
    }
}

struct Env<'a, F: Fn(&str) -> Option<String>> {
    lookup: &'a F,
}

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    fn raw(&self, name: &str) -> Option<String> {
        (self.lookup)(name)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, name: &str, default: T) -> T
    where
        T: FromStr + std::fmt::Debug,
        T::Err: std::fmt::Display,
    {
        let Some(raw) = self.raw(name) else {
            return default;
        };
        match raw.parse() {
            Ok(value) => value,
            Err(e) => {
                warn!(var = name, value = %raw, error = %e, ?default, "invalid value; using default");
                default
            }
        }
    }

    fn secs(&self, name: &str, default: Duration) -> Duration {
        Duration::from_secs(self.parse(name, default.as_secs()))
    }
}
