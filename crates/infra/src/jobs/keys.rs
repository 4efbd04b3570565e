//! Store key layout.
//!
//! Every key is namespaced under a configurable prefix so several deployments
//! can share one store.

use fetchq_core::{JobId, OwnerId};

pub const DEFAULT_NAMESPACE: &str = "fetchq";

#[derive(Debug, Clone)]
pub struct Keys {
    namespace: String,
}

impl Default for Keys {
    fn default() -> Self {
        Self::new(DEFAULT_NAMESPACE)
    }
}

impl Keys {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    /// Hash holding one Job Record.
    pub fn job(&self, id: JobId) -> String {
        format!("{}:job:{}", self.namespace, id)
    }

    /// Prefix shared by all Job Record keys (for sweeps).
    pub fn job_prefix(&self) -> String {
        format!("{}:job:", self.namespace)
    }

    pub fn idempotency(&self, token: &str) -> String {
        format!("{}:idem:{}", self.namespace, token)
    }

    pub fn active_count(&self, owner: &OwnerId) -> String {
        format!("{}:active:{}", self.namespace, owner)
    }

    /// Sorted set of job ids scored by processing-start time (ms).
    pub fn processing(&self) -> String {
        format!("{}:processing", self.namespace)
    }

    /// Sorted set of orphan artifact subjects scored by first-seen time (ms).
    pub fn orphans(&self) -> String {
        format!("{}:orphans", self.namespace)
    }

    /// Pub/sub channel for one job's events.
    pub fn events(&self, id: JobId) -> String {
        format!("{}:events:{}", self.namespace, id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_keys_share_the_sweep_prefix() {
        let keys = Keys::default();
        let id = JobId::new();
        assert!(keys.job(id).starts_with(&keys.job_prefix()));
        assert_eq!(keys.job(id), format!("fetchq:job:{id}"));
    }
}
