//! Job execution: the worker pool and the default artifact handler.

pub mod artifact_fetch;
pub mod pool;

pub use artifact_fetch::ArtifactFetchHandler;
pub use pool::{ExecutionFailure, JobHandler, ProgressReporter, WorkerHandle, WorkerPool, WorkerStats};
