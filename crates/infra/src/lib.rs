//! Infrastructure layer: shared store, work queue, artifact store, and the
//! orchestration services built on them.

pub mod artifacts;
pub mod config;
pub mod jobs;
pub mod queue;
pub mod store;
pub mod workers;
