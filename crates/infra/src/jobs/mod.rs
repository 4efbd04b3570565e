//! Job orchestration over the shared store.
//!
//! ## Components
//!
//! - `JobOrchestrator`: creates jobs and applies every state transition
//! - `IdempotencyIndex`: dedup token → job id
//! - `ConcurrencyLimiter`: per-owner in-flight counter
//! - `ProcessingSet`: running jobs ordered by start time
//! - `ProgressBroadcaster`: per-job live event channel
//! - `Watchdog`: stuck-job recovery and drift reconciliation

pub mod broadcast;
pub mod idempotency;
pub mod keys;
pub mod limiter;
pub mod orchestrator;
pub mod processing;
pub mod watchdog;

pub use broadcast::{ProgressBroadcaster, Subscription};
pub use idempotency::IdempotencyIndex;
pub use keys::Keys;
pub use limiter::ConcurrencyLimiter;
pub use orchestrator::{CreatedJob, JobOrchestrator, OrchestratorError};
pub use processing::ProcessingSet;
pub use watchdog::{SweepReport, Watchdog, WatchdogError, WatchdogHandle};
