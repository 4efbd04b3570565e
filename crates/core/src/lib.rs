//! `fetchq-core`: job lifecycle building blocks.
//!
//! This crate contains the **pure** job model (no store, queue or transport
//! concerns): identifiers, the Job Record and its state machine, the events
//! broadcast to observers, and the error taxonomy shared by the other crates.

pub mod error;
pub mod event;
pub mod id;
pub mod job;

pub use error::{DomainResult, JobError};
pub use event::{JobEvent, JobEventKind};
pub use id::{JobId, OwnerId, SubjectId};
pub use job::{JobRecord, JobState, Transition, MAX_IN_FLIGHT_PROGRESS};
