use axum::{
    routing::{get, post},
    Router,
};

pub mod events;
pub mod jobs;
pub mod system;

/// Router for all owner-scoped endpoints.
pub fn router() -> Router {
    Router::new()
        .route("/jobs", post(jobs::create_job))
        .route("/jobs/:id", get(jobs::get_job))
        .route("/jobs/:id/events", get(events::stream_job_events))
}
