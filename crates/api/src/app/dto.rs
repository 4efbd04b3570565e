use serde::{Deserialize, Serialize};

use fetchq_core::JobId;

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct CreateJobRequest {
    pub subject_id: String,
    /// Client-chosen token; repeating it returns the original job.
    #[serde(default)]
    pub dedup_token: Option<String>,
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize)]
pub struct CreateJobResponse {
    pub job_id: JobId,
    pub is_new: bool,
    pub status_url: String,
    pub events_url: String,
}

impl CreateJobResponse {
    pub fn new(job_id: JobId, is_new: bool) -> Self {
        Self {
            job_id,
            is_new,
            status_url: format!("/jobs/{job_id}"),
            events_url: format!("/jobs/{job_id}/events"),
        }
    }
}
