use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    Json,
};

use fetchq_core::{JobId, SubjectId};

use crate::app::services::AppServices;
use crate::app::{dto, errors};
use crate::context::OwnerContext;

/// POST /jobs
///
/// `202` for a new job, `200` when the dedup token replays an earlier one.
pub async fn create_job(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(owner): Extension<OwnerContext>,
    Json(body): Json<dto::CreateJobRequest>,
) -> axum::response::Response {
    let subject = match SubjectId::new(body.subject_id) {
        Ok(subject) => subject,
        Err(e) => return errors::json_error(StatusCode::BAD_REQUEST, "invalid_subject", e.to_string()),
    };

    let created = match services
        .orchestrator
        .create_job(subject, owner.owner_id().clone(), body.dedup_token.as_deref())
        .await
    {
        Ok(created) => created,
        Err(e) => return errors::orchestrator_error_to_response(e),
    };

    let status = if created.is_new {
        StatusCode::ACCEPTED
    } else {
        StatusCode::OK
    };
    (status, Json(dto::CreateJobResponse::new(created.job_id, created.is_new))).into_response()
}

/// GET /jobs/:id
pub async fn get_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let Ok(job_id) = id.parse::<JobId>() else {
        return errors::not_found();
    };

    match services.orchestrator.get_job(job_id).await {
        Ok(record) => Json(record).into_response(),
        Err(e) => errors::orchestrator_error_to_response(e),
    }
}
