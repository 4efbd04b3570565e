use std::sync::Arc;

use axum::{extract::Extension, http::StatusCode, response::IntoResponse, Json};
use serde_json::json;
use tracing::warn;

use crate::app::errors;
use crate::app::services::AppServices;

/// GET /health
///
/// `200` with queue counts, `503` when the shared store is unreachable.
pub async fn health(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    if let Err(e) = services.orchestrator.ping().await {
        warn!(error = %e, "health check failed");
        return errors::json_error(StatusCode::SERVICE_UNAVAILABLE, "store_unavailable", e.to_string());
    }

    match services.orchestrator.queue_counts().await {
        Ok(counts) => Json(json!({
            "status": "ok",
            "backend": services.backend.as_str(),
            "queue": counts,
        }))
        .into_response(),
        Err(e) => errors::orchestrator_error_to_response(e),
    }
}
