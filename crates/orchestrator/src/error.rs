//! Maps `OrchestratorError` (core) onto the wire shape in §6/§7: internal
//! detail is logged via `tracing::error!`, only a generic message and a
//! structured code reach the client.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use orchestrator_core::error::OrchestratorError;
use serde_json::json;

#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub struct ApiError(#[from] pub OrchestratorError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let err = self.0;

        if let Some(code) = err.provisioning_code() {
            let recovery_eta_seconds = match &err {
                OrchestratorError::CircuitOpen { recovery_eta_secs } => *recovery_eta_secs,
                _ => 0,
            };
            let can_retry = !matches!(err, OrchestratorError::CircuitOpen { .. });
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "code": code.as_str(),
                    "message": err.to_string(),
                    "recovery_eta_seconds": recovery_eta_seconds,
                    "can_retry": can_retry,
                    "should_wait": true,
                })),
            )
                .into_response();
        }

        match &err {
            OrchestratorError::ContainerNotFound(_) | OrchestratorError::StreamNotFound(_) => {
                (StatusCode::NOT_FOUND, Json(json!({"code": "not_found", "message": err.to_string()}))).into_response()
            }
            OrchestratorError::InvalidConfig(_) => {
                (StatusCode::BAD_REQUEST, Json(json!({"code": "bad_request", "message": err.to_string()}))).into_response()
            }
            OrchestratorError::UpstreamFetchFailed(_) => {
                tracing::error!(error = %err, "upstream fetch failed");
                (StatusCode::BAD_GATEWAY, Json(json!({"code": "upstream_fetch_failed", "message": "upstream engine fetch failed"})))
                    .into_response()
            }
            _ => {
                tracing::error!(error = %err, "internal error");
                (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"code": "internal_error", "message": "an internal error occurred"})))
                    .into_response()
            }
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
