//! `POST /circuit-breaker/{class}/reset` (spec §4.6: "Manual reset is an
//! administrative action"; supplemented as a bearer-authenticated endpoint
//! since the distilled spec interfaces the capability without wiring it).

use crate::error::ApiError;
use crate::state::AppState;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::post;
use axum::Router;
use orchestrator_core::breaker::OperationClass;
use orchestrator_core::error::OrchestratorError;

pub fn router() -> Router<AppState> {
    Router::new().route("/circuit-breaker/{class}/reset", post(reset))
}

async fn reset(State(state): State<AppState>, Path(class): Path<String>) -> Result<StatusCode, ApiError> {
    let class = match class.as_str() {
        "general_provisioning" => OperationClass::GeneralProvisioning,
        "replacement_provisioning" => OperationClass::ReplacementProvisioning,
        other => return Err(ApiError(OrchestratorError::InvalidConfig(format!("unknown circuit breaker class: {other}")))),
    };
    state.ctx.breaker.reset(class);
    Ok(StatusCode::NO_CONTENT)
}
