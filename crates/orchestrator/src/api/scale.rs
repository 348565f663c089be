//! `POST /scale/{n}`, `POST /gc`, `DELETE /containers/{id}` (spec §6,
//! bearer-authenticated).

use crate::error::ApiResult;
use crate::state::AppState;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{delete, post};
use axum::Router;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/scale/{n}", post(scale))
        .route("/gc", post(gc))
        .route("/containers/{id}", delete(remove_container))
}

async fn scale(State(state): State<AppState>, Path(n): Path<usize>) -> StatusCode {
    state.ctx.autoscaler.scale_to(n);
    StatusCode::ACCEPTED
}

/// Forces the idle-engine cleanup pass and the reconciler's orphan sweep
/// to run immediately, instead of waiting for their next tick.
async fn gc(State(state): State<AppState>) -> StatusCode {
    state.ctx.reconciler.tick().await;
    state.ctx.autoscaler.trigger_now();
    StatusCode::ACCEPTED
}

async fn remove_container(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<StatusCode> {
    state.ctx.provisioner.stop_and_remove(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}
