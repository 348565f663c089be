//! `GET /streams`, `GET /streams/{id}/stats` (spec §6).

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use axum::extract::{Path, Query, State};
use axum::response::Json;
use axum::routing::get;
use axum::Router;
use orchestrator_core::error::OrchestratorError;
use orchestrator_core::state::{StatSnapshot, Stream, StreamFilter, StreamStatus};
use serde::Deserialize;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/streams", get(list_streams))
        .route("/streams/{id}/stats", get(stream_stats))
}

#[derive(Debug, Default, Deserialize)]
pub struct StreamsQuery {
    pub status: Option<StreamStatus>,
    pub container_id: Option<String>,
}

async fn list_streams(State(state): State<AppState>, Query(q): Query<StreamsQuery>) -> Json<Vec<Stream>> {
    let filter = StreamFilter { status: q.status, container_key: q.container_id };
    Json(state.ctx.state.list_streams(&filter))
}

#[derive(Debug, Default, Deserialize)]
pub struct StatsQuery {
    pub since: Option<i64>,
}

async fn stream_stats(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<StatsQuery>,
) -> ApiResult<Json<Vec<StatSnapshot>>> {
    let stream = state.ctx.state.get_stream(&id).ok_or_else(|| ApiError(OrchestratorError::StreamNotFound(id.clone())))?;
    let since = q.since.unwrap_or(0);
    Ok(Json(stream.stats.into_iter().filter(|s| s.at_ms >= since).collect()))
}
