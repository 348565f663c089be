//! `GET /ace/getstream?id=<content_key>` (spec §4.12, §6): the multiplexed
//! MPEG-TS endpoint. This is the one route that drives C12/C13 directly
//! rather than going through an event handler — `get_or_create_session`
//! picks the engine (C13), emits `stream_started` (C10) and starts the
//! broadcaster (C12) the first time a content key is requested; every
//! later request for the same key just joins the existing broadcaster.

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{header, Response, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures::StreamExt;
use orchestrator_core::error::OrchestratorError;
use serde::Deserialize;

pub fn router() -> Router<AppState> {
    Router::new().route("/ace/getstream", get(get_stream))
}

#[derive(Debug, Deserialize)]
pub struct GetStreamQuery {
    id: String,
    #[serde(default = "default_key_type")]
    key_type: String,
}

fn default_key_type() -> String {
    "infohash".to_string()
}

/// Joining a broadcaster never blocks on the first chunk here — that wait
/// (spec §4.12 "client join contract") happens inside `stream_data`'s
/// consumer loop, as part of the body stream itself, so a slow upstream
/// doesn't hold this handler (and its connection slot) open.
async fn get_stream(State(state): State<AppState>, Query(q): Query<GetStreamQuery>) -> ApiResult<impl IntoResponse> {
    if q.id.trim().is_empty() {
        return Err(ApiError(OrchestratorError::InvalidConfig("id query parameter is required".into())));
    }

    let broadcaster = state.ctx.multiplexer.get_or_create_session(&q.id, &q.key_type).await?;
    let body = Body::from_stream(broadcaster.stream_data().map(|r| r.map_err(std::io::Error::other)));

    let response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "video/mp2t")
        .body(body)
        .expect("static headers always produce a valid response");

    Ok(response)
}
