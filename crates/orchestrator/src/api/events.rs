//! `POST /events/stream_started`, `POST /events/stream_ended` (spec §6,
//! §4.10, bearer-authenticated).

use crate::state::AppState;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::post;
use axum::Router;
use orchestrator_core::state::{Stream, StreamEndedEvent, StreamStartedEvent};
use serde::Deserialize;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/events/stream_started", post(stream_started))
        .route("/events/stream_ended", post(stream_ended))
}

#[derive(Debug, Deserialize)]
pub struct StreamStartedRequest {
    pub content_key: String,
    #[serde(default)]
    pub key_type: String,
    pub playback_session_id: Option<String>,
    pub container_key: String,
    pub engine_host: String,
    pub engine_port: u16,
    #[serde(default)]
    pub stat_url: String,
    #[serde(default)]
    pub command_url: String,
    #[serde(default)]
    pub is_live: bool,
}

impl From<StreamStartedRequest> for StreamStartedEvent {
    fn from(r: StreamStartedRequest) -> Self {
        Self {
            content_key: r.content_key,
            key_type: r.key_type,
            playback_session_id: r.playback_session_id,
            container_key: r.container_key,
            engine_host: r.engine_host,
            engine_port: r.engine_port,
            stat_url: r.stat_url,
            command_url: r.command_url,
            is_live: r.is_live,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct StreamEndedRequest {
    pub content_key: String,
    pub playback_session_id: Option<String>,
    pub reason: Option<String>,
}

impl From<StreamEndedRequest> for StreamEndedEvent {
    fn from(r: StreamEndedRequest) -> Self {
        Self { content_key: r.content_key, playback_session_id: r.playback_session_id, reason: r.reason }
    }
}

async fn stream_started(State(state): State<AppState>, Json(body): Json<StreamStartedRequest>) -> Json<Stream> {
    let stream = state.ctx.events.stream_started(body.into()).await;
    Json(stream)
}

async fn stream_ended(State(state): State<AppState>, Json(body): Json<StreamEndedRequest>) -> StatusCode {
    state.ctx.events.stream_ended(body.into()).await;
    StatusCode::NO_CONTENT
}
