//! `GET /engines` (spec §6).

use crate::state::AppState;
use axum::extract::{Query, State};
use axum::response::Json;
use axum::routing::get;
use axum::Router;
use orchestrator_core::state::{Engine, EngineFilter, HealthStatus};
use serde::Deserialize;

pub fn router() -> Router<AppState> {
    Router::new().route("/engines", get(list_engines))
}

#[derive(Debug, Default, Deserialize)]
pub struct EnginesQuery {
    pub health: Option<HealthStatus>,
    pub vpn: Option<String>,
    pub forwarded: Option<bool>,
}

async fn list_engines(State(state): State<AppState>, Query(q): Query<EnginesQuery>) -> Json<Vec<Engine>> {
    let filter = EngineFilter { vpn: q.vpn.map(Some), health: q.health, forwarded: q.forwarded };
    Json(state.ctx.state.list_engines(&filter))
}
