//! `GET /vpn/status` (spec §6).

use crate::state::AppState;
use axum::extract::State;
use axum::response::Json;
use axum::routing::get;
use axum::Router;
use orchestrator_core::vpn::VpnStatus;

pub fn router() -> Router<AppState> {
    Router::new().route("/vpn/status", get(vpn_status))
}

async fn vpn_status(State(state): State<AppState>) -> Json<Vec<VpnStatus>> {
    Json(state.ctx.vpn.all_statuses())
}
