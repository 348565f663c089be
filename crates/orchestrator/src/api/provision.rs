//! `POST /provision/acestream` (spec §6, bearer-authenticated).

use crate::error::ApiResult;
use crate::state::AppState;
use axum::extract::State;
use axum::response::Json;
use axum::routing::post;
use axum::Router;
use orchestrator_core::provisioner::ProvisionRequest;
use serde::{Deserialize, Serialize};

pub fn router() -> Router<AppState> {
    Router::new().route("/provision/acestream", post(provision))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ProvisionApiRequest {
    /// Defaults to a generated `acestream-<uuid>` name, same as the autoscaler.
    pub name: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ProvisionApiResponse {
    pub container_id: String,
    pub container_name: String,
    pub host_http_port: u16,
    pub container_http_port: u16,
    pub container_https_port: Option<u16>,
}

async fn provision(
    State(state): State<AppState>,
    body: Option<Json<ProvisionApiRequest>>,
) -> ApiResult<Json<ProvisionApiResponse>> {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let name = body.name.unwrap_or_else(|| format!("acestream-{}", uuid::Uuid::new_v4()));

    let engine = state
        .ctx
        .provisioner
        .provision(ProvisionRequest {
            image: state.config.runtime.engine_image.clone(),
            name,
            vpn_container: None,
            vpn_index: None,
            forwarded: false,
            forwarded_port_env: None,
            replacement: false,
            extra_env: Vec::new(),
        })
        .await?;

    Ok(Json(ProvisionApiResponse {
        container_id: engine.container_key,
        container_name: engine.host,
        host_http_port: engine.external_port,
        container_http_port: engine.internal_http_port,
        container_https_port: engine.internal_https_port,
    }))
}
