//! `GET /orchestrator/status` (spec §6/§7): composite health aggregation.

use crate::state::AppState;
use axum::extract::State;
use axum::response::Json;
use axum::routing::get;
use axum::Router;
use orchestrator_core::breaker::{BreakerState, OperationClass};
use orchestrator_core::state::{EngineFilter, HealthStatus};
use orchestrator_core::vpn::VpnHealth;
use serde::Serialize;

pub fn router() -> Router<AppState> {
    Router::new().route("/orchestrator/status", get(status))
}

/// Consecutive reconciler failures before the pool is reported
/// `unavailable` rather than merely `degraded` (spec §7: "runtime
/// unreachable for > N consecutive ticks"). Not itself config: it reflects
/// how quickly we want to surface a flapping runtime connection to callers.
const UNAVAILABLE_AFTER_CONSECUTIVE_FAILURES: u32 = 3;

#[derive(Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Overall {
    Healthy,
    Degraded,
    Unavailable,
}

#[derive(Debug, Serialize)]
pub struct EngineCounts {
    pub total: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    pub unknown: usize,
}

#[derive(Debug, Serialize)]
pub struct ProvisioningStatus {
    pub can_provision: bool,
    pub blocked_reason_details: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub overall: Overall,
    pub engines: EngineCounts,
    pub vpn: Vec<orchestrator_core::vpn::VpnStatus>,
    pub circuit_breaker: CircuitBreakerStatus,
    pub provisioning: ProvisioningStatus,
}

#[derive(Debug, Serialize)]
pub struct CircuitBreakerStatus {
    pub general_provisioning: BreakerState,
    pub replacement_provisioning: BreakerState,
}

async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    let ctx = &state.ctx;

    let engines = ctx.state.list_engines(&EngineFilter::default());
    let counts = EngineCounts {
        total: engines.len(),
        healthy: engines.iter().filter(|e| e.health == HealthStatus::Healthy).count(),
        unhealthy: engines.iter().filter(|e| e.health == HealthStatus::Unhealthy).count(),
        unknown: engines.iter().filter(|e| e.health == HealthStatus::Unknown).count(),
    };

    let vpn_statuses = ctx.vpn.all_statuses();
    let general = ctx.breaker.state(OperationClass::GeneralProvisioning);
    let replacement = ctx.breaker.state(OperationClass::ReplacementProvisioning);

    let at_capacity = counts.total > 0 && counts.healthy == 0 && counts.total >= ctx.config.autoscaler.max_replicas;
    let any_vpn_down = vpn_statuses.iter().any(|s| s.health != VpnHealth::Healthy);
    let half_open = general == BreakerState::HalfOpen || replacement == BreakerState::HalfOpen;

    let mut blocked_reason_details = Vec::new();
    if general == BreakerState::Open {
        blocked_reason_details.push("general provisioning circuit breaker open".to_string());
    }
    if replacement == BreakerState::Open {
        blocked_reason_details.push("replacement provisioning circuit breaker open".to_string());
    }
    if ctx.vpn.is_enabled() && !ctx.vpn.any_healthy() {
        blocked_reason_details.push("no healthy vpn available".to_string());
    }
    if counts.total >= ctx.config.autoscaler.max_replicas {
        blocked_reason_details.push("max_replicas reached".to_string());
    }

    let can_provision = general != BreakerState::Open
        && replacement != BreakerState::Open
        && !(ctx.vpn.is_enabled() && !ctx.vpn.any_healthy())
        && counts.total < ctx.config.autoscaler.max_replicas;

    let unavailable = ctx.reconciler.consecutive_failures() > UNAVAILABLE_AFTER_CONSECUTIVE_FAILURES
        || (ctx.vpn.is_enabled() && ctx.vpn.all_unhealthy());

    let degraded = counts.unhealthy > 0 || any_vpn_down || half_open || at_capacity;

    let overall = if unavailable {
        Overall::Unavailable
    } else if degraded {
        Overall::Degraded
    } else {
        Overall::Healthy
    };

    Json(StatusResponse {
        overall,
        engines: counts,
        vpn: vpn_statuses,
        circuit_breaker: CircuitBreakerStatus { general_provisioning: general, replacement_provisioning: replacement },
        provisioning: ProvisioningStatus { can_provision, blocked_reason_details },
    })
}
