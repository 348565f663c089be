mod api;
mod auth;
mod config;
mod error;
mod metrics;
mod state;

use anyhow::{Context as _, Result};
use axum::http::{header, Method, StatusCode};
use axum::middleware;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use serde_json::json;
use std::net::SocketAddr;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::{LogFormat, OrchestratorConfig};
use crate::state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    // Phase 1: basic tracing so config loading itself is observable.
    let _basic_tracing = init_tracing_basic();

    info!("starting AceStream engine pool orchestrator v{}", env!("CARGO_PKG_VERSION"));

    let config = OrchestratorConfig::load().context("failed to load configuration")?;
    config.validate().context("configuration validation failed")?;

    // Phase 2: re-initialize tracing from the loaded config (level/format).
    drop(_basic_tracing);
    init_tracing_from_config(&config);

    info!("configuration loaded; server will bind to {}", config.server.bind_address);

    let state = AppState::new(config.clone()).context("failed to construct application state")?;

    // Run the first reconcile pass synchronously (spec §4.9 "first reconcile
    // completed" flag) before spawning the periodic loops, so `GET /engines`
    // and the autoscaler never act on an empty state store during boot.
    state.initialize().await.context("failed to run initial reconciliation / spawn control loops")?;

    let app = build_router(state.clone());

    let addr: SocketAddr = config.server.bind_address.parse().context("invalid server.bind_address")?;
    let listener = tokio::net::TcpListener::bind(&addr).await.context("failed to bind to address")?;

    info!("listening on http://{addr}");
    info!("  - stream endpoint: http://{addr}/ace/getstream?id=<content_key>");
    info!("  - status endpoint: http://{addr}/orchestrator/status");
    info!("  - metrics endpoint: http://{addr}/metrics");

    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await.context("server error")?;

    // Shutdown ordering (spec §5/§9): broadcasters stop before the runtime
    // adapter would be dropped; the control loops are signalled last.
    state.shutdown().await;
    info!("orchestrator shut down gracefully");

    Ok(())
}

/// Builds the full route table: public reads, bearer-gated writes, the
/// stream proxy, and `/metrics` — merged one router per concern (§6),
/// each module owning its own request/response shapes.
fn build_router(state: AppState) -> Router {
    let cors = if state.config.server.enable_cors {
        let origins = state
            .config
            .server
            .cors_origins
            .iter()
            .filter_map(|s| s.parse::<axum::http::HeaderValue>().ok())
            .collect::<Vec<_>>();
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
            .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
    } else {
        CorsLayer::new()
    };

    let request_timeout = Duration::from_secs(state.config.server.write_timeout_secs);

    // Bearer-authenticated write surface (spec §6: provision/events/scale/gc/containers/breaker-reset).
    let protected = Router::new()
        .merge(api::provision::router())
        .merge(api::events::router())
        .merge(api::scale::router())
        .merge(api::breaker::router())
        .layer(middleware::from_fn_with_state(state.clone(), auth::require_bearer_token));

    // Unauthenticated reads + the stream proxy, which must stay reachable
    // to ordinary clients without a bearer token.
    let public = Router::new()
        .merge(api::engines::router())
        .merge(api::streams::router())
        .merge(api::status::router())
        .merge(api::vpn::router())
        .merge(api::stream_proxy::router())
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/", get(root_handler));

    Router::new()
        .merge(public)
        .merge(protected)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(TimeoutLayer::with_status_code(StatusCode::REQUEST_TIMEOUT, request_timeout))
                .layer(cors),
        )
        .with_state(state)
}

async fn root_handler() -> Json<serde_json::Value> {
    Json(json!({
        "name": "acestream-orchestrator",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "provision": "POST /provision/acestream",
            "events": ["POST /events/stream_started", "POST /events/stream_ended"],
            "engines": "GET /engines",
            "streams": "GET /streams",
            "status": "GET /orchestrator/status",
            "vpn": "GET /vpn/status",
            "scale": "POST /scale/{n}",
            "gc": "POST /gc",
            "stream": "GET /ace/getstream?id=<content_key>",
            "metrics": "GET /metrics",
        }
    }))
}

/// Liveness probe. Deliberately does not consult reconciler/VPN state —
/// that distinction belongs to `/orchestrator/status` (spec §7); `/health`
/// only answers "is the process responsive".
async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({"status": "healthy"})))
}

async fn metrics_handler(axum::extract::State(state): axum::extract::State<AppState>) -> impl IntoResponse {
    match state.metrics.render(&state.ctx) {
        Ok(body) => axum::http::Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "text/plain; version=0.0.4")
            .body(axum::body::Body::from(body))
            .expect("static headers always produce a valid response")
            .into_response(),
        Err(err) => {
            tracing::error!(error = %err, "failed to render prometheus metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

fn init_tracing_basic() -> tracing::subscriber::DefaultGuard {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,orchestrator=debug"));
    let subscriber = fmt().with_env_filter(filter).with_target(true).finish();
    tracing::subscriber::set_default(subscriber)
}

fn init_tracing_from_config(config: &OrchestratorConfig) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    match &config.logging.format {
        LogFormat::Json => {
            let layer = fmt::layer().json().with_target(true).with_thread_ids(true);
            tracing_subscriber::registry().with(filter).with(layer).init();
        }
        LogFormat::Pretty => {
            let layer = fmt::layer().with_target(true);
            tracing_subscriber::registry().with(filter).with(layer).init();
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install sigterm handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::warn!("received ctrl-c, shutting down"),
        _ = terminate => tracing::warn!("received sigterm, shutting down"),
    }
}
