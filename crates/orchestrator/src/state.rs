use crate::config::OrchestratorConfig;
use crate::metrics::Metrics;
use orchestrator_core::runtime::{DockerRuntime, FakeRuntime, Runtime};
use orchestrator_core::Context;
use std::sync::Arc;
use tracing::info;

/// Shared application state. Thin wrapper around `orchestrator_core::Context`
/// plus the Prometheus registry, which is an API-shell concern the core
/// crate has no reason to know about.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<OrchestratorConfig>,
    pub ctx: Arc<Context>,
    pub metrics: Arc<Metrics>,
}

impl AppState {
    pub fn new(config: OrchestratorConfig) -> anyhow::Result<Self> {
        let runtime: Arc<dyn Runtime> = if config.runtime.fake {
            info!("using FakeRuntime (runtime.fake = true)");
            Arc::new(FakeRuntime::new())
        } else {
            Arc::new(DockerRuntime::new(&config.runtime.docker_socket)?)
        };

        let ctx = Context::new(config.to_core_config(), runtime, config.runtime.engine_image.clone());
        let metrics = Arc::new(Metrics::new()?);

        Ok(Self { config: Arc::new(config), ctx, metrics })
    }

    /// Runs the first reconcile pass synchronously so `GET /engines` never
    /// races an empty state store right after startup, then spawns every
    /// periodic loop (spec §9: context owns the lifecycle).
    pub async fn initialize(&self) -> anyhow::Result<()> {
        info!("running initial reconciliation pass");
        self.ctx.reconciler.tick().await;
        self.ctx.spawn_all();
        info!("control plane loops started");
        Ok(())
    }

    pub async fn shutdown(&self) {
        self.ctx.shutdown().await;
    }
}
