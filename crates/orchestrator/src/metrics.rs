//! Prometheus exposition for the control plane, grounded in the
//! `vpn-telemetry` crate's `MetricsCollector`: a registry plus a fixed set
//! of typed metrics built once at startup, refreshed on demand rather than
//! on a timer, and rendered through `prometheus::TextEncoder`.

use anyhow::Context as _;
use orchestrator_core::breaker::{BreakerState, OperationClass};
use orchestrator_core::state::{EngineFilter, HealthStatus, StreamFilter, StreamStatus};
use orchestrator_core::Context;
use prometheus::{Encoder, GaugeVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};

pub struct Metrics {
    registry: Registry,
    engines_by_health: IntGaugeVec,
    streams_by_status: IntGaugeVec,
    broadcaster_sessions: IntGauge,
    breaker_state: GaugeVec,
    reconciler_last_success_epoch_ms: IntGauge,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let engines_by_health = IntGaugeVec::new(
            Opts::new("orchestrator_engines", "Number of engines known to the pool, by health state").namespace("orchestrator"),
            &["health"],
        )
        .context("building orchestrator_engines metric")?;

        let streams_by_status = IntGaugeVec::new(
            Opts::new("orchestrator_streams", "Number of streams known to the pool, by status").namespace("orchestrator"),
            &["status"],
        )
        .context("building orchestrator_streams metric")?;

        let broadcaster_sessions = IntGauge::with_opts(
            Opts::new("orchestrator_broadcaster_sessions", "Active multiplexer broadcaster sessions").namespace("orchestrator"),
        )
        .context("building orchestrator_broadcaster_sessions metric")?;

        let breaker_state = GaugeVec::new(
            Opts::new("orchestrator_circuit_breaker_state", "Circuit breaker state per operation class (0=closed, 0.5=half_open, 1=open)")
                .namespace("orchestrator"),
            &["class"],
        )
        .context("building orchestrator_circuit_breaker_state metric")?;

        let reconciler_last_success_epoch_ms = IntGauge::with_opts(
            Opts::new("orchestrator_reconciler_last_success_epoch_ms", "Unix epoch ms of the last reconciler tick that reached the runtime")
                .namespace("orchestrator"),
        )
        .context("building orchestrator_reconciler_last_success_epoch_ms metric")?;

        registry.register(Box::new(engines_by_health.clone()))?;
        registry.register(Box::new(streams_by_status.clone()))?;
        registry.register(Box::new(broadcaster_sessions.clone()))?;
        registry.register(Box::new(breaker_state.clone()))?;
        registry.register(Box::new(reconciler_last_success_epoch_ms.clone()))?;

        Ok(Self {
            registry,
            engines_by_health,
            streams_by_status,
            broadcaster_sessions,
            breaker_state,
            reconciler_last_success_epoch_ms,
        })
    }

    /// Pulls current counts out of the context's state store. Called right
    /// before every `/metrics` scrape rather than on its own timer — there's
    /// nowhere cheaper to keep this in sync than the request that needs it.
    fn refresh(&self, ctx: &Context) {
        let engines = ctx.state.list_engines(&EngineFilter::default());
        let mut healthy = 0i64;
        let mut unhealthy = 0i64;
        let mut unknown = 0i64;
        for engine in &engines {
            match engine.health {
                HealthStatus::Healthy => healthy += 1,
                HealthStatus::Unhealthy => unhealthy += 1,
                HealthStatus::Unknown => unknown += 1,
            }
        }
        self.engines_by_health.with_label_values(&["healthy"]).set(healthy);
        self.engines_by_health.with_label_values(&["unhealthy"]).set(unhealthy);
        self.engines_by_health.with_label_values(&["unknown"]).set(unknown);

        let streams = ctx.state.list_streams(&StreamFilter::default());
        let mut started = 0i64;
        let mut ended = 0i64;
        for stream in &streams {
            match stream.status {
                StreamStatus::Started => started += 1,
                StreamStatus::Ended => ended += 1,
            }
        }
        self.streams_by_status.with_label_values(&["started"]).set(started);
        self.streams_by_status.with_label_values(&["ended"]).set(ended);

        self.broadcaster_sessions.set(ctx.multiplexer.list().len() as i64);

        self.breaker_state
            .with_label_values(&["general_provisioning"])
            .set(breaker_state_value(ctx.breaker.state(OperationClass::GeneralProvisioning)));
        self.breaker_state
            .with_label_values(&["replacement_provisioning"])
            .set(breaker_state_value(ctx.breaker.state(OperationClass::ReplacementProvisioning)));

        self.reconciler_last_success_epoch_ms.set(ctx.reconciler.last_success_epoch_ms());
    }

    /// Refreshes gauges from current state and renders the text exposition
    /// format for `GET /metrics`.
    pub fn render(&self, ctx: &Context) -> anyhow::Result<String> {
        self.refresh(ctx);
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        encoder.encode(&self.registry.gather(), &mut buf).context("encoding prometheus metrics")?;
        String::from_utf8(buf).context("prometheus output was not valid utf-8")
    }
}

fn breaker_state_value(state: BreakerState) -> f64 {
    match state {
        BreakerState::Closed => 0.0,
        BreakerState::HalfOpen => 0.5,
        BreakerState::Open => 1.0,
    }
}
