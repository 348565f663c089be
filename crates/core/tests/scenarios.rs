//! End-to-end scenario tests (spec §8 "concrete end-to-end scenarios").
//! Each test drives the real component APIs directly (ticks, event
//! handlers) rather than live timers, using `FakeRuntime` so no Docker
//! daemon is required. S3 (VPN port change) and S6 (replacement preserves
//! availability) are covered as focused unit tests alongside
//! `autoscaler.rs`, where the fixtures they need already live.

use orchestrator_core::breaker::OperationClass;
use orchestrator_core::config::{AutoscalerConfig, CoreConfig};
use orchestrator_core::context::Context;
use orchestrator_core::ports::Scope;
use orchestrator_core::provisioner::ProvisionRequest;
use orchestrator_core::runtime::fake::FakeRuntime;
use orchestrator_core::state::{EngineFilter, HealthStatus, StreamEndedEvent, StreamStartedEvent};
use std::sync::Arc;
use std::time::Duration;

fn runtime() -> Arc<FakeRuntime> {
    Arc::new(FakeRuntime::new())
}

/// S1. Cold start, one stream: the autoscaler brings the pool up to
/// `MIN_FREE_REPLICAS`, a stream is attached and released, and once the
/// (here, zeroed-out) grace period elapses the idle engine is stopped and
/// its ports are released.
#[tokio::test]
async fn s1_cold_start_one_stream_then_idle_cleanup() {
    let mut config = CoreConfig::default();
    config.autoscaler = AutoscalerConfig {
        min_free_replicas: 1,
        max_replicas: 5,
        max_streams_per_engine: 2,
        min_provision_interval: Duration::from_millis(0),
        engine_grace_period: Duration::from_millis(0),
        ..Default::default()
    };

    let ctx = Context::new(config, runtime(), "acestream".into());

    ctx.autoscaler.tick().await;
    let engines = ctx.state.list_engines(&EngineFilter::default());
    assert_eq!(engines.len(), 1, "autoscaler provisions to MIN_FREE_REPLICAS on first tick");
    let engine = &engines[0];

    // Reconciler/health-monitor stand-ins: a real deployment would flip
    // these once the container reports running and passes its probe.
    ctx.state.set_starting(&engine.container_key, false);
    ctx.state.set_health(&engine.container_key, HealthStatus::Healthy);

    let selection = ctx.selector.select().expect("one healthy engine available");
    assert_eq!(selection.container_key, engine.container_key);

    let stream = ctx
        .events
        .stream_started(StreamStartedEvent {
            content_key: "AAA".into(),
            key_type: "infohash".into(),
            container_key: selection.container_key.clone(),
            engine_host: selection.host.clone(),
            engine_port: selection.port,
            stat_url: "http://engine/stat".into(),
            command_url: "http://engine/cmd".into(),
            ..Default::default()
        })
        .await;

    let busy = ctx.state.get_engine(&engine.container_key).unwrap();
    assert!(busy.active_streams.contains(&stream.id));
    assert_eq!(busy.active_streams.len(), 1);

    ctx.events
        .stream_ended(StreamEndedEvent { content_key: "AAA".into(), playback_session_id: Some(stream.playback_session_id.clone()), reason: None })
        .await;

    let idle = ctx.state.get_engine(&engine.container_key).unwrap();
    assert!(idle.is_idle(), "engine has no more active streams after stream_ended");

    // Grace period is zeroed, so the next tick stops the now-idle engine.
    ctx.autoscaler.tick().await;
    assert!(ctx.state.get_engine(&engine.container_key).is_none(), "idle engine stopped after grace period");
    assert!(!ctx.ports.is_in_use(Scope::Host, engine.external_port), "host port released on stop");
    assert!(!ctx.ports.is_in_use(Scope::InternalHttp, engine.internal_http_port), "internal port released on stop");
}

/// S4. Circuit breaker trip: three consecutive provisioning failures open
/// the breaker; a fourth call is rejected with `CircuitOpen` without ever
/// reaching the runtime; after `recovery_timeout` the breaker allows one
/// probe (half-open) and a success closes it again.
#[tokio::test]
async fn s4_circuit_breaker_trips_then_recovers() {
    let mut config = CoreConfig::default();
    config.breaker.general_failure_threshold = 3;
    config.breaker.recovery_timeout = Duration::from_millis(30);
    config.autoscaler.min_provision_interval = Duration::from_millis(0);

    let rt = runtime();
    let ctx = Context::new(config, rt.clone(), "acestream".into());
    rt.set_unavailable(true);

    let req = || ProvisionRequest {
        image: "acestream".into(),
        name: format!("e-{}", uuid::Uuid::new_v4()),
        vpn_container: None,
        vpn_index: None,
        forwarded: false,
        forwarded_port_env: None,
        replacement: false,
        extra_env: Vec::new(),
    };

    for _ in 0..3 {
        assert!(ctx.provisioner.provision(req()).await.is_err());
    }
    assert_eq!(ctx.breaker.state(OperationClass::GeneralProvisioning), orchestrator_core::breaker::BreakerState::Open);

    match ctx.provisioner.provision(req()).await {
        Err(orchestrator_core::OrchestratorError::CircuitOpen { recovery_eta_secs: _ }) => {}
        other => panic!("expected CircuitOpen, got {other:?}"),
    }

    tokio::time::sleep(Duration::from_millis(40)).await;
    rt.set_unavailable(false);

    let engine = ctx.provisioner.provision(req()).await.expect("half-open probe succeeds once runtime recovers");
    assert_eq!(ctx.breaker.state(OperationClass::GeneralProvisioning), orchestrator_core::breaker::BreakerState::Closed);
    assert!(ctx.state.get_engine(&engine.container_key).is_some());
}

/// S5. Stale stream cleanup: the collector's `is_stale_payload` path is
/// unit-tested in `collector.rs`; this test drives the downstream half —
/// `EventHandlers::stream_ended` synthesized with `stale_stream_detected`
/// ends the stream, frees the engine, and schedules a cache cleanup.
#[tokio::test]
async fn s5_stale_stream_ends_session_and_frees_engine() {
    let config = CoreConfig::default();
    let rt = runtime();
    let ctx = Context::new(config, rt, "acestream".into());

    let engine = ctx
        .provisioner
        .provision(ProvisionRequest {
            image: "acestream".into(),
            name: "e1".into(),
            vpn_container: None,
            vpn_index: None,
            forwarded: false,
            forwarded_port_env: None,
            replacement: false,
            extra_env: Vec::new(),
        })
        .await
        .unwrap();
    ctx.state.set_starting(&engine.container_key, false);

    let stream = ctx
        .events
        .stream_started(StreamStartedEvent {
            content_key: "BBB".into(),
            key_type: "infohash".into(),
            container_key: engine.container_key.clone(),
            engine_host: engine.host.clone(),
            engine_port: engine.internal_http_port,
            stat_url: "http://engine/stat".into(),
            command_url: "http://engine/cmd".into(),
            ..Default::default()
        })
        .await;
    assert!(ctx.state.get_engine(&engine.container_key).unwrap().active_streams.contains(&stream.id));

    // The collector would have synthesized this from a
    // `{"response": null, "error": "unknown playback session id"}` payload.
    ctx.events
        .stream_ended(StreamEndedEvent {
            content_key: "BBB".into(),
            playback_session_id: Some(stream.playback_session_id.clone()),
            reason: Some("stale_stream_detected".into()),
        })
        .await;

    let ended = ctx.state.get_stream(&stream.id).unwrap();
    assert_eq!(ended.status, orchestrator_core::state::StreamStatus::Ended);

    let freed_engine = ctx.state.get_engine(&engine.container_key).unwrap();
    assert!(freed_engine.is_idle());
    assert!(freed_engine.last_cache_cleanup_ms.is_some(), "idle-triggered cache cleanup ran");

    // Idempotence (spec §8): ending an already-ended stream is a no-op.
    ctx.events
        .stream_ended(StreamEndedEvent { content_key: "BBB".into(), playback_session_id: Some(stream.playback_session_id), reason: None })
        .await;
    assert_eq!(ctx.state.get_stream(&stream.id).unwrap().status, orchestrator_core::state::StreamStatus::Ended);
}
