//! Ambient configuration for the `orchestrator` binary: process-level
//! knobs (bind address, auth, logging) plus every control-plane tuning
//! group from `orchestrator_core::config::CoreConfig`, loaded flat so
//! each value matches the env var table (spec §6) one-to-one.
//!
//! Loading is layered: compile-time defaults, then a small file search
//! path, then `ORCHESTRATOR_` environment variables with `__` nesting.

use anyhow::{Context, Result};
use orchestrator_core::config::{
    AutoscalerConfig, BreakerConfig, CollectorConfig, CoreConfig, HealthConfig,
    MultiplexerConfig, PortRangesConfig, ReconcilerConfig, VpnConfig, VpnMode,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub server: ServerConfig,
    pub runtime: RuntimeSettings,
    pub auth: AuthConfig,
    pub logging: LoggingConfig,
    pub autoscaler: AutoscalerSettings,
    pub ports: PortSettings,
    pub health: HealthSettings,
    pub breaker: BreakerSettings,
    pub vpn: VpnSettings,
    pub multiplexer: MultiplexerSettings,
    pub reconciler: ReconcilerSettings,
    pub collector: CollectorSettings,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    pub write_timeout_secs: u64,
    pub enable_cors: bool,
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            write_timeout_secs: 30,
            enable_cors: true,
            cors_origins: vec!["http://localhost:3000".to_string()],
        }
    }
}

/// Container runtime connection (spec §4.1: `DockerRuntime`/`FakeRuntime`).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RuntimeSettings {
    /// Empty string means "use the platform default" (`DockerRuntime::new`).
    pub docker_socket: String,
    /// Image used by the autoscaler/provisioner when creating engines.
    pub engine_image: String,
    /// `true` drives the control plane against `FakeRuntime` instead of a
    /// live daemon — used for demos and for running the binary in CI
    /// without Docker available.
    pub fake: bool,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self { docker_socket: String::new(), engine_image: "acestream/engine:latest".to_string(), fake: false }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Bearer token gating the endpoints spec §6 marks "bearer-authenticated".
    /// Empty disables auth entirely (local/dev use only).
    pub api_key: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self { api_key: String::new() }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info,orchestrator=debug".to_string(), format: LogFormat::Pretty }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AutoscalerSettings {
    pub min_free_replicas: usize,
    pub max_replicas: usize,
    pub max_streams_per_engine: usize,
    pub max_concurrent_provisions: usize,
    pub min_provision_interval_s: u64,
    pub auto_delete: bool,
    pub engine_grace_period_s: u64,
    pub autoscale_interval_s: u64,
    pub lookahead_margin: usize,
}

impl Default for AutoscalerSettings {
    fn default() -> Self {
        let d = AutoscalerConfig::default();
        Self {
            min_free_replicas: d.min_free_replicas,
            max_replicas: d.max_replicas,
            max_streams_per_engine: d.max_streams_per_engine,
            max_concurrent_provisions: d.max_concurrent_provisions,
            // CoreConfig's default is 500ms; this layer is whole-second
            // granularity (spec §6: `MIN_PROVISION_INTERVAL_S`), so the
            // flat default rounds up rather than disappearing to zero.
            min_provision_interval_s: 1,
            auto_delete: d.auto_delete,
            engine_grace_period_s: d.engine_grace_period.as_secs(),
            autoscale_interval_s: d.autoscale_interval.as_secs(),
            lookahead_margin: d.lookahead_margin,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PortSettings {
    pub host: (u16, u16),
    pub ace_http: (u16, u16),
    pub ace_https: (u16, u16),
    pub gluetun_1: (u16, u16),
    pub gluetun_2: (u16, u16),
}

impl Default for PortSettings {
    fn default() -> Self {
        let d = PortRangesConfig::default();
        Self { host: d.host, ace_http: d.ace_http, ace_https: d.ace_https, gluetun_1: d.gluetun_1, gluetun_2: d.gluetun_2 }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HealthSettings {
    pub check_interval_s: u64,
    pub probe_timeout_s: u64,
    pub failure_threshold: u32,
    pub min_healthy: usize,
    pub replacement_cooldown_s: u64,
}

impl Default for HealthSettings {
    fn default() -> Self {
        let d = HealthConfig::default();
        Self {
            check_interval_s: d.check_interval.as_secs(),
            probe_timeout_s: d.probe_timeout.as_secs(),
            failure_threshold: d.failure_threshold,
            min_healthy: d.min_healthy,
            replacement_cooldown_s: d.replacement_cooldown.as_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BreakerSettings {
    pub general_failure_threshold: u32,
    pub replacement_failure_threshold: u32,
    pub recovery_timeout_s: u64,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        let d = BreakerConfig::default();
        Self {
            general_failure_threshold: d.general_failure_threshold,
            replacement_failure_threshold: d.replacement_failure_threshold,
            recovery_timeout_s: d.recovery_timeout.as_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct VpnSettings {
    pub mode: VpnMode,
    pub container_names: Vec<String>,
    pub api_port: u16,
    pub health_check_interval_s: u64,
    pub port_cache_ttl_s: u64,
    pub force_restart_timeout_s: u64,
    pub restart_engines_on_reconnect: bool,
    pub recovery_stabilization_window_s: u64,
}

impl Default for VpnSettings {
    fn default() -> Self {
        let d = VpnConfig::default();
        Self {
            mode: d.mode,
            container_names: d.container_names,
            api_port: d.api_port,
            health_check_interval_s: d.health_check_interval.as_secs(),
            port_cache_ttl_s: d.port_cache_ttl.as_secs(),
            force_restart_timeout_s: d.force_restart_timeout.as_secs(),
            restart_engines_on_reconnect: d.restart_engines_on_reconnect,
            recovery_stabilization_window_s: d.recovery_stabilization_window.as_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MultiplexerSettings {
    pub recent_chunks_capacity: usize,
    pub chunk_size_bytes: usize,
    pub client_queue_capacity: usize,
    pub idle_timeout_s: u64,
    pub connect_wait_s: u64,
    pub upstream_connect_timeout_s: u64,
    pub max_connections_per_host: usize,
}

impl Default for MultiplexerSettings {
    fn default() -> Self {
        let d = MultiplexerConfig::default();
        Self {
            recent_chunks_capacity: d.recent_chunks_capacity,
            chunk_size_bytes: d.chunk_size_bytes,
            client_queue_capacity: d.client_queue_capacity,
            idle_timeout_s: d.idle_timeout.as_secs(),
            connect_wait_s: d.connect_wait.as_secs(),
            upstream_connect_timeout_s: d.upstream_connect_timeout.as_secs(),
            max_connections_per_host: d.max_connections_per_host,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ReconcilerSettings {
    pub monitor_interval_s: u64,
    pub startup_grace_s: u64,
    pub retry_backoffs_s: Vec<u64>,
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        let d = ReconcilerConfig::default();
        Self {
            monitor_interval_s: d.monitor_interval.as_secs(),
            startup_grace_s: d.startup_grace.as_secs(),
            retry_backoffs_s: d.retry_backoffs.iter().map(Duration::as_secs).collect(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CollectorSettings {
    pub collect_interval_s: u64,
    pub stat_probe_timeout_s: u64,
}

impl Default for CollectorSettings {
    fn default() -> Self {
        let d = CollectorConfig::default();
        Self { collect_interval_s: d.collect_interval.as_secs(), stat_probe_timeout_s: d.stat_probe_timeout.as_secs() }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            runtime: RuntimeSettings::default(),
            auth: AuthConfig::default(),
            logging: LoggingConfig::default(),
            autoscaler: AutoscalerSettings::default(),
            ports: PortSettings::default(),
            health: HealthSettings::default(),
            breaker: BreakerSettings::default(),
            vpn: VpnSettings::default(),
            multiplexer: MultiplexerSettings::default(),
            reconciler: ReconcilerSettings::default(),
            collector: CollectorSettings::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Load from `orchestrator.toml` (searched on a small path) and
    /// `ORCHESTRATOR_*` environment variables, layered over compile-time
    /// defaults (teacher's `ClusterConfig::load` pattern).
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let defaults = config::Config::try_from(&OrchestratorConfig::default())
            .context("failed to serialize default configuration")?;

        let mut builder = config::Config::builder().add_source(defaults);

        for path in ["/etc/orchestrator/orchestrator", "config/orchestrator", "crates/orchestrator/config/orchestrator"] {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("ORCHESTRATOR").separator("__").try_parsing(true),
        );

        builder
            .build()
            .context("failed to build configuration")?
            .try_deserialize()
            .context("failed to deserialize configuration")
    }

    pub fn validate(&self) -> Result<()> {
        self.server.bind_address.parse::<std::net::SocketAddr>().context("invalid server.bind_address")?;
        self.to_core_config().validate().map_err(anyhow::Error::msg)?;
        Ok(())
    }

    /// Translates the flat, env-var-friendly settings into the
    /// `Duration`-typed `CoreConfig` the control plane actually runs on.
    pub fn to_core_config(&self) -> CoreConfig {
        CoreConfig {
            autoscaler: AutoscalerConfig {
                min_free_replicas: self.autoscaler.min_free_replicas,
                max_replicas: self.autoscaler.max_replicas,
                max_streams_per_engine: self.autoscaler.max_streams_per_engine,
                max_concurrent_provisions: self.autoscaler.max_concurrent_provisions,
                min_provision_interval: Duration::from_secs(self.autoscaler.min_provision_interval_s),
                auto_delete: self.autoscaler.auto_delete,
                engine_grace_period: Duration::from_secs(self.autoscaler.engine_grace_period_s),
                autoscale_interval: Duration::from_secs(self.autoscaler.autoscale_interval_s),
                lookahead_margin: self.autoscaler.lookahead_margin,
            },
            ports: PortRangesConfig {
                host: self.ports.host,
                ace_http: self.ports.ace_http,
                ace_https: self.ports.ace_https,
                gluetun_1: self.ports.gluetun_1,
                gluetun_2: self.ports.gluetun_2,
            },
            health: HealthConfig {
                check_interval: Duration::from_secs(self.health.check_interval_s),
                probe_timeout: Duration::from_secs(self.health.probe_timeout_s),
                failure_threshold: self.health.failure_threshold,
                min_healthy: self.health.min_healthy,
                replacement_cooldown: Duration::from_secs(self.health.replacement_cooldown_s),
            },
            breaker: BreakerConfig {
                general_failure_threshold: self.breaker.general_failure_threshold,
                replacement_failure_threshold: self.breaker.replacement_failure_threshold,
                recovery_timeout: Duration::from_secs(self.breaker.recovery_timeout_s),
            },
            vpn: VpnConfig {
                mode: self.vpn.mode,
                container_names: self.vpn.container_names.clone(),
                api_port: self.vpn.api_port,
                health_check_interval: Duration::from_secs(self.vpn.health_check_interval_s),
                port_cache_ttl: Duration::from_secs(self.vpn.port_cache_ttl_s),
                force_restart_timeout: Duration::from_secs(self.vpn.force_restart_timeout_s),
                restart_engines_on_reconnect: self.vpn.restart_engines_on_reconnect,
                recovery_stabilization_window: Duration::from_secs(self.vpn.recovery_stabilization_window_s),
            },
            multiplexer: MultiplexerConfig {
                recent_chunks_capacity: self.multiplexer.recent_chunks_capacity,
                chunk_size_bytes: self.multiplexer.chunk_size_bytes,
                client_queue_capacity: self.multiplexer.client_queue_capacity,
                idle_timeout: Duration::from_secs(self.multiplexer.idle_timeout_s),
                connect_wait: Duration::from_secs(self.multiplexer.connect_wait_s),
                upstream_connect_timeout: Duration::from_secs(self.multiplexer.upstream_connect_timeout_s),
                max_connections_per_host: self.multiplexer.max_connections_per_host,
            },
            reconciler: ReconcilerConfig {
                monitor_interval: Duration::from_secs(self.reconciler.monitor_interval_s),
                startup_grace: Duration::from_secs(self.reconciler.startup_grace_s),
                retry_backoffs: self.reconciler.retry_backoffs_s.iter().map(|s| Duration::from_secs(*s)).collect(),
            },
            collector: CollectorConfig {
                collect_interval: Duration::from_secs(self.collector.collect_interval_s),
                stat_probe_timeout: Duration::from_secs(self.collector.stat_probe_timeout_s),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_round_trip_to_a_valid_core_config() {
        let cfg = OrchestratorConfig::default();
        assert!(cfg.to_core_config().validate().is_ok());
    }

    #[test]
    fn validate_rejects_bad_bind_address() {
        let mut cfg = OrchestratorConfig::default();
        cfg.server.bind_address = "not-an-address".to_string();
        assert!(cfg.validate().is_err());
    }
}
