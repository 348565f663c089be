//! Control-plane tuning knobs (spec §6's configuration table).
//!
//! This is the core-crate half of configuration: pure data, `Default`
//! impls matching the documented defaults, and validation. Loading from
//! file or environment is the orchestrator binary's job (§9: components
//! receive config via a context built once at startup).

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VpnMode {
    Disabled,
    Single,
    Redundant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub autoscaler: AutoscalerConfig,
    pub ports: PortRangesConfig,
    pub health: HealthConfig,
    pub breaker: BreakerConfig,
    pub vpn: VpnConfig,
    pub multiplexer: MultiplexerConfig,
    pub reconciler: ReconcilerConfig,
    pub collector: CollectorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoscalerConfig {
    pub min_free_replicas: usize,
    pub max_replicas: usize,
    pub max_streams_per_engine: usize,
    pub max_concurrent_provisions: usize,
    pub min_provision_interval: Duration,
    pub auto_delete: bool,
    pub engine_grace_period: Duration,
    pub autoscale_interval: Duration,
    pub lookahead_margin: usize,
}

impl Default for AutoscalerConfig {
    fn default() -> Self {
        Self {
            min_free_replicas: 1,
            max_replicas: 10,
            max_streams_per_engine: 1,
            max_concurrent_provisions: 5,
            min_provision_interval: Duration::from_millis(500),
            auto_delete: true,
            engine_grace_period: Duration::from_secs(30),
            autoscale_interval: Duration::from_secs(30),
            lookahead_margin: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortRangesConfig {
    pub host: (u16, u16),
    pub ace_http: (u16, u16),
    pub ace_https: (u16, u16),
    pub gluetun_1: (u16, u16),
    pub gluetun_2: (u16, u16),
}

impl Default for PortRangesConfig {
    fn default() -> Self {
        Self {
            host: (40000, 40999),
            ace_http: (6878, 6977),
            ace_https: (6978, 7077),
            gluetun_1: (41000, 41499),
            gluetun_2: (41500, 41999),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub check_interval: Duration,
    pub probe_timeout: Duration,
    pub failure_threshold: u32,
    pub min_healthy: usize,
    pub replacement_cooldown: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(25),
            probe_timeout: Duration::from_secs(5),
            failure_threshold: 3,
            min_healthy: 1,
            replacement_cooldown: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub general_failure_threshold: u32,
    pub replacement_failure_threshold: u32,
    pub recovery_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            general_failure_threshold: 5,
            replacement_failure_threshold: 5,
            recovery_timeout: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VpnConfig {
    pub mode: VpnMode,
    pub container_names: Vec<String>,
    pub api_port: u16,
    pub health_check_interval: Duration,
    pub port_cache_ttl: Duration,
    pub force_restart_timeout: Duration,
    pub restart_engines_on_reconnect: bool,
    pub recovery_stabilization_window: Duration,
}

impl Default for VpnConfig {
    fn default() -> Self {
        Self {
            mode: VpnMode::Disabled,
            container_names: Vec::new(),
            api_port: 8000,
            health_check_interval: Duration::from_secs(5),
            port_cache_ttl: Duration::from_secs(60),
            force_restart_timeout: Duration::from_secs(60),
            restart_engines_on_reconnect: false,
            recovery_stabilization_window: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MultiplexerConfig {
    pub recent_chunks_capacity: usize,
    pub chunk_size_bytes: usize,
    pub client_queue_capacity: usize,
    pub idle_timeout: Duration,
    pub connect_wait: Duration,
    pub upstream_connect_timeout: Duration,
    pub max_connections_per_host: usize,
}

impl Default for MultiplexerConfig {
    fn default() -> Self {
        Self {
            recent_chunks_capacity: 100,
            chunk_size_bytes: 64 * 1024,
            client_queue_capacity: 50,
            idle_timeout: Duration::from_secs(300),
            connect_wait: Duration::from_secs(30),
            upstream_connect_timeout: Duration::from_secs(30),
            max_connections_per_host: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    pub monitor_interval: Duration,
    pub startup_grace: Duration,
    pub retry_backoffs: Vec<Duration>,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            monitor_interval: Duration::from_secs(10),
            startup_grace: Duration::from_secs(30),
            retry_backoffs: vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    pub collect_interval: Duration,
    pub stat_probe_timeout: Duration,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            collect_interval: Duration::from_secs(2),
            stat_probe_timeout: Duration::from_secs(3),
        }
    }
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            autoscaler: AutoscalerConfig::default(),
            ports: PortRangesConfig::default(),
            health: HealthConfig::default(),
            breaker: BreakerConfig::default(),
            vpn: VpnConfig::default(),
            multiplexer: MultiplexerConfig::default(),
            reconciler: ReconcilerConfig::default(),
            collector: CollectorConfig::default(),
        }
    }
}

impl CoreConfig {
    /// Reject nonsensical combinations before the control loops ever start.
    pub fn validate(&self) -> Result<(), String> {
        if self.autoscaler.min_free_replicas > self.autoscaler.max_replicas {
            return Err("autoscaler.min_free_replicas must be <= max_replicas".into());
        }
        if self.autoscaler.max_streams_per_engine == 0 {
            return Err("autoscaler.max_streams_per_engine must be > 0".into());
        }
        if self.ports.host.0 > self.ports.host.1 {
            return Err("ports.host range is inverted".into());
        }
        match self.vpn.mode {
            VpnMode::Single if self.vpn.container_names.len() != 1 => {
                Err("vpn.mode=single requires exactly one container name".into())
            }
            VpnMode::Redundant if self.vpn.container_names.len() != 2 => {
                Err("vpn.mode=redundant requires exactly two container names".into())
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(CoreConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_min_free_above_max_replicas() {
        let mut cfg = CoreConfig::default();
        cfg.autoscaler.min_free_replicas = 20;
        cfg.autoscaler.max_replicas = 5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_redundant_mode_without_two_vpns() {
        let mut cfg = CoreConfig::default();
        cfg.vpn.mode = VpnMode::Redundant;
        cfg.vpn.container_names = vec!["gluetun1".into()];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn accepts_redundant_mode_with_two_vpns() {
        let mut cfg = CoreConfig::default();
        cfg.vpn.mode = VpnMode::Redundant;
        cfg.vpn.container_names = vec!["gluetun1".into(), "gluetun2".into()];
        assert!(cfg.validate().is_ok());
    }
}
