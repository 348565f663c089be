//! VPN supervisor (spec §4.4, C4). One control loop per configured VPN
//! container, classifying health and tracking the forwarded P2P port.
//!
//! Loop shape: `tokio::time::interval` with `MissedTickBehavior::Skip`
//! raced against a `watch::Receiver<bool>` shutdown signal via
//! `tokio::select!`, reused by every periodic loop in this crate.

use crate::config::VpnConfig;
use crate::runtime::{ContainerState, Runtime};
use crate::state::StateStore;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VpnHealth {
    Healthy,
    Unhealthy,
    Unknown,
}

#[derive(Debug, Clone, Serialize)]
pub struct VpnStatus {
    pub container_name: String,
    pub health: VpnHealth,
    pub forwarded_port: Option<u32>,
    pub in_recovery_window: bool,
}

/// `{vpn_id, old_status, new_status, forwarded_port}` (spec §4.4).
#[derive(Debug, Clone)]
pub struct VpnTransition {
    pub vpn_id: String,
    pub old_status: VpnHealth,
    pub new_status: VpnHealth,
    pub forwarded_port: Option<u32>,
}

/// Fired when a VPN's forwarded port changes value; the autoscaler reacts
/// by stopping the old forwarded engine and re-electing immediately.
#[derive(Debug, Clone)]
pub struct PortChangeEvent {
    pub vpn_id: String,
    pub old_port: Option<u32>,
    pub new_port: u32,
}

struct VpnInner {
    health: RwLock<VpnHealth>,
    forwarded_port: RwLock<Option<u32>>,
    port_cached_at: RwLock<Option<Instant>>,
    unhealthy_since: RwLock<Option<Instant>>,
    recovery_until: RwLock<Option<Instant>>,
    last_http_check_failed: AtomicBool,
    last_transition_ms: AtomicI64,
}

/// Supervises every configured VPN container. Owns one `VpnInner` per
/// container name, addressed by name throughout the rest of the control
/// plane (autoscaler, provisioner labels, `/vpn/status`).
pub struct VpnSupervisor {
    runtime: Arc<dyn Runtime>,
    state: Arc<StateStore>,
    http: reqwest::Client,
    config: VpnConfig,
    vpns: HashMap<String, VpnInner>,
    transitions_tx: watch::Sender<Vec<VpnTransition>>,
    port_changes_tx: watch::Sender<Option<PortChangeEvent>>,
}

impl VpnSupervisor {
    pub fn new(runtime: Arc<dyn Runtime>, state: Arc<StateStore>, config: VpnConfig) -> Arc<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .expect("vpn http client");

        let mut vpns = HashMap::new();
        for name in &config.container_names {
            vpns.insert(
                name.clone(),
                VpnInner {
                    health: RwLock::new(VpnHealth::Unknown),
                    forwarded_port: RwLock::new(None),
                    port_cached_at: RwLock::new(None),
                    unhealthy_since: RwLock::new(None),
                    recovery_until: RwLock::new(None),
                    last_http_check_failed: AtomicBool::new(false),
                    last_transition_ms: AtomicI64::new(0),
                },
            );
        }

        let (transitions_tx, _) = watch::channel(Vec::new());
        let (port_changes_tx, _) = watch::channel(None);

        Arc::new(Self { runtime, state, http, config, vpns, transitions_tx, port_changes_tx })
    }

    pub fn is_enabled(&self) -> bool {
        !self.vpns.is_empty()
    }

    /// Configured VPN container names in their *configured* order (index 0
    /// → `gluetun_1`/`Vpn1Host`, index 1 → `gluetun_2`/`Vpn2Host`). Callers
    /// that compute a `vpn_index` for port-scope routing must use this
    /// instead of `all_statuses()`, whose order follows an internal
    /// `HashMap` and is not guaranteed to match the configured ranges.
    pub fn container_names(&self) -> &[String] {
        &self.config.container_names
    }

    pub fn subscribe_port_changes(&self) -> watch::Receiver<Option<PortChangeEvent>> {
        self.port_changes_tx.subscribe()
    }

    pub fn status(&self, name: &str) -> Option<VpnStatus> {
        let inner = self.vpns.get(name)?;
        Some(VpnStatus {
            container_name: name.to_string(),
            health: *inner.health.read(),
            forwarded_port: *inner.forwarded_port.read(),
            in_recovery_window: inner
                .recovery_until
                .read()
                .map(|until| Instant::now() < until)
                .unwrap_or(false),
        })
    }

    pub fn all_statuses(&self) -> Vec<VpnStatus> {
        self.vpns.keys().filter_map(|name| self.status(name)).collect()
    }

    pub fn any_healthy(&self) -> bool {
        self.vpns.values().any(|v| *v.health.read() == VpnHealth::Healthy)
    }

    pub fn all_unhealthy(&self) -> bool {
        !self.vpns.is_empty() && self.vpns.values().all(|v| *v.health.read() != VpnHealth::Healthy)
    }

    /// True while a port-change recovery is suppressing grace-period
    /// cleanup for engines on this VPN (spec §4.4 / §4.8 step 8).
    pub fn in_recovery_window(&self, name: &str) -> bool {
        self.vpns
            .get(name)
            .and_then(|v| *v.recovery_until.read())
            .map(|until| Instant::now() < until)
            .unwrap_or(false)
    }

    /// Spawns one loop per configured VPN container. Returns immediately;
    /// the loops run until `shutdown` fires.
    pub fn spawn_all(self: &Arc<Self>, shutdown: watch::Receiver<bool>) {
        for name in self.vpns.keys().cloned().collect::<Vec<_>>() {
            let this = self.clone();
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(this.config.health_check_interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            if let Err(err) = this.tick(&name).await {
                                warn!(vpn = %name, error = %err, "vpn supervisor tick failed");
                            }
                        }
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                info!(vpn = %name, "vpn supervisor shutting down");
                                break;
                            }
                        }
                    }
                }
            });
        }
    }

    async fn tick(&self, name: &str) -> crate::error::Result<()> {
        let inner = match self.vpns.get(name) {
            Some(i) => i,
            None => return Ok(()),
        };

        let old_status = *inner.health.read();
        let mut new_status = old_status;

        match self.runtime.inspect(name).await {
            Err(_) => {
                new_status = self.classify_unhealthy(name, inner).await;
            }
            Ok(inspect) if inspect.state != ContainerState::Running => {
                new_status = self.classify_unhealthy(name, inner).await;
            }
            Ok(inspect) => {
                let runtime_healthy = inspect.healthy.unwrap_or(true);
                if runtime_healthy {
                    *inner.unhealthy_since.write() = None;
                    new_status = VpnHealth::Healthy;
                    self.refresh_forwarded_port(name, inner).await;
                } else {
                    new_status = self.classify_unhealthy(name, inner).await;
                }
            }
        }

        inner.last_http_check_failed.store(new_status != VpnHealth::Healthy, Ordering::SeqCst);
        *inner.health.write() = new_status;

        if new_status != old_status {
            let forwarded_port = *inner.forwarded_port.read();
            info!(vpn = %name, ?old_status, ?new_status, "vpn health transition");
            let transition = VpnTransition { vpn_id: name.to_string(), old_status, new_status, forwarded_port };
            self.transitions_tx.send_modify(|v| v.push(transition));

            if old_status == VpnHealth::Unhealthy && new_status == VpnHealth::Healthy && self.config.restart_engines_on_reconnect {
                self.restart_engines_on_vpn(name).await;
            }
        }

        Ok(())
    }

    async fn classify_unhealthy(&self, name: &str, inner: &VpnInner) -> VpnHealth {
        // Double-check via engine connectivity before committing to unhealthy.
        let engines = self.state.list_engines(&crate::state::EngineFilter {
            vpn: Some(Some(name.to_string())),
            ..Default::default()
        });

        for engine in &engines {
            let url = format!(
                "http://{}:{}/server/api?api_version=3&method=get_network_connection_status",
                engine.host, engine.internal_http_port
            );
            if let Ok(resp) = self.http.get(&url).send().await {
                if let Ok(body) = resp.json::<serde_json::Value>().await {
                    if body["result"]["connected"].as_bool() == Some(true) {
                        *inner.unhealthy_since.write() = None;
                        return VpnHealth::Healthy;
                    }
                }
            }
        }

        let since = *inner.unhealthy_since.read();
        let since = since.unwrap_or_else(|| {
            let now = Instant::now();
            *inner.unhealthy_since.write() = Some(now);
            now
        });

        if since.elapsed() >= self.config.force_restart_timeout {
            warn!(vpn = %name, "force-restarting vpn container after prolonged unhealthy state");
            let _ = self.runtime.restart(name, Duration::from_secs(30)).await;
            *inner.unhealthy_since.write() = Some(Instant::now());
        }

        VpnHealth::Unhealthy
    }

    async fn refresh_forwarded_port(&self, name: &str, inner: &VpnInner) {
        let stale = inner
            .port_cached_at
            .read()
            .map(|at| at.elapsed() >= self.config.port_cache_ttl)
            .unwrap_or(true);
        if !stale {
            return;
        }

        let url = format!("http://{}:{}/v1/openvpn/portforwarded", name, self.config.api_port);
        let port = match self.http.get(&url).send().await {
            Ok(resp) => resp.json::<serde_json::Value>().await.ok().and_then(|v| {
                v.get("port").and_then(|p| p.as_u64()).or_else(|| v.as_u64())
            }),
            Err(_) => None,
        };

        *inner.port_cached_at.write() = Some(Instant::now());

        let Some(port) = port.map(|p| p as u32) else { return };
        let old_port = *inner.forwarded_port.read();
        if old_port != Some(port) {
            *inner.forwarded_port.write() = Some(port);
            *inner.recovery_until.write() = Some(Instant::now() + self.config.recovery_stabilization_window);
            info!(vpn = %name, old_port, new_port = port, "vpn forwarded port changed");
            let _ = self.port_changes_tx.send(Some(PortChangeEvent {
                vpn_id: name.to_string(),
                old_port,
                new_port: port,
            }));
        }
    }

    async fn restart_engines_on_vpn(&self, name: &str) {
        let engines = self.state.list_engines(&crate::state::EngineFilter {
            vpn: Some(Some(name.to_string())),
            ..Default::default()
        });
        for engine in engines {
            if let Err(err) = self.runtime.restart(&engine.container_key, Duration::from_secs(15)).await {
                warn!(engine = %engine.container_key, error = %err, "failed to restart engine after vpn reconnect");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::fake::FakeRuntime;

    fn config() -> VpnConfig {
        VpnConfig {
            container_names: vec!["gluetun1".into()],
            health_check_interval: Duration::from_millis(10),
            force_restart_timeout: Duration::from_secs(60),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn classifies_unhealthy_when_runtime_unreachable() {
        let runtime = Arc::new(FakeRuntime::new());
        let state = Arc::new(StateStore::new(Arc::new(crate::state::InMemoryStatsStore::default())));
        let supervisor = VpnSupervisor::new(runtime, state, config());
        supervisor.tick("gluetun1").await.unwrap();
        assert_eq!(supervisor.status("gluetun1").unwrap().health, VpnHealth::Unhealthy);
    }

    #[tokio::test]
    async fn unknown_vpn_tick_is_noop() {
        let runtime = Arc::new(FakeRuntime::new());
        let state = Arc::new(StateStore::new(Arc::new(crate::state::InMemoryStatsStore::default())));
        let supervisor = VpnSupervisor::new(runtime, state, config());
        assert!(supervisor.tick("does-not-exist").await.is_ok());
    }
}
