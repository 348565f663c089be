//! Autoscaler / pool controller (spec §4.8, C8). The busiest loop in the
//! system: decides how many engines to provision, where (which VPN), and
//! which one holds the forwarded port, then gates every provisioning call
//! through the circuit breaker and the provisioner's rate limiter.

use crate::breaker::{CircuitBreaker, OperationClass};
use crate::config::AutoscalerConfig;
use crate::health::{HealthMonitor, ReplacementCandidate};
use crate::provisioner::{ProvisionRequest, Provisioner};
use crate::state::{Engine, EngineFilter, HealthStatus, StateStore};
use crate::vpn::{PortChangeEvent, VpnHealth, VpnSupervisor};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Notify};
use tracing::{info, warn};

/// An additive replacement in flight: `new_container_key` has been started
/// on `old_container_key`'s VPN and is waiting to become healthy before
/// `old_container_key` is stopped (spec §4.5).
#[derive(Debug, Clone)]
struct PendingReplacement {
    old_container_key: String,
    new_container_key: String,
}

pub struct AutoScaler {
    state: Arc<StateStore>,
    vpn: Arc<VpnSupervisor>,
    health: Arc<HealthMonitor>,
    breaker: Arc<CircuitBreaker>,
    provisioner: Arc<Provisioner>,
    config: AutoscalerConfig,
    image: String,
    trigger: Notify,
    first_reconcile_done: Arc<AtomicBool>,
    scale_target: parking_lot::Mutex<Option<usize>>,
    pending_replacements: parking_lot::Mutex<Vec<PendingReplacement>>,
    replacement_candidates: parking_lot::Mutex<mpsc::UnboundedReceiver<ReplacementCandidate>>,
}

impl AutoScaler {
    pub fn new(
        state: Arc<StateStore>,
        vpn: Arc<VpnSupervisor>,
        health: Arc<HealthMonitor>,
        breaker: Arc<CircuitBreaker>,
        provisioner: Arc<Provisioner>,
        config: AutoscalerConfig,
        image: String,
        first_reconcile_done: Arc<AtomicBool>,
    ) -> Arc<Self> {
        let replacement_candidates = health.take_candidates().expect("health monitor's candidate stream is taken exactly once, at context construction");
        Arc::new(Self {
            state,
            vpn,
            health,
            breaker,
            provisioner,
            config,
            image,
            trigger: Notify::new(),
            first_reconcile_done,
            scale_target: parking_lot::Mutex::new(None),
            pending_replacements: parking_lot::Mutex::new(Vec::new()),
            replacement_candidates: parking_lot::Mutex::new(replacement_candidates),
        })
    }

    /// Fires the loop immediately instead of waiting for the next tick
    /// (spec §4.4 port-change handling, §4.8 explicit triggers).
    pub fn trigger_now(&self) {
        self.trigger.notify_one();
    }

    pub fn scale_to(&self, n: usize) {
        *self.scale_target.lock() = Some(n);
        self.trigger_now();
    }

    pub fn spawn(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>, mut port_changes: watch::Receiver<Option<PortChangeEvent>>) {
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.config.autoscale_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = this.trigger.notified() => {}
                    Ok(()) = port_changes.changed() => {
                        let event = port_changes.borrow().clone();
                        if let Some(event) = event {
                            this.handle_forwarded_port_change(event).await;
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            info!("autoscaler shutting down");
                            break;
                        }
                    }
                }
                if !this.first_reconcile_done.load(Ordering::SeqCst) {
                    continue;
                }
                this.tick().await;
            }
        });
    }

    pub async fn tick(&self) {
        // Health-driven additive replacement runs before normal scaling so a
        // freshly provisioned replacement counts toward this tick's totals.
        self.process_replacements().await;

        let engines = self.state.list_engines(&EngineFilter::default());
        let vpn_names: Vec<String> = self.vpn.container_names().to_vec();

        let current_total = engines.len();
        let mut to_provision: Vec<Option<String>> = Vec::new();

        // Step 2: lookahead trigger.
        let any_near_capacity = engines.iter().any(|e| {
            e.effective_load(0) as i64 >= self.config.max_streams_per_engine as i64 - 1
        });
        if any_near_capacity {
            to_provision.push(None);
        }

        // Step 3: free-replica target.
        let free_engines = engines
            .iter()
            .filter(|e| e.effective_load(0) == 0 && e.health == HealthStatus::Healthy)
            .count();
        if free_engines < self.config.min_free_replicas {
            for _ in 0..(self.config.min_free_replicas - free_engines) {
                to_provision.push(None);
            }
        }

        // Explicit scale_to(n) target.
        if let Some(target) = self.scale_target.lock().take() {
            if target > current_total {
                for _ in 0..(target - current_total) {
                    to_provision.push(None);
                }
            } else if target < current_total {
                self.scale_down(current_total - target).await;
            }
        }

        // Step 4: cap.
        let budget = self.config.max_replicas.saturating_sub(current_total);
        to_provision.truncate(budget.min(to_provision.len()));

        if !to_provision.is_empty() {
            self.provision_batch(to_provision.len(), &vpn_names, &engines).await;
        }

        self.ensure_forwarded_engines(&vpn_names).await;
        self.idle_cleanup().await;
    }

    /// Drives the health monitor's additive replacement policy (spec §4.5):
    /// resolve any in-flight replacement whose new engine is healthy and the
    /// pool has margin to lose the old one, then start new replacements for
    /// engines the health monitor classified unhealthy this tick.
    async fn process_replacements(&self) {
        let pending = std::mem::take(&mut *self.pending_replacements.lock());
        let mut still_pending = Vec::with_capacity(pending.len());

        for p in pending {
            let new_engine = self.state.get_engine(&p.new_container_key);
            let Some(new_engine) = new_engine else {
                warn!(old = %p.old_container_key, new = %p.new_container_key, "replacement engine vanished before completion");
                continue;
            };
            if new_engine.health != HealthStatus::Healthy {
                still_pending.push(p);
                continue;
            }

            let remaining_healthy = self
                .state
                .list_engines(&EngineFilter { health: Some(HealthStatus::Healthy), ..Default::default() })
                .into_iter()
                .filter(|e| e.container_key != p.old_container_key)
                .count();
            if remaining_healthy < self.config.min_free_replicas.max(1) {
                still_pending.push(p);
                continue;
            }

            info!(old = %p.old_container_key, new = %p.new_container_key, "replacement engine healthy, stopping original");
            if let Err(err) = self.provisioner.stop_and_remove(&p.old_container_key).await {
                warn!(engine = %p.old_container_key, error = %err, "failed to stop replaced engine");
            }
        }
        *self.pending_replacements.lock() = still_pending;

        let mut candidates = Vec::new();
        {
            let mut rx = self.replacement_candidates.lock();
            while let Ok(candidate) = rx.try_recv() {
                candidates.push(candidate);
            }
        }
        if candidates.is_empty() {
            return;
        }

        let vpn_names: Vec<String> = self.vpn.container_names().to_vec();

        for candidate in candidates {
            let already_pending = self.pending_replacements.lock().iter().any(|p| p.old_container_key == candidate.container_key);
            if already_pending {
                continue;
            }
            if !self.health.may_start_replacement() {
                info!(engine = %candidate.container_key, "replacement deferred, gate not satisfied");
                continue;
            }

            let vpn_index = candidate.vpn.as_ref().and_then(|v| vpn_names.iter().position(|n| n == v));
            let req = ProvisionRequest {
                image: self.image.clone(),
                name: format!("acestream-replacement-{}", uuid::Uuid::new_v4()),
                vpn_container: candidate.vpn.clone(),
                vpn_index,
                forwarded: false,
                forwarded_port_env: None,
                replacement: true,
                extra_env: Vec::new(),
            };

            match self.provisioner.provision(req).await {
                Ok(engine) => {
                    info!(old = %candidate.container_key, new = %engine.container_key, "started additive replacement engine");
                    self.pending_replacements
                        .lock()
                        .push(PendingReplacement { old_container_key: candidate.container_key, new_container_key: engine.container_key });
                }
                Err(err) => {
                    warn!(engine = %candidate.container_key, error = %err, "failed to start replacement engine");
                }
            }
        }
    }

    /// Step 5: VPN distribution, rate-limited via the provisioner itself.
    async fn provision_batch(&self, count: usize, vpn_names: &[String], engines: &[Engine]) {
        let mut counts: HashMap<Option<String>, usize> = HashMap::new();
        if vpn_names.is_empty() {
            counts.insert(None, engines.len());
        } else {
            for name in vpn_names {
                counts.insert(Some(name.clone()), engines.iter().filter(|e| e.vpn.as_deref() == Some(name.as_str())).count());
            }
        }

        let mut permits = self.config.max_concurrent_provisions;
        for i in 0..count {
            if permits == 0 {
                warn!("max_concurrent_provisions reached, deferring remaining provisions to next tick");
                break;
            }

            let target_vpn = if vpn_names.is_empty() {
                None
            } else {
                let healthy: Vec<&String> = vpn_names
                    .iter()
                    .filter(|n| self.vpn.status(n).map(|s| s.health == VpnHealth::Healthy).unwrap_or(false))
                    .collect();
                if healthy.is_empty() {
                    warn!("no healthy vpn available, deferring provisioning");
                    break;
                }
                healthy
                    .into_iter()
                    .min_by_key(|n| *counts.get(&Some((*n).clone())).unwrap_or(&0))
                    .cloned()
            };

            let name = format!("acestream-{}", uuid::Uuid::new_v4());
            let req = ProvisionRequest {
                image: self.image.clone(),
                name: name.clone(),
                vpn_container: target_vpn.clone(),
                vpn_index: target_vpn.as_ref().and_then(|n| vpn_names.iter().position(|v| v == n)),
                forwarded: false,
                forwarded_port_env: None,
                replacement: false,
                extra_env: Vec::new(),
            };

            match self.provisioner.provision(req).await {
                Ok(_) => {
                    if let Some(vpn) = &target_vpn {
                        *counts.entry(Some(vpn.clone())).or_insert(0) += 1;
                    }
                    permits -= 1;
                }
                Err(crate::error::OrchestratorError::CircuitOpen { .. }) => {
                    info!("circuit open, deferring provisioning to next tick");
                    break;
                }
                Err(err) => {
                    warn!(error = %err, attempt = i, "provisioning failed");
                }
            }
        }
    }

    /// Step 6: ensure exactly one forwarded engine per healthy VPN. With no
    /// VPN configured there is no forwarded P2P port to assign, so this is
    /// a no-op — electing one anyway would exempt the sole engine from idle
    /// cleanup (§4.8 step 8 skips forwarded engines) for no real benefit,
    /// contradicting scenario S1's single-engine idle-grace-period cleanup.
    async fn ensure_forwarded_engines(&self, vpn_names: &[String]) {
        if vpn_names.is_empty() {
            return;
        }
        let groups: Vec<Option<String>> = vpn_names.iter().cloned().map(Some).collect();

        for group in groups {
            if let Some(vpn) = &group {
                if self.vpn.status(vpn).map(|s| s.health != VpnHealth::Healthy).unwrap_or(true) {
                    continue;
                }
            }
            if self.state.forwarded_engine_for(&group).is_some() {
                continue;
            }
            let candidates = self.state.list_engines(&EngineFilter {
                vpn: Some(group.clone()),
                health: Some(HealthStatus::Healthy),
                ..Default::default()
            });
            if let Some(candidate) = candidates.into_iter().min_by_key(|e| e.active_streams.len()) {
                self.state.set_forwarded(&candidate.container_key, true);
                info!(engine = %candidate.container_key, vpn = ?group, "promoted engine to forwarded");
            }
        }
    }

    /// Reacts to a forwarded-port change on one VPN (spec §4.4, scenario
    /// S3): the engine currently holding `forwarded=true` on that VPN is
    /// serving clients with a now-stale port-forward, so it is stopped and
    /// replaced immediately with an engine started with the new port
    /// injected via `P2P_PORT` and `forwarded` set from creation, rather
    /// than waiting for `ensure_forwarded_engines`'s idle-promotion path.
    async fn handle_forwarded_port_change(&self, event: PortChangeEvent) {
        let group = Some(event.vpn_id.clone());
        if let Some(stale) = self.state.forwarded_engine_for(&group) {
            info!(vpn = %event.vpn_id, engine = %stale.container_key, new_port = event.new_port, "forwarded port changed, retiring stale forwarded engine");
            if let Err(err) = self.provisioner.stop_and_remove(&stale.container_key).await {
                warn!(engine = %stale.container_key, error = %err, "failed to stop stale forwarded engine");
            }
        }

        let vpn_names: Vec<String> = self.vpn.container_names().to_vec();
        let vpn_index = vpn_names.iter().position(|n| n == &event.vpn_id);

        let req = ProvisionRequest {
            image: self.image.clone(),
            name: format!("acestream-forwarded-{}", uuid::Uuid::new_v4()),
            vpn_container: Some(event.vpn_id.clone()),
            vpn_index,
            forwarded: true,
            forwarded_port_env: Some(event.new_port),
            replacement: false,
            extra_env: Vec::new(),
        };

        match self.provisioner.provision(req).await {
            Ok(engine) => {
                info!(vpn = %event.vpn_id, engine = %engine.container_key, port = event.new_port, "started new forwarded engine for changed port");
            }
            Err(err) => {
                warn!(vpn = %event.vpn_id, error = %err, "failed to start replacement forwarded engine after port change");
            }
        }
    }

    /// Step 8: idle cleanup, suspended during a VPN recovery window.
    async fn idle_cleanup(&self) {
        if !self.config.auto_delete {
            return;
        }
        let now = crate::state::engine::now_ms();
        let grace_ms = self.config.engine_grace_period.as_millis() as i64;

        for engine in self.state.list_engines(&EngineFilter::default()) {
            if engine.forwarded || !engine.is_idle() || engine.starting {
                continue;
            }
            if let Some(vpn) = &engine.vpn {
                if self.vpn.in_recovery_window(vpn) {
                    continue;
                }
            }
            let last_used = engine.last_stream_usage_ms.unwrap_or(engine.first_seen_ms);
            if now - last_used >= grace_ms {
                info!(engine = %engine.container_key, "idle grace period elapsed, stopping");
                if let Err(err) = self.provisioner.stop_and_remove(&engine.container_key).await {
                    warn!(engine = %engine.container_key, error = %err, "failed to stop idle engine");
                }
            }
        }
    }

    async fn scale_down(&self, count: usize) {
        let mut candidates = self.state.list_engines(&EngineFilter::default());
        candidates.sort_by_key(|e| (e.forwarded, e.health == HealthStatus::Healthy, e.active_streams.len()));
        for engine in candidates.into_iter().take(count) {
            if let Err(err) = self.provisioner.stop_and_remove(&engine.container_key).await {
                warn!(engine = %engine.container_key, error = %err, "scale-down stop failed");
            }
        }
    }

    pub fn breaker_state(&self) -> (crate::breaker::BreakerState, crate::breaker::BreakerState) {
        (self.breaker.state(OperationClass::GeneralProvisioning), self.breaker.state(OperationClass::ReplacementProvisioning))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BreakerConfig, HealthConfig, PortRangesConfig, VpnConfig};
    use crate::ports::PortAllocator;
    use crate::runtime::fake::FakeRuntime;
    use crate::state::InMemoryStatsStore;
    use std::sync::atomic::AtomicBool;

    fn harness() -> Arc<AutoScaler> {
        let runtime = Arc::new(FakeRuntime::new());
        let state = Arc::new(StateStore::new(Arc::new(InMemoryStatsStore::default())));
        let vpn = VpnSupervisor::new(runtime.clone(), state.clone(), VpnConfig::default());
        let health = HealthMonitor::new(state.clone(), HealthConfig::default());
        let breaker = Arc::new(CircuitBreaker::new(BreakerConfig::default()));
        let ports = Arc::new(PortAllocator::new(&PortRangesConfig::default()));
        let provisioner = Arc::new(Provisioner::new(
            runtime,
            state.clone(),
            ports,
            breaker.clone(),
            &AutoscalerConfig::default(),
        ));
        AutoScaler::new(
            state,
            vpn,
            health,
            breaker,
            provisioner,
            AutoscalerConfig { min_free_replicas: 2, max_replicas: 5, ..Default::default() },
            "acestream".into(),
            Arc::new(AtomicBool::new(true)),
        )
    }

    #[tokio::test]
    async fn tick_provisions_toward_min_free() {
        let scaler = harness();
        scaler.tick().await;
        let engines = scaler.state.list_engines(&EngineFilter::default());
        assert_eq!(engines.len(), 2);
    }

    #[tokio::test]
    async fn tick_respects_max_replicas_cap() {
        let scaler = harness();
        for _ in 0..3 {
            scaler.tick().await;
        }
        let engines = scaler.state.list_engines(&EngineFilter::default());
        assert!(engines.len() <= 5);
    }

    /// Mirrors the "replacement preserves availability" scenario: an
    /// unhealthy engine gets an additive replacement, and the original is
    /// only stopped once the replacement reports healthy (spec §4.5).
    #[tokio::test]
    async fn additive_replacement_waits_for_new_engine_before_stopping_old() {
        let scaler = harness();

        let mut e1 = Engine::new("e1".into(), "127.0.0.1".into(), 1, 60001);
        e1.starting = false;
        e1.health = HealthStatus::Healthy;
        scaler.state.upsert_engine(e1);

        let mut e2 = Engine::new("e2".into(), "127.0.0.1".into(), 2, 60002);
        e2.starting = false;
        scaler.state.upsert_engine(e2);

        // Drive e2 past the default failure_threshold (3). Each tick probes
        // every known engine, so pin e1 back to healthy in between passes.
        for _ in 0..3 {
            scaler.health.tick().await;
            scaler.state.set_health("e1", HealthStatus::Healthy);
        }
        assert_eq!(scaler.state.get_engine("e2").unwrap().health, HealthStatus::Unhealthy);

        scaler.process_replacements().await;

        let engines = scaler.state.list_engines(&EngineFilter::default());
        assert_eq!(engines.len(), 3, "replacement is additive: old engine stays until the new one is healthy");
        assert!(scaler.state.get_engine("e2").is_some());

        let replacement = engines.into_iter().find(|e| e.container_key != "e1" && e.container_key != "e2").unwrap();
        assert!(replacement.starting);

        // Replacement engine comes up healthy; the next pass should retire e2.
        scaler.state.set_starting(&replacement.container_key, false);
        scaler.state.set_health(&replacement.container_key, HealthStatus::Healthy);
        scaler.state.set_health("e1", HealthStatus::Healthy);

        scaler.process_replacements().await;

        assert!(scaler.state.get_engine("e2").is_none(), "original unhealthy engine retired once replacement is healthy");
        assert!(scaler.state.get_engine(&replacement.container_key).is_some());
        assert!(scaler.state.get_engine("e1").is_some());
    }

    /// Mirrors scenario S3: a VPN's forwarded port changes value, the
    /// stale forwarded engine is retired, and its replacement is created
    /// with the new port and `forwarded=true` from the start.
    #[tokio::test]
    async fn forwarded_port_change_retires_stale_engine_and_replaces_it() {
        let scaler = harness();

        let stale = scaler
            .provisioner
            .provision(ProvisionRequest {
                image: "acestream".into(),
                name: "old-forwarded".into(),
                vpn_container: Some("gluetun1".into()),
                vpn_index: None,
                forwarded: true,
                forwarded_port_env: Some(43437),
                replacement: false,
                extra_env: Vec::new(),
            })
            .await
            .unwrap();

        scaler
            .handle_forwarded_port_change(PortChangeEvent {
                vpn_id: "gluetun1".into(),
                old_port: Some(43437),
                new_port: 57611,
            })
            .await;

        assert!(scaler.state.get_engine(&stale.container_key).is_none(), "stale forwarded engine is stopped");

        let engines = scaler.state.list_engines(&EngineFilter::default());
        assert_eq!(engines.len(), 1);
        let replacement = &engines[0];
        assert!(replacement.forwarded, "replacement is forwarded from creation, not via later promotion");
        assert_eq!(replacement.vpn.as_deref(), Some("gluetun1"));
    }
}
