//! Reconciler (spec §4.9, C9). Keeps the state store in sync with the
//! runtime without ever destroying information during a transient
//! runtime outage — the one place a container can silently leave state
//! without an explicit provisioner call.

use crate::config::ReconcilerConfig;
use crate::ports::{PortAllocator, Scope};
use crate::provisioner::{LABEL_ACE_HTTPS_PORT, LABEL_ACE_HTTP_PORT, LABEL_FORWARDED, LABEL_HOST_HTTPS_PORT, LABEL_HOST_HTTP_PORT, LABEL_VPN_CONTAINER};
use crate::runtime::Runtime;
use crate::state::{Engine, EngineFilter, StateStore};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

pub struct Reconciler {
    runtime: Arc<dyn Runtime>,
    state: Arc<StateStore>,
    ports: Arc<PortAllocator>,
    config: ReconcilerConfig,
    /// Ordered the same way as `VpnConfig::container_names` (index 0 →
    /// `gluetun_1`/`Vpn1Host`, index 1 → `gluetun_2`/`Vpn2Host`) so a
    /// restored engine's host port lands in the scope it was actually
    /// leased from.
    vpn_container_names: Vec<String>,
    first_reconcile_done: Arc<AtomicBool>,
    started_at_ms: i64,
    last_success_ms: AtomicI64,
    consecutive_failures: AtomicU32,
}

impl Reconciler {
    pub fn new(
        runtime: Arc<dyn Runtime>,
        state: Arc<StateStore>,
        ports: Arc<PortAllocator>,
        config: ReconcilerConfig,
        vpn_container_names: Vec<String>,
        first_reconcile_done: Arc<AtomicBool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            runtime,
            state,
            ports,
            config,
            vpn_container_names,
            first_reconcile_done,
            started_at_ms: crate::state::engine::now_ms(),
            last_success_ms: AtomicI64::new(0),
            consecutive_failures: AtomicU32::new(0),
        })
    }

    /// Unix epoch milliseconds of the last tick that could reach the
    /// runtime, or 0 if none has succeeded yet. Exposed for the
    /// `/metrics` reconciler-freshness gauge.
    pub fn last_success_epoch_ms(&self) -> i64 {
        self.last_success_ms.load(Ordering::Relaxed)
    }

    /// Consecutive ticks in a row that could not reach the runtime.
    /// Feeds `/orchestrator/status`'s "unavailable" classification (spec
    /// §7: "runtime unreachable for > N consecutive ticks").
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    pub fn spawn(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.config.monitor_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        this.tick().await;
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            info!("reconciler shutting down");
                            break;
                        }
                    }
                }
            }
        });
    }

    /// One reconciliation pass. Returns `true` if the runtime was
    /// reachable this tick.
    pub async fn tick(&self) -> bool {
        let refs = match self.list_managed_with_retry().await {
            Some(refs) => refs,
            None => {
                warn!("runtime unreachable after retries, skipping reconciliation this tick");
                self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
                return false;
            }
        };
        self.consecutive_failures.store(0, Ordering::Relaxed);

        let runtime_keys: std::collections::HashSet<String> = refs.iter().map(|r| r.key.clone()).collect();
        let known = self.state.list_engines(&EngineFilter::default());
        let known_keys: std::collections::HashSet<String> = known.iter().map(|e| e.container_key.clone()).collect();

        for container_ref in &refs {
            if known_keys.contains(&container_ref.key) {
                continue;
            }
            let labels = &container_ref.labels;
            let internal_http_port: u16 = labels.get(LABEL_ACE_HTTP_PORT).and_then(|v| v.parse().ok()).unwrap_or(0);
            let host_http_port: u16 = labels.get(LABEL_HOST_HTTP_PORT).and_then(|v| v.parse().ok()).unwrap_or(0);
            let https_port: Option<u16> = labels.get(LABEL_ACE_HTTPS_PORT).and_then(|v| v.parse().ok());
            let host_https_port: Option<u16> = labels.get(LABEL_HOST_HTTPS_PORT).and_then(|v| v.parse().ok());
            let vpn = labels.get(LABEL_VPN_CONTAINER).cloned();
            let forwarded = labels.get(LABEL_FORWARDED).map(|v| v == "true").unwrap_or(false);

            let mut engine = Engine::new(container_ref.key.clone(), container_ref.name.clone(), host_http_port, internal_http_port);
            engine.internal_https_port = https_port;
            engine.forwarded = forwarded;
            engine.labels = labels.clone();
            engine.starting = false;

            // `redundant` means "more than one VPN container configured",
            // matching the host-port scope split the provisioner leased
            // from; the index is this VPN's position in the *configured*
            // (not runtime-discovered) ordering, so it lines up with
            // `gluetun_1`/`gluetun_2` ranges regardless of restart order.
            let redundant = self.vpn_container_names.len() > 1;
            let vpn_index = vpn.as_ref().and_then(|v| self.vpn_container_names.iter().position(|n| n == v));
            engine.vpn = vpn;
            engine.host_port_scope = PortAllocator::host_scope_for_vpn(redundant, vpn_index);

            self.ports.mark_in_use(engine.host_port_scope, host_http_port);
            self.ports.mark_in_use(Scope::InternalHttp, internal_http_port);
            if let Some(p) = https_port {
                self.ports.mark_in_use(Scope::InternalHttps, p);
            }
            if let Some(p) = host_https_port {
                self.ports.mark_in_use(Scope::Host, p);
            }

            info!(container = %container_ref.key, "restored engine from runtime labels");
            self.state.upsert_engine(engine);
        }

        let startup_grace_ms = self.config.startup_grace.as_millis() as i64;
        let now = crate::state::engine::now_ms();
        for engine in &known {
            if runtime_keys.contains(&engine.container_key) {
                continue;
            }
            if engine.starting && now - engine.first_seen_ms < startup_grace_ms {
                continue;
            }
            warn!(container = %engine.container_key, "engine no longer present in runtime, removing from state");
            self.ports.release(Scope::InternalHttp, engine.internal_http_port);
            self.ports.release(engine.host_port_scope, engine.external_port);
            if let Some(p) = engine.internal_https_port {
                self.ports.release(Scope::InternalHttps, p);
            }
            self.state.remove_engine(&engine.container_key);
        }

        if !self.first_reconcile_done.swap(true, Ordering::SeqCst) {
            info!("first reconcile completed");
        }
        self.last_success_ms.store(crate::state::engine::now_ms(), Ordering::Relaxed);

        true
    }

    async fn list_managed_with_retry(&self) -> Option<Vec<crate::runtime::ContainerRef>> {
        let backoffs = &self.config.retry_backoffs;
        for (attempt, backoff) in std::iter::once(&std::time::Duration::ZERO).chain(backoffs.iter()).enumerate() {
            if attempt > 0 {
                tokio::time::sleep(*backoff).await;
            }
            match self.runtime.list_managed().await {
                Ok(refs) => return Some(refs),
                Err(err) => warn!(attempt, error = %err, "list_managed failed, retrying"),
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PortRangesConfig;
    use crate::runtime::fake::FakeRuntime;
    use crate::runtime::CreateSpec;
    use crate::state::InMemoryStatsStore;

    fn reconciler() -> (Arc<Reconciler>, Arc<FakeRuntime>, Arc<StateStore>) {
        let runtime = Arc::new(FakeRuntime::new());
        let state = Arc::new(StateStore::new(Arc::new(InMemoryStatsStore::default())));
        let ports = Arc::new(PortAllocator::new(&PortRangesConfig::default()));
        let flag = Arc::new(AtomicBool::new(false));
        let r = Reconciler::new(runtime.clone(), state.clone(), ports, ReconcilerConfig::default(), Vec::new(), flag);
        (r, runtime, state)
    }

    #[tokio::test]
    async fn discovers_unknown_container_and_restores_labels() {
        let (r, runtime, state) = reconciler();
        let mut labels = std::collections::HashMap::new();
        labels.insert(LABEL_ACE_HTTP_PORT.to_string(), "6878".to_string());
        labels.insert(LABEL_HOST_HTTP_PORT.to_string(), "40000".to_string());
        labels.insert(LABEL_FORWARDED.to_string(), "true".to_string());
        runtime.create(CreateSpec { image: "acestream".into(), name: "e1".into(), labels, ..Default::default() }).await.unwrap();

        assert!(r.tick().await);
        let engines = state.list_engines(&EngineFilter::default());
        assert_eq!(engines.len(), 1);
        assert!(engines[0].forwarded);
    }

    /// Regression test: a restored engine's port must be released from the
    /// scope it was actually leased from in redundant-VPN mode, not a
    /// hardcoded `Vpn1Host` guess (spec §4.2, §8 invariant #2).
    #[tokio::test]
    async fn restores_redundant_mode_engine_into_its_own_vpn_scope() {
        let runtime = Arc::new(FakeRuntime::new());
        let state = Arc::new(StateStore::new(Arc::new(InMemoryStatsStore::default())));
        let mut ranges = PortRangesConfig::default();
        ranges.gluetun_1 = (50000, 50010);
        ranges.gluetun_2 = (51000, 51010);
        let ports = Arc::new(PortAllocator::new(&ranges));
        let flag = Arc::new(AtomicBool::new(false));
        let r = Reconciler::new(
            runtime.clone(),
            state.clone(),
            ports.clone(),
            ReconcilerConfig::default(),
            vec!["gluetun1".into(), "gluetun2".into()],
            flag,
        );

        let mut labels = std::collections::HashMap::new();
        labels.insert(LABEL_ACE_HTTP_PORT.to_string(), "6878".to_string());
        labels.insert(LABEL_HOST_HTTP_PORT.to_string(), "51005".to_string());
        labels.insert(LABEL_VPN_CONTAINER.to_string(), "gluetun2".to_string());
        runtime.create(CreateSpec { image: "acestream".into(), name: "e1".into(), labels, ..Default::default() }).await.unwrap();

        assert!(r.tick().await);
        let engine = state.list_engines(&EngineFilter::default()).remove(0);
        assert_eq!(engine.host_port_scope, crate::ports::Scope::Vpn2Host);
        assert!(ports.is_in_use(crate::ports::Scope::Vpn2Host, 51005));
        assert!(!ports.is_in_use(crate::ports::Scope::Vpn1Host, 51005));

        state.remove_engine(&engine.container_key);
        r.ports.release(engine.host_port_scope, engine.external_port);
        assert!(!ports.is_in_use(crate::ports::Scope::Vpn2Host, 51005));
    }

    #[tokio::test]
    async fn runtime_unavailable_preserves_state() {
        let (r, runtime, state) = reconciler();
        state.upsert_engine(Engine::new("c1".into(), "h1".into(), 1, 2));
        runtime.set_unavailable(true);

        assert!(!r.tick().await);
        assert_eq!(state.list_engines(&EngineFilter::default()).len(), 1);
    }

    #[tokio::test]
    async fn removes_engine_no_longer_in_runtime_after_grace() {
        let (r, _runtime, state) = reconciler();
        let mut e = Engine::new("c1".into(), "h1".into(), 1, 2);
        e.starting = false;
        e.first_seen_ms -= 60_000;
        state.upsert_engine(e);

        r.tick().await;
        assert!(state.get_engine("c1").is_none());
    }
}
