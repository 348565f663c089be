//! Engine selector (spec §4.7, C13). Picks an engine for a new stream
//! request without racing the state store: pending allocations are
//! tracked here so two concurrent selections never both pick an engine
//! that only has room for one more stream.

use crate::config::AutoscalerConfig;
use crate::error::{OrchestratorError, Result};
use crate::state::{EngineFilter, HealthStatus, StateStore};
use crate::vpn::VpnSupervisor;
use dashmap::DashMap;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct Selection {
    pub container_key: String,
    pub host: String,
    pub port: u16,
}

pub struct EngineSelector {
    state: Arc<StateStore>,
    vpn: Arc<VpnSupervisor>,
    max_streams_per_engine: usize,
    pending: DashMap<String, usize>,
}

impl EngineSelector {
    pub fn new(state: Arc<StateStore>, vpn: Arc<VpnSupervisor>, config: &AutoscalerConfig) -> Self {
        Self { state, vpn, max_streams_per_engine: config.max_streams_per_engine, pending: DashMap::new() }
    }

    fn pending_for(&self, key: &str) -> usize {
        self.pending.get(key).map(|v| *v).unwrap_or(0)
    }

    /// Snapshot + sort + pick + atomic pending-increment, per spec §4.7.
    pub fn select(&self) -> Result<Selection> {
        let candidates = self.state.list_engines(&EngineFilter::default());

        let mut ranked: Vec<_> = candidates
            .into_iter()
            .filter(|e| !e.starting)
            .filter(|e| e.health != HealthStatus::Unhealthy)
            .filter(|e| match &e.vpn {
                Some(vpn_name) => self.vpn.status(vpn_name).map(|s| s.health == crate::vpn::VpnHealth::Healthy).unwrap_or(false),
                None => true,
            })
            .map(|e| {
                let pending = self.pending_for(&e.container_key);
                let effective_load = e.effective_load(pending);
                (e, effective_load)
            })
            .collect();

        ranked.sort_by(|(a, a_load), (b, b_load)| {
            a_load
                .cmp(b_load)
                .then_with(|| b.forwarded.cmp(&a.forwarded))
                .then_with(|| a.last_stream_usage_ms.cmp(&b.last_stream_usage_ms))
        });

        let picked = ranked
            .into_iter()
            .find(|(_, load)| *load < self.max_streams_per_engine);

        let (engine, _) = picked.ok_or(OrchestratorError::NoCapacity)?;

        *self.pending.entry(engine.container_key.clone()).or_insert(0) += 1;

        Ok(Selection { container_key: engine.container_key.clone(), host: engine.host.clone(), port: engine.internal_http_port })
    }

    /// Called once `stream_started` is emitted, or on failure, to undo the
    /// reservation made by `select` (spec §4.7).
    pub fn release_pending(&self, container_key: &str) {
        if let Some(mut count) = self.pending.get_mut(container_key) {
            *count = count.saturating_sub(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VpnConfig;
    use crate::runtime::fake::FakeRuntime;
    use crate::state::{Engine, InMemoryStatsStore};

    #[test]
    fn no_engines_returns_no_capacity() {
        let state = Arc::new(StateStore::new(Arc::new(InMemoryStatsStore::default())));
        let runtime = Arc::new(FakeRuntime::new());
        let vpn = VpnSupervisor::new(runtime, state.clone(), VpnConfig::default());
        let cfg = AutoscalerConfig { max_streams_per_engine: 1, ..Default::default() };
        let s = EngineSelector::new(state, vpn, &cfg);
        assert!(matches!(s.select(), Err(OrchestratorError::NoCapacity)));
    }

    #[test]
    fn picks_least_loaded_engine() {
        let state = Arc::new(StateStore::new(Arc::new(InMemoryStatsStore::default())));
        let runtime = Arc::new(FakeRuntime::new());
        let vpn = VpnSupervisor::new(runtime, state.clone(), VpnConfig::default());
        let cfg = AutoscalerConfig { max_streams_per_engine: 2, ..Default::default() };
        let selector = EngineSelector::new(state.clone(), vpn, &cfg);

        let mut e1 = Engine::new("c1".into(), "h1".into(), 1, 2);
        e1.starting = false;
        e1.active_streams.insert("s1".into());
        state.upsert_engine(e1);

        let mut e2 = Engine::new("c2".into(), "h2".into(), 1, 2);
        e2.starting = false;
        state.upsert_engine(e2);

        let picked = selector.select().unwrap();
        assert_eq!(picked.container_key, "c2");
    }

    #[test]
    fn pending_allocation_prevents_double_booking() {
        let state = Arc::new(StateStore::new(Arc::new(InMemoryStatsStore::default())));
        let runtime = Arc::new(FakeRuntime::new());
        let vpn = VpnSupervisor::new(runtime, state.clone(), VpnConfig::default());
        let cfg = AutoscalerConfig { max_streams_per_engine: 1, ..Default::default() };
        let selector = EngineSelector::new(state.clone(), vpn, &cfg);

        let mut e1 = Engine::new("c1".into(), "h1".into(), 1, 2);
        e1.starting = false;
        state.upsert_engine(e1);

        assert!(selector.select().is_ok());
        assert!(matches!(selector.select(), Err(OrchestratorError::NoCapacity)));
        selector.release_pending("c1");
        assert!(selector.select().is_ok());
    }
}
