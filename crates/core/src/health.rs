//! Health monitor (spec §4.5, C5). Probes every running engine on a
//! fixed interval and decides which unhealthy engines are safe to
//! replace, subject to the autoscaler's pool-wide constraints.

use crate::config::HealthConfig;
use crate::state::{EngineFilter, HealthStatus, StateStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

/// An engine that has crossed the failure threshold and is a candidate
/// for additive replacement (spec §4.5 replacement policy).
#[derive(Debug, Clone)]
pub struct ReplacementCandidate {
    pub container_key: String,
    pub vpn: Option<String>,
}

pub struct HealthMonitor {
    state: Arc<StateStore>,
    http: reqwest::Client,
    config: HealthConfig,
    last_replacement_started: parking_lot::Mutex<Option<tokio::time::Instant>>,
    candidates_tx: mpsc::UnboundedSender<ReplacementCandidate>,
    candidates_rx: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<ReplacementCandidate>>>,
}

impl HealthMonitor {
    pub fn new(state: Arc<StateStore>, config: HealthConfig) -> Arc<Self> {
        let (candidates_tx, candidates_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            state,
            http: reqwest::Client::builder()
                .timeout(config.probe_timeout)
                .build()
                .expect("health http client"),
            config,
            last_replacement_started: parking_lot::Mutex::new(None),
            candidates_tx,
            candidates_rx: parking_lot::Mutex::new(Some(candidates_rx)),
        })
    }

    /// Hands ownership of this monitor's replacement-candidate stream to
    /// the caller (the autoscaler, at context wiring time — spec §9).
    /// Returns `None` if already taken.
    pub fn take_candidates(&self) -> Option<mpsc::UnboundedReceiver<ReplacementCandidate>> {
        self.candidates_rx.lock().take()
    }

    pub fn spawn(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.config.check_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        this.tick().await;
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            info!("health monitor shutting down");
                            break;
                        }
                    }
                }
            }
        });
    }

    /// Runs one pass over every known engine, returning engines newly
    /// marked as replacement candidates this tick.
    pub async fn tick(&self) -> Vec<ReplacementCandidate> {
        let engines = self.state.list_engines(&EngineFilter::default());
        let mut candidates = Vec::new();

        for engine in engines {
            if engine.starting {
                continue;
            }
            let url = format!(
                "http://{}:{}/server/api?api_version=3&method=get_status",
                engine.host, engine.internal_http_port
            );

            let healthy = match self.http.get(&url).send().await {
                Ok(resp) if resp.status().is_success() => resp.json::<serde_json::Value>().await.is_ok(),
                _ => false,
            };

            if healthy {
                self.state.set_health(&engine.container_key, HealthStatus::Healthy);
            } else {
                let failures = self.state.record_health_failure(&engine.container_key);
                if failures >= self.config.failure_threshold {
                    self.state.set_health(&engine.container_key, HealthStatus::Unhealthy);
                    warn!(engine = %engine.container_key, failures, "engine marked unhealthy");
                    let candidate = ReplacementCandidate { container_key: engine.container_key.clone(), vpn: engine.vpn.clone() };
                    let _ = self.candidates_tx.send(candidate.clone());
                    candidates.push(candidate);
                }
            }
        }

        candidates
    }

    /// Gate used by the autoscaler before starting a replacement (spec
    /// §4.5): sufficient remaining healthy count and cooldown respected.
    /// The "new engine is healthy" half of the conjunction is checked by
    /// the autoscaler itself once the replacement engine reports in.
    pub fn may_start_replacement(&self) -> bool {
        let healthy_count = self
            .state
            .list_engines(&EngineFilter { health: Some(HealthStatus::Healthy), ..Default::default() })
            .len();

        if healthy_count < self.config.min_healthy {
            return false;
        }

        let mut last = self.last_replacement_started.lock();
        let now = tokio::time::Instant::now();
        if let Some(prev) = *last {
            if now.duration_since(prev) < self.config.replacement_cooldown {
                return false;
            }
        }
        *last = Some(now);
        true
    }

    pub fn probe_timeout(&self) -> Duration {
        self.config.probe_timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{Engine, InMemoryStatsStore};

    fn store() -> Arc<StateStore> {
        Arc::new(StateStore::new(Arc::new(InMemoryStatsStore::default())))
    }

    #[tokio::test]
    async fn unreachable_engine_becomes_candidate_after_threshold() {
        let state = store();
        let mut e = Engine::new("c1".into(), "127.0.0.1".into(), 1, 59999);
        e.starting = false;
        state.upsert_engine(e);

        let monitor = HealthMonitor::new(state.clone(), HealthConfig { failure_threshold: 2, ..Default::default() });
        assert!(monitor.tick().await.is_empty());
        let candidates = monitor.tick().await;
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].container_key, "c1");
    }

    #[tokio::test]
    async fn starting_engines_are_skipped() {
        let state = store();
        state.upsert_engine(Engine::new("c1".into(), "127.0.0.1".into(), 1, 59999));
        let monitor = HealthMonitor::new(state, HealthConfig { failure_threshold: 1, ..Default::default() });
        assert!(monitor.tick().await.is_empty());
    }

    #[tokio::test]
    async fn replacement_gate_respects_min_healthy() {
        let state = store();
        let monitor = HealthMonitor::new(state, HealthConfig { min_healthy: 1, ..Default::default() });
        assert!(!monitor.may_start_replacement());
    }

    #[tokio::test]
    async fn candidates_are_published_on_the_take_candidates_channel() {
        let state = store();
        let mut e = Engine::new("c1".into(), "127.0.0.1".into(), 1, 59999);
        e.starting = false;
        state.upsert_engine(e);

        let monitor = HealthMonitor::new(state, HealthConfig { failure_threshold: 1, ..Default::default() });
        let mut rx = monitor.take_candidates().expect("not yet taken");
        assert!(monitor.take_candidates().is_none());

        monitor.tick().await;
        let candidate = rx.try_recv().expect("candidate published");
        assert_eq!(candidate.container_key, "c1");
    }
}
