//! Provisioner (spec §4.7 wording lives in §2's component table as C7;
//! behavior specified across §3 data model invariants and §4.8/4.9).
//! Owns every container create/stop/remove call so that port release and
//! label encoding stay centralized — "direct `stop()`+`remove()` bypassing
//! the provisioner is forbidden" (spec §4.8).

use crate::breaker::{CircuitBreaker, OperationClass};
use crate::config::{AutoscalerConfig, PortRangesConfig};
use crate::error::Result;
use crate::ports::{PortAllocator, Scope};
use crate::runtime::{ContainerState as RuntimeState, CreateSpec, PortBinding, Runtime};
use crate::state::{Engine, StateStore};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub const LABEL_ACE_HTTP_PORT: &str = "acestream.http_port";
pub const LABEL_ACE_HTTPS_PORT: &str = "acestream.https_port";
pub const LABEL_HOST_HTTP_PORT: &str = "host.http_port";
pub const LABEL_HOST_HTTPS_PORT: &str = "host.https_port";
pub const LABEL_VPN_CONTAINER: &str = "acestream.vpn_container";
pub const LABEL_FORWARDED: &str = "acestream.forwarded";

pub struct ProvisionRequest {
    pub image: String,
    pub name: String,
    pub vpn_container: Option<String>,
    pub vpn_index: Option<usize>,
    pub forwarded: bool,
    pub forwarded_port_env: Option<u32>,
    /// Marks this as an additive health-monitor replacement (spec §4.5),
    /// gating it behind the `replacement_provisioning` breaker class
    /// instead of `general_provisioning`.
    pub replacement: bool,
    pub extra_env: Vec<(String, String)>,
}

pub struct Provisioner {
    runtime: Arc<dyn Runtime>,
    state: Arc<StateStore>,
    ports: Arc<PortAllocator>,
    breaker: Arc<CircuitBreaker>,
    last_provision_at_ms: AtomicI64,
    min_provision_interval: Duration,
}

impl Provisioner {
    pub fn new(
        runtime: Arc<dyn Runtime>,
        state: Arc<StateStore>,
        ports: Arc<PortAllocator>,
        breaker: Arc<CircuitBreaker>,
        autoscaler: &AutoscalerConfig,
    ) -> Self {
        Self {
            runtime,
            state,
            ports,
            breaker,
            last_provision_at_ms: AtomicI64::new(0),
            min_provision_interval: autoscaler.min_provision_interval,
        }
    }

    fn class_for(&self, req: &ProvisionRequest) -> OperationClass {
        if req.replacement {
            OperationClass::ReplacementProvisioning
        } else {
            OperationClass::GeneralProvisioning
        }
    }

    /// Enforces `min_provision_interval` between starts (spec §4.8).
    async fn wait_for_rate_limit(&self) {
        let now = crate::state::engine::now_ms();
        let last = self.last_provision_at_ms.load(Ordering::SeqCst);
        let elapsed = now.saturating_sub(last);
        let min_ms = self.min_provision_interval.as_millis() as i64;
        if elapsed < min_ms {
            tokio::time::sleep(Duration::from_millis((min_ms - elapsed) as u64)).await;
        }
        self.last_provision_at_ms.store(crate::state::engine::now_ms(), Ordering::SeqCst);
    }

    /// Creates one engine: leases ports, builds labels, starts the
    /// container, registers it in state as `starting`.
    pub async fn provision(&self, req: ProvisionRequest) -> Result<Engine> {
        let class = self.class_for(&req);
        self.breaker.check(class)?;
        self.wait_for_rate_limit().await;

        let result = self.provision_inner(req).await;
        self.breaker.report(class, result.is_ok());
        result
    }

    async fn provision_inner(&self, req: ProvisionRequest) -> Result<Engine> {
        let redundant = req.vpn_index.is_some();
        let host_scope = PortAllocator::host_scope_for_vpn(redundant, req.vpn_index);

        let host_http_port = self.ports.lease(host_scope)?;
        let internal_http_port = self.ports.lease(Scope::InternalHttp)?;

        let mut labels = HashMap::new();
        labels.insert(LABEL_ACE_HTTP_PORT.to_string(), internal_http_port.to_string());
        labels.insert(LABEL_HOST_HTTP_PORT.to_string(), host_http_port.to_string());
        if let Some(vpn) = &req.vpn_container {
            labels.insert(LABEL_VPN_CONTAINER.to_string(), vpn.clone());
        }
        labels.insert(LABEL_FORWARDED.to_string(), req.forwarded.to_string());

        let mut env = req.extra_env.clone();
        if let Some(port) = req.forwarded_port_env {
            env.push(("P2P_PORT".to_string(), port.to_string()));
        }

        let spec = CreateSpec {
            image: req.image.clone(),
            name: req.name.clone(),
            labels,
            env,
            network_mode: req.vpn_container.clone().map(|c| format!("container:{c}")),
            port_bindings: vec![PortBinding { container_port: internal_http_port, host_port: host_http_port, protocol: "tcp" }],
            extra_hosts: Vec::new(),
        };

        let create_result = self.runtime.create(spec).await;
        let container_key = match create_result {
            Ok(key) => key,
            Err(err) => {
                self.ports.release(host_scope, host_http_port);
                self.ports.release(Scope::InternalHttp, internal_http_port);
                return Err(err);
            }
        };

        let mut engine = Engine::new(container_key.clone(), req.name.clone(), host_http_port, internal_http_port);
        engine.vpn = req.vpn_container.clone();
        engine.host_port_scope = host_scope;
        engine.forwarded = req.forwarded;
        self.state.upsert_engine(engine.clone());

        info!(container = %container_key, host_port = host_http_port, "provisioned engine");
        Ok(engine)
    }

    /// Stops and removes a container, releasing its ports. The only
    /// sanctioned path out of the runtime besides the reconciler's
    /// orphan-cleanup (spec §3 ownership note).
    pub async fn stop_and_remove(&self, container_key: &str) -> Result<()> {
        let engine = self.state.get_engine(container_key);

        self.runtime.stop(container_key, Duration::from_secs(15)).await?;
        self.runtime.remove(container_key).await?;

        if let Some(engine) = &engine {
            // Release from the exact scope the port was leased from (spec
            // §3 invariant: ports are released iff the engine is stopped by
            // the provisioner) — never re-derived, since in redundant mode
            // `engine.vpn` alone can't distinguish Vpn1Host from Vpn2Host.
            self.ports.release(engine.host_port_scope, engine.external_port);
            self.ports.release(Scope::InternalHttp, engine.internal_http_port);
            if let Some(https_port) = engine.internal_https_port {
                self.ports.release(Scope::InternalHttps, https_port);
            }
        }

        self.state.remove_engine(container_key);
        info!(container = %container_key, "stopped and removed engine");
        Ok(())
    }

    /// Runs a cache-clear exec inside the container (spec §4.10).
    pub async fn clear_cache(&self, container_key: &str) -> Result<()> {
        let (_, rc) = self.runtime.exec(container_key, &["rm", "-rf", "/tmp/acestream_cache"]).await?;
        if rc != 0 {
            warn!(container = %container_key, rc, "cache cleanup exec returned nonzero");
        }
        self.state.mark_cache_cleanup(container_key);
        Ok(())
    }

    pub fn is_managed_state(state: &RuntimeState) -> bool {
        matches!(state, RuntimeState::Running | RuntimeState::Restarting)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::fake::FakeRuntime;
    use crate::state::InMemoryStatsStore;

    fn provisioner() -> Provisioner {
        let runtime = Arc::new(FakeRuntime::new());
        let state = Arc::new(StateStore::new(Arc::new(InMemoryStatsStore::default())));
        let mut ranges = PortRangesConfig::default();
        ranges.host = (40000, 40010);
        let ports = Arc::new(PortAllocator::new(&ranges));
        let breaker = Arc::new(CircuitBreaker::new(crate::config::BreakerConfig::default()));
        Provisioner::new(runtime, state, ports, breaker, &AutoscalerConfig { min_provision_interval: Duration::from_millis(0), ..Default::default() })
    }

    #[tokio::test]
    async fn provision_then_stop_releases_ports() {
        let p = provisioner();
        let engine = p
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

        assert!(p.ports.is_in_use(Scope::Host, engine.external_port));
        p.stop_and_remove(&engine.container_key).await.unwrap();
        assert!(!p.ports.is_in_use(Scope::Host, engine.external_port));
        assert!(p.state.get_engine(&engine.container_key).is_none());
    }
}
