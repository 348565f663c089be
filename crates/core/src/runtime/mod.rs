//! Runtime adapter (spec §4.1, C1) — thin interface to the container
//! runtime. Everything else in the control plane depends on the `Runtime`
//! trait, never on `bollard` directly, so it can be driven against
//! `FakeRuntime` in tests, both wrapping their backend behind this
//! crate's own error type.

pub mod docker;
pub mod fake;

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

pub use docker::DockerRuntime;
pub use fake::FakeRuntime;

/// Default timeout for runtime RPCs that aren't VPN-adjacent (spec §5 table).
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(15);
/// Timeout for VPN-adjacent runtime RPCs (spec §5 table).
pub const VPN_RPC_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct PortBinding {
    pub container_port: u16,
    pub host_port: u16,
    /// "tcp" or "udp"
    pub protocol: &'static str,
}

#[derive(Debug, Clone, Default)]
pub struct CreateSpec {
    pub image: String,
    pub name: String,
    pub labels: HashMap<String, String>,
    pub env: Vec<(String, String)>,
    /// `None` = bridge network; `Some(container)` = share another
    /// container's network namespace (VPN mode).
    pub network_mode: Option<String>,
    pub port_bindings: Vec<PortBinding>,
    pub extra_hosts: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerState {
    Running,
    Restarting,
    Exited,
    Unknown,
}

#[derive(Debug, Clone)]
pub struct Inspect {
    pub state: ContainerState,
    /// Docker's own `HEALTHY`/`UNHEALTHY`/`NONE` health check, if the
    /// image defines one. `None` if the image has no HEALTHCHECK.
    pub healthy: Option<bool>,
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct ContainerRef {
    pub key: String,
    pub name: String,
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct ContainerStats {
    pub cpu_percent: f64,
    pub mem_bytes: u64,
    pub net_rx_bytes: u64,
    pub net_tx_bytes: u64,
    pub io_read_bytes: u64,
    pub io_write_bytes: u64,
}

/// Management label used to filter containers owned by this orchestrator
/// (spec §6: "Container labels owned by this system").
pub const MANAGED_LABEL: &str = "orchestrator.managed";
pub const MANAGED_LABEL_VALUE: &str = "acestream";

#[async_trait]
pub trait Runtime: Send + Sync {
    async fn create(&self, spec: CreateSpec) -> crate::error::Result<String>;
    async fn stop(&self, container_key: &str, timeout: Duration) -> crate::error::Result<()>;
    async fn remove(&self, container_key: &str) -> crate::error::Result<()>;
    async fn restart(&self, container_key: &str, timeout: Duration) -> crate::error::Result<()>;
    async fn inspect(&self, container_key: &str) -> crate::error::Result<Inspect>;
    async fn list_managed(&self) -> crate::error::Result<Vec<ContainerRef>>;
    async fn exec(&self, container_key: &str, argv: &[&str]) -> crate::error::Result<(String, i64)>;
    async fn stats_batch(
        &self,
        container_keys: Option<&[String]>,
    ) -> crate::error::Result<HashMap<String, ContainerStats>>;
}
