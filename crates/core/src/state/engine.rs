//! Engine record (spec §3).

use crate::ports::Scope;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Unknown,
}

fn now_millis() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as i64
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Engine {
    pub container_key: String,
    pub host: String,
    pub external_port: u16,
    pub internal_http_port: u16,
    pub internal_https_port: Option<u16>,
    pub labels: HashMap<String, String>,
    pub vpn: Option<String>,
    /// Which port-allocator scope `external_port` was leased from (spec
    /// §4.2). Recorded at creation/restore time so release always targets
    /// the exact scope the lease came from, rather than re-deriving it from
    /// `vpn` (which can't by itself distinguish `Vpn1Host` from
    /// `Vpn2Host` in redundant mode).
    pub host_port_scope: Scope,
    pub forwarded: bool,
    pub health: HealthStatus,
    pub first_seen_ms: i64,
    pub last_seen_ms: i64,
    pub last_health_check_ms: Option<i64>,
    pub last_stream_usage_ms: Option<i64>,
    pub last_cache_cleanup_ms: Option<i64>,
    pub active_streams: HashSet<String>,
    pub consecutive_health_failures: u32,
    /// Set when the engine is running but not yet reconciled/stream-ready;
    /// the reconciler must not treat it as orphaned while transitioning.
    pub starting: bool,
}

impl Engine {
    pub fn new(container_key: String, host: String, external_port: u16, internal_http_port: u16) -> Self {
        let now = now_millis();
        Self {
            container_key,
            host,
            external_port,
            internal_http_port,
            internal_https_port: None,
            labels: HashMap::new(),
            vpn: None,
            host_port_scope: Scope::Host,
            forwarded: false,
            health: HealthStatus::Unknown,
            first_seen_ms: now,
            last_seen_ms: now,
            last_health_check_ms: None,
            last_stream_usage_ms: None,
            last_cache_cleanup_ms: None,
            active_streams: HashSet::new(),
            consecutive_health_failures: 0,
            starting: true,
        }
    }

    pub fn effective_load(&self, pending: usize) -> usize {
        self.active_streams.len() + pending
    }

    pub fn is_idle(&self) -> bool {
        self.active_streams.is_empty()
    }
}

pub(crate) fn now_ms() -> i64 {
    now_millis()
}
