//! Port allocator (spec §4.2, C2). Leases host/internal ports from
//! configured ranges, serialized per scope (spec §5: "no two leases on the
//! same scope can return the same port").

use crate::config::PortRangesConfig;
use crate::error::{OrchestratorError, Result};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Scope {
    Host,
    InternalHttp,
    InternalHttps,
    Vpn1Host,
    Vpn2Host,
}

struct ScopeState {
    range: (u16, u16),
    in_use: BTreeSet<u16>,
}

pub struct PortAllocator {
    scopes: Mutex<HashMap<Scope, ScopeState>>,
}

impl PortAllocator {
    pub fn new(ranges: &PortRangesConfig) -> Self {
        let mut scopes = HashMap::new();
        scopes.insert(Scope::Host, ScopeState { range: ranges.host, in_use: BTreeSet::new() });
        scopes.insert(
            Scope::InternalHttp,
            ScopeState { range: ranges.ace_http, in_use: BTreeSet::new() },
        );
        scopes.insert(
            Scope::InternalHttps,
            ScopeState { range: ranges.ace_https, in_use: BTreeSet::new() },
        );
        scopes.insert(
            Scope::Vpn1Host,
            ScopeState { range: ranges.gluetun_1, in_use: BTreeSet::new() },
        );
        scopes.insert(
            Scope::Vpn2Host,
            ScopeState { range: ranges.gluetun_2, in_use: BTreeSet::new() },
        );
        Self { scopes: Mutex::new(scopes) }
    }

    /// Picks the lowest free port in the range for `scope`.
    pub fn lease(&self, scope: Scope) -> Result<u16> {
        let mut scopes = self.scopes.lock();
        let state = scopes.get_mut(&scope).expect("scope configured at construction");
        let (low, high) = state.range;
        for port in low..=high {
            if !state.in_use.contains(&port) {
                state.in_use.insert(port);
                return Ok(port);
            }
        }
        Err(OrchestratorError::NoFreePort(format!("{:?}", scope)))
    }

    /// Idempotent: releasing a port that isn't leased is a no-op.
    pub fn release(&self, scope: Scope, port: u16) {
        if let Some(state) = self.scopes.lock().get_mut(&scope) {
            state.in_use.remove(&port);
        }
    }

    /// Called by the reconciler for every port found in a managed
    /// container's labels, so the allocator's view stays in sync with the
    /// runtime even across a restart (spec §4.9 / invariant #2 in §8).
    pub fn mark_in_use(&self, scope: Scope, port: u16) {
        if let Some(state) = self.scopes.lock().get_mut(&scope) {
            state.in_use.insert(port);
        }
    }

    pub fn is_in_use(&self, scope: Scope, port: u16) -> bool {
        self.scopes
            .lock()
            .get(&scope)
            .map(|s| s.in_use.contains(&port))
            .unwrap_or(false)
    }

    /// Picks the host-port scope for a VPN-mode lease (spec §4.2:
    /// "In redundant-VPN mode, host-port leases route to vpn1-host or
    /// vpn2-host based on the target VPN").
    pub fn host_scope_for_vpn(redundant: bool, vpn_index: Option<usize>) -> Scope {
        if !redundant {
            return Scope::Host;
        }
        match vpn_index {
            Some(0) => Scope::Vpn1Host,
            Some(1) => Scope::Vpn2Host,
            _ => Scope::Host,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocator() -> PortAllocator {
        let mut ranges = PortRangesConfig::default();
        ranges.host = (40000, 40002);
        PortAllocator::new(&ranges)
    }

    #[test]
    fn lease_picks_lowest_free_port() {
        let a = allocator();
        assert_eq!(a.lease(Scope::Host).unwrap(), 40000);
        assert_eq!(a.lease(Scope::Host).unwrap(), 40001);
    }

    #[test]
    fn lease_fails_when_exhausted() {
        let a = allocator();
        for _ in 0..3 {
            a.lease(Scope::Host).unwrap();
        }
        assert!(matches!(a.lease(Scope::Host), Err(OrchestratorError::NoFreePort(_))));
    }

    #[test]
    fn release_is_idempotent() {
        let a = allocator();
        let p = a.lease(Scope::Host).unwrap();
        a.release(Scope::Host, p);
        a.release(Scope::Host, p);
        assert!(!a.is_in_use(Scope::Host, p));
    }

    #[test]
    fn mark_in_use_then_lease_skips_it() {
        let a = allocator();
        a.mark_in_use(Scope::Host, 40000);
        assert_eq!(a.lease(Scope::Host).unwrap(), 40001);
    }

    #[test]
    fn no_two_leases_return_the_same_port() {
        let a = allocator();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..3 {
            assert!(seen.insert(a.lease(Scope::Host).unwrap()));
        }
    }
}
