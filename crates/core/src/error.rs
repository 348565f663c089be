//! Shared error taxonomy for the control plane (spec §7).
//!
//! One enum covers every component; callers match on variants rather than
//! on component-specific error types, since the API layer needs to map all
//! of them to the wire shape in spec §6/§7 in one place.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("container runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    #[error("container not found: {0}")]
    ContainerNotFound(String),

    #[error("no free port in scope {0}")]
    NoFreePort(String),

    #[error("vpn unhealthy: {0}")]
    VpnUnhealthy(String),

    #[error("circuit open, retry after {recovery_eta_secs}s")]
    CircuitOpen { recovery_eta_secs: u64 },

    #[error("no engine capacity available")]
    NoCapacity,

    #[error("upstream fetch failed: {0}")]
    UpstreamFetchFailed(String),

    #[error("engine unhealthy: {0}")]
    EngineUnhealthy(String),

    #[error("stream not found: {0}")]
    StreamNotFound(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("docker error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Structured codes used by the §6 wire shape
/// `{code, message, recovery_eta_seconds, can_retry, should_wait}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    VpnDisconnected,
    CircuitBreaker,
    MaxCapacity,
    VpnError,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::VpnDisconnected => "vpn_disconnected",
            ErrorCode::CircuitBreaker => "circuit_breaker",
            ErrorCode::MaxCapacity => "max_capacity",
            ErrorCode::VpnError => "vpn_error",
        }
    }
}

impl OrchestratorError {
    /// Best-effort mapping into the provisioning error code family (§6).
    /// Returns `None` for errors that surface as a plain 500 instead.
    pub fn provisioning_code(&self) -> Option<ErrorCode> {
        match self {
            OrchestratorError::VpnUnhealthy(_) => Some(ErrorCode::VpnDisconnected),
            OrchestratorError::CircuitOpen { .. } => Some(ErrorCode::CircuitBreaker),
            OrchestratorError::NoCapacity => Some(ErrorCode::MaxCapacity),
            _ => None,
        }
    }
}
