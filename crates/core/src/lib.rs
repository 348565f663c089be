//! `orchestrator-core`: the AceStream engine pool control plane.
//!
//! This crate is the "core" half of the repository — the autoscaler,
//! VPN/health supervisors, circuit breaker, provisioner, reconciler,
//! event handlers, collector, and stream multiplexer. It has no
//! network-facing framework of its own; the `orchestrator` binary crate
//! wires an HTTP API shell around [`context::Context`].

pub mod autoscaler;
pub mod breaker;
pub mod collector;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod health;
pub mod multiplex;
pub mod ports;
pub mod provisioner;
pub mod reconciler;
pub mod runtime;
pub mod selector;
pub mod state;
pub mod vpn;

pub use context::Context;
pub use error::{OrchestratorError, Result};
