//! Circuit breaker (spec §4.6, C6). Per-operation-class breaker guarding
//! provisioning paths. A small `parking_lot::Mutex`-guarded state
//! machine per class rather than an actor.

use crate::config::BreakerConfig;
use crate::error::{OrchestratorError, Result};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Operation classes gated independently (spec §4.6: "at minimum:
/// general_provisioning and replacement_provisioning").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationClass {
    GeneralProvisioning,
    ReplacementProvisioning,
}

struct ClassState {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    threshold: u32,
}

pub struct CircuitBreaker {
    config: BreakerConfig,
    classes: DashMap<OperationClass, Mutex<ClassState>>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        let classes = DashMap::new();
        classes.insert(
            OperationClass::GeneralProvisioning,
            Mutex::new(ClassState {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                threshold: config.general_failure_threshold,
            }),
        );
        classes.insert(
            OperationClass::ReplacementProvisioning,
            Mutex::new(ClassState {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                threshold: config.replacement_failure_threshold,
            }),
        );
        Self { config, classes }
    }

    /// Checks whether an operation of this class may proceed, transitioning
    /// OPEN → HALF_OPEN once `recovery_timeout` has elapsed.
    pub fn check(&self, class: OperationClass) -> Result<()> {
        let entry = self.classes.get(&class).expect("class registered at construction");
        let mut st = entry.lock();
        match st.state {
            BreakerState::Closed => Ok(()),
            BreakerState::HalfOpen => Ok(()),
            BreakerState::Open => {
                let opened_at = st.opened_at.unwrap_or_else(Instant::now);
                let elapsed = opened_at.elapsed();
                if elapsed >= self.config.recovery_timeout {
                    st.state = BreakerState::HalfOpen;
                    info!(?class, "circuit breaker half-open");
                    Ok(())
                } else {
                    let recovery_eta_secs = (self.config.recovery_timeout - elapsed).as_secs();
                    Err(OrchestratorError::CircuitOpen { recovery_eta_secs })
                }
            }
        }
    }

    /// Callers report the outcome of every gated operation (spec §4.6).
    pub fn report(&self, class: OperationClass, success: bool) {
        let entry = self.classes.get(&class).expect("class registered at construction");
        let mut st = entry.lock();
        if success {
            if st.state != BreakerState::Closed {
                info!(?class, "circuit breaker closed");
            }
            st.state = BreakerState::Closed;
            st.consecutive_failures = 0;
            st.opened_at = None;
        } else {
            match st.state {
                BreakerState::HalfOpen => {
                    warn!(?class, "circuit breaker re-opened after half-open failure");
                    st.state = BreakerState::Open;
                    st.opened_at = Some(Instant::now());
                }
                BreakerState::Closed | BreakerState::Open => {
                    st.consecutive_failures += 1;
                    if st.consecutive_failures >= st.threshold {
                        if st.state != BreakerState::Open {
                            warn!(?class, failures = st.consecutive_failures, "circuit breaker opened");
                        }
                        st.state = BreakerState::Open;
                        st.opened_at = Some(Instant::now());
                    }
                }
            }
        }
    }

    pub fn state(&self, class: OperationClass) -> BreakerState {
        self.classes.get(&class).map(|e| e.lock().state).unwrap_or(BreakerState::Closed)
    }

    /// Administrative manual reset (spec §4.6).
    pub fn reset(&self, class: OperationClass) {
        if let Some(entry) = self.classes.get(&class) {
            let mut st = entry.lock();
            st.state = BreakerState::Closed;
            st.consecutive_failures = 0;
            st.opened_at = None;
        }
    }

    pub fn recovery_timeout(&self) -> Duration {
        self.config.recovery_timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(BreakerConfig {
            general_failure_threshold: 2,
            replacement_failure_threshold: 2,
            recovery_timeout: Duration::from_millis(20),
        })
    }

    #[test]
    fn opens_after_threshold_consecutive_failures() {
        let b = breaker();
        b.report(OperationClass::GeneralProvisioning, false);
        assert!(b.check(OperationClass::GeneralProvisioning).is_ok());
        b.report(OperationClass::GeneralProvisioning, false);
        assert!(matches!(
            b.check(OperationClass::GeneralProvisioning),
            Err(OrchestratorError::CircuitOpen { .. })
        ));
    }

    #[test]
    fn success_resets_failure_count() {
        let b = breaker();
        b.report(OperationClass::GeneralProvisioning, false);
        b.report(OperationClass::GeneralProvisioning, true);
        b.report(OperationClass::GeneralProvisioning, false);
        assert!(b.check(OperationClass::GeneralProvisioning).is_ok());
    }

    #[tokio::test]
    async fn half_open_after_recovery_timeout_then_failure_reopens() {
        let b = breaker();
        b.report(OperationClass::GeneralProvisioning, false);
        b.report(OperationClass::GeneralProvisioning, false);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(b.check(OperationClass::GeneralProvisioning).is_ok());
        assert_eq!(b.state(OperationClass::GeneralProvisioning), BreakerState::HalfOpen);
        b.report(OperationClass::GeneralProvisioning, false);
        assert_eq!(b.state(OperationClass::GeneralProvisioning), BreakerState::Open);
    }

    #[test]
    fn manual_reset_closes_breaker() {
        let b = breaker();
        b.report(OperationClass::GeneralProvisioning, false);
        b.report(OperationClass::GeneralProvisioning, false);
        b.reset(OperationClass::GeneralProvisioning);
        assert_eq!(b.state(OperationClass::GeneralProvisioning), BreakerState::Closed);
    }

    #[test]
    fn classes_are_independent() {
        let b = breaker();
        b.report(OperationClass::GeneralProvisioning, false);
        b.report(OperationClass::GeneralProvisioning, false);
        assert_eq!(b.state(OperationClass::ReplacementProvisioning), BreakerState::Closed);
    }
}
