//! In-memory `Runtime` used by unit and integration tests so the control
//! plane's logic can be exercised without a live Docker daemon, matching
//! the live adapter's call shape so tests exercise the same code paths.

use super::{ContainerRef, ContainerStats, CreateSpec, Inspect, Runtime, MANAGED_LABEL, MANAGED_LABEL_VALUE};
use crate::error::{OrchestratorError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
struct FakeContainer {
    name: String,
    labels: HashMap<String, String>,
    running: bool,
}

/// A fake `Runtime` with injectable unavailability, for exercising the
/// reconciler's "runtime down for N ticks" path (spec §8 boundary case).
#[derive(Clone)]
pub struct FakeRuntime {
    containers: Arc<Mutex<HashMap<String, FakeContainer>>>,
    next_id: Arc<AtomicU64>,
    unavailable: Arc<std::sync::atomic::AtomicBool>,
}

impl Default for FakeRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self {
            containers: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
            unavailable: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        }
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Test hook: flip a container's Docker-reported health without going
    /// through the exec/inspect path (used by health-monitor tests).
    pub fn set_container_running(&self, key: &str, running: bool) {
        if let Some(c) = self.containers.lock().get_mut(key) {
            c.running = running;
        }
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(OrchestratorError::RuntimeUnavailable("fake runtime offline".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Runtime for FakeRuntime {
    async fn create(&self, spec: CreateSpec) -> Result<String> {
        self.check_available()?;
        let id = format!("fake-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let mut labels = spec.labels.clone();
        labels.insert(MANAGED_LABEL.to_string(), MANAGED_LABEL_VALUE.to_string());
        self.containers.lock().insert(
            id.clone(),
            FakeContainer { name: spec.name, labels, running: true },
        );
        Ok(id)
    }

    async fn stop(&self, container_key: &str, _timeout: Duration) -> Result<()> {
        self.check_available()?;
        match self.containers.lock().get_mut(container_key) {
            Some(c) => {
                c.running = false;
                Ok(())
            }
            None => Err(OrchestratorError::ContainerNotFound(container_key.to_string())),
        }
    }

    async fn remove(&self, container_key: &str) -> Result<()> {
        self.check_available()?;
        self.containers
            .lock()
            .remove(container_key)
            .map(|_| ())
            .ok_or_else(|| OrchestratorError::ContainerNotFound(container_key.to_string()))
    }

    async fn restart(&self, container_key: &str, _timeout: Duration) -> Result<()> {
        self.check_available()?;
        match self.containers.lock().get_mut(container_key) {
            Some(c) => {
                c.running = true;
                Ok(())
            }
            None => Err(OrchestratorError::ContainerNotFound(container_key.to_string())),
        }
    }

    async fn inspect(&self, container_key: &str) -> Result<Inspect> {
        self.check_available()?;
        let containers = self.containers.lock();
        let c = containers
            .get(container_key)
            .ok_or_else(|| OrchestratorError::ContainerNotFound(container_key.to_string()))?;
        Ok(Inspect {
            state: if c.running {
                super::ContainerState::Running
            } else {
                super::ContainerState::Exited
            },
            healthy: Some(c.running),
            labels: c.labels.clone(),
        })
    }

    async fn list_managed(&self) -> Result<Vec<ContainerRef>> {
        self.check_available()?;
        Ok(self
            .containers
            .lock()
            .iter()
            .map(|(key, c)| ContainerRef {
                key: key.clone(),
                name: c.name.clone(),
                labels: c.labels.clone(),
            })
            .collect())
    }

    async fn exec(&self, container_key: &str, _argv: &[&str]) -> Result<(String, i64)> {
        self.check_available()?;
        if self.containers.lock().contains_key(container_key) {
            Ok((String::new(), 0))
        } else {
            Err(OrchestratorError::ContainerNotFound(container_key.to_string()))
        }
    }

    async fn stats_batch(
        &self,
        _container_keys: Option<&[String]>,
    ) -> Result<HashMap<String, ContainerStats>> {
        self.check_available()?;
        Ok(self
            .containers
            .lock()
            .keys()
            .map(|k| (k.clone(), ContainerStats::default()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_then_list_roundtrip() {
        let rt = FakeRuntime::new();
        let id = rt
            .create(CreateSpec { image: "acestream".into(), name: "e1".into(), ..Default::default() })
            .await
            .unwrap();
        let listed = rt.list_managed().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].key, id);
    }

    #[tokio::test]
    async fn unavailable_surfaces_on_every_call() {
        let rt = FakeRuntime::new();
        rt.set_unavailable(true);
        assert!(matches!(
            rt.list_managed().await,
            Err(OrchestratorError::RuntimeUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn stop_then_remove_releases_container() {
        let rt = FakeRuntime::new();
        let id = rt
            .create(CreateSpec { image: "acestream".into(), name: "e1".into(), ..Default::default() })
            .await
            .unwrap();
        rt.stop(&id, Duration::from_secs(5)).await.unwrap();
        rt.remove(&id).await.unwrap();
        assert!(rt.list_managed().await.unwrap().is_empty());
    }
}
