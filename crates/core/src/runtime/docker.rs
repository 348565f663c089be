//! `bollard`-backed `Runtime` implementation: connection setup and error
//! mapping around `bollard::Docker`, with `Config`/`HostConfig`
//! construction for `create_container` covering port bindings and
//! `network_mode: container:<id>` sharing for VPN-routed engines.

use super::{
    ContainerRef, ContainerState, ContainerStats, CreateSpec, Inspect, Runtime, MANAGED_LABEL,
    MANAGED_LABEL_VALUE,
};
use crate::error::{OrchestratorError, Result};
use async_trait::async_trait;
use bollard::container::{Config, CreateContainerOptions, RemoveContainerOptions};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::models::{HostConfig, PortBinding as BollardPortBinding};
use bollard::query_parameters::{
    InspectContainerOptions, ListContainersOptions, RestartContainerOptions, StatsOptions,
    StopContainerOptions,
};
use bollard::Docker;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct DockerRuntime {
    client: Docker,
}

impl DockerRuntime {
    pub fn new(socket_path: &str) -> Result<Self> {
        let client = if socket_path.is_empty() {
            Docker::connect_with_defaults()
        } else {
            Docker::connect_with_socket(socket_path, 120, &bollard::API_DEFAULT_VERSION)
        }
        .map_err(|e| OrchestratorError::RuntimeUnavailable(e.to_string()))?;
        Ok(Self { client })
    }

    fn map_err(e: bollard::errors::Error, container_key: &str) -> OrchestratorError {
        match &e {
            bollard::errors::Error::DockerResponseServerError { status_code: 404, .. } => {
                OrchestratorError::ContainerNotFound(container_key.to_string())
            }
            bollard::errors::Error::HyperResponseError(_)
            | bollard::errors::Error::RequestTimeoutError => {
                OrchestratorError::RuntimeUnavailable(e.to_string())
            }
            _ => OrchestratorError::Docker(e),
        }
    }
}

#[async_trait]
impl Runtime for DockerRuntime {
    async fn create(&self, spec: CreateSpec) -> Result<String> {
        let mut labels = spec.labels.clone();
        labels.insert(MANAGED_LABEL.to_string(), MANAGED_LABEL_VALUE.to_string());

        let mut port_bindings: HashMap<String, Option<Vec<BollardPortBinding>>> = HashMap::new();
        let mut exposed_ports: HashMap<String, HashMap<(), ()>> = HashMap::new();
        for binding in &spec.port_bindings {
            let key = format!("{}/{}", binding.container_port, binding.protocol);
            port_bindings.insert(
                key.clone(),
                Some(vec![BollardPortBinding {
                    host_ip: None,
                    host_port: Some(binding.host_port.to_string()),
                }]),
            );
            exposed_ports.insert(key, HashMap::new());
        }

        let host_config = HostConfig {
            port_bindings: if port_bindings.is_empty() { None } else { Some(port_bindings) },
            network_mode: spec.network_mode.clone(),
            extra_hosts: if spec.extra_hosts.is_empty() { None } else { Some(spec.extra_hosts.clone()) },
            ..Default::default()
        };

        let env: Vec<String> = spec
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let config = Config {
            image: Some(spec.image.clone()),
            labels: Some(labels),
            env: Some(env),
            exposed_ports: if exposed_ports.is_empty() { None } else { Some(exposed_ports) },
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: Some(spec.name.clone()),
            ..Default::default()
        };

        let response = self
            .client
            .create_container(Some(options), config)
            .await
            .map_err(|e| Self::map_err(e, &spec.name))?;

        self.client
            .start_container(&response.id, None::<bollard::query_parameters::StartContainerOptions>)
            .await
            .map_err(|e| Self::map_err(e, &response.id))?;

        Ok(response.id)
    }

    async fn stop(&self, container_key: &str, timeout: Duration) -> Result<()> {
        let options = Some(StopContainerOptions {
            t: Some(timeout.as_secs() as i32),
            ..Default::default()
        });
        self.client
            .stop_container(container_key, options)
            .await
            .map_err(|e| Self::map_err(e, container_key))
    }

    async fn remove(&self, container_key: &str) -> Result<()> {
        let options = Some(RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        });
        self.client
            .remove_container(container_key, options)
            .await
            .map_err(|e| Self::map_err(e, container_key))
    }

    async fn restart(&self, container_key: &str, timeout: Duration) -> Result<()> {
        let options = Some(RestartContainerOptions {
            t: Some(timeout.as_secs() as i32),
            ..Default::default()
        });
        self.client
            .restart_container(container_key, options)
            .await
            .map_err(|e| Self::map_err(e, container_key))
    }

    async fn inspect(&self, container_key: &str) -> Result<Inspect> {
        let details = self
            .client
            .inspect_container(container_key, None::<InspectContainerOptions>)
            .await
            .map_err(|e| Self::map_err(e, container_key))?;

        let state = match details.state.as_ref().and_then(|s| s.status) {
            Some(bollard::models::ContainerStateStatusEnum::RUNNING) => ContainerState::Running,
            Some(bollard::models::ContainerStateStatusEnum::RESTARTING) => ContainerState::Restarting,
            Some(bollard::models::ContainerStateStatusEnum::EXITED) => ContainerState::Exited,
            _ => ContainerState::Unknown,
        };

        let healthy = details
            .state
            .as_ref()
            .and_then(|s| s.health.as_ref())
            .and_then(|h| h.status)
            .map(|status| status == bollard::models::HealthStatusEnum::HEALTHY);

        let labels = details
            .config
            .as_ref()
            .and_then(|c| c.labels.clone())
            .unwrap_or_default();

        Ok(Inspect { state, healthy, labels })
    }

    async fn list_managed(&self) -> Result<Vec<ContainerRef>> {
        let mut filters = HashMap::new();
        filters.insert(
            "label".to_string(),
            vec![format!("{}={}", MANAGED_LABEL, MANAGED_LABEL_VALUE)],
        );
        let options = Some(ListContainersOptions { all: true, filters, ..Default::default() });

        let containers = self
            .client
            .list_containers(options)
            .await
            .map_err(|e| Self::map_err(e, "list"))?;

        Ok(containers
            .into_iter()
            .map(|c| ContainerRef {
                key: c.id.unwrap_or_default(),
                name: c.names.and_then(|n| n.into_iter().next()).unwrap_or_default(),
                labels: c.labels.unwrap_or_default(),
            })
            .collect())
    }

    async fn exec(&self, container_key: &str, argv: &[&str]) -> Result<(String, i64)> {
        let exec = self
            .client
            .create_exec(
                container_key,
                CreateExecOptions {
                    cmd: Some(argv.iter().map(|s| s.to_string()).collect()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| Self::map_err(e, container_key))?;

        let mut output = String::new();
        if let StartExecResults::Attached { mut output: stream, .. } = self
            .client
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| Self::map_err(e, container_key))?
        {
            while let Some(Ok(chunk)) = stream.next().await {
                output.push_str(&chunk.to_string());
            }
        }

        let inspect = self
            .client
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| Self::map_err(e, container_key))?;

        Ok((output, inspect.exit_code.unwrap_or(-1)))
    }

    async fn stats_batch(
        &self,
        container_keys: Option<&[String]>,
    ) -> Result<HashMap<String, ContainerStats>> {
        let keys: Vec<String> = match container_keys {
            Some(k) => k.to_vec(),
            None => self.list_managed().await?.into_iter().map(|c| c.key).collect(),
        };

        let mut result = HashMap::new();
        for key in keys {
            let options = Some(StatsOptions { stream: false, ..Default::default() });
            let mut stream = self.client.stats(&key, options);
            if let Some(Ok(snapshot)) = stream.next().await {
                let cpu_percent = compute_cpu_percent(&snapshot);
                let mem_bytes = snapshot.memory_stats.as_ref().and_then(|m| m.usage).unwrap_or(0);
                let (net_rx, net_tx) = snapshot
                    .networks
                    .as_ref()
                    .map(|nets| {
                        nets.values().fold((0u64, 0u64), |(rx, tx), n| {
                            (rx + n.rx_bytes.unwrap_or(0), tx + n.tx_bytes.unwrap_or(0))
                        })
                    })
                    .unwrap_or((0, 0));

                result.insert(
                    key,
                    ContainerStats {
                        cpu_percent,
                        mem_bytes,
                        net_rx_bytes: net_rx,
                        net_tx_bytes: net_tx,
                        io_read_bytes: 0,
                        io_write_bytes: 0,
                    },
                );
            }
        }
        Ok(result)
    }
}

fn compute_cpu_percent(stats: &bollard::models::ContainerStatsResponse) -> f64 {
    let cpu = match &stats.cpu_stats {
        Some(c) => c,
        None => return 0.0,
    };
    let precpu = match &stats.precpu_stats {
        Some(p) => p,
        None => return 0.0,
    };

    let cpu_delta = cpu
        .cpu_usage
        .as_ref()
        .and_then(|u| u.total_usage)
        .unwrap_or(0) as f64
        - precpu.cpu_usage.as_ref().and_then(|u| u.total_usage).unwrap_or(0) as f64;
    let system_delta =
        cpu.system_cpu_usage.unwrap_or(0) as f64 - precpu.system_cpu_usage.unwrap_or(0) as f64;
    let online_cpus = cpu.online_cpus.unwrap_or(1).max(1) as f64;

    if system_delta > 0.0 && cpu_delta > 0.0 {
        (cpu_delta / system_delta) * online_cpus * 100.0
    } else {
        0.0
    }
}
