//! Docker control plane for single-host deployments.
//!
//! The unit is a container; the endpoint is a network alias on a
//! user-defined network shared with the workers.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, RemoveContainerOptions,
};
use bollard::models::{
    ContainerStateStatusEnum, EndpointSettings, HealthConfig, HealthStatusEnum, HostConfig,
};
use bollard::network::{ConnectNetworkOptions, CreateNetworkOptions, DisconnectNetworkOptions};
use chrono::{TimeZone, Utc};
use tokio::sync::RwLock;

use crate::config::SandboxConfig;
use crate::error::SandboxError;
use crate::sandbox::{
    APP_NAME, ComputeControlPlane, Deletion, LABEL_JOB_ID, LABEL_MANAGED_BY, LABEL_SANDBOX_ID,
    MANAGED_BY, ManagedUnit, SandboxSpec, UnitPhase, UnitStatus, endpoint_name, unit_name,
};

pub struct DockerControlPlane {
    network: String,
    /// Cached Docker connection (created on first use).
    docker: Arc<RwLock<Option<Docker>>>,
}

impl DockerControlPlane {
    pub fn new(config: &SandboxConfig) -> Self {
        Self {
            network: config.docker_network.clone(),
            docker: Arc::new(RwLock::new(None)),
        }
    }

    /// Get or create a Docker connection.
    async fn docker(&self) -> Result<Docker, SandboxError> {
        {
            let guard = self.docker.read().await;
            if let Some(ref d) = *guard {
                return Ok(d.clone());
            }
        }
        let docker = Docker::connect_with_local_defaults().map_err(|e| SandboxError::Api {
            reason: format!("failed to connect to Docker: {}", e),
            transient: true,
        })?;
        docker.ping().await.map_err(|e| docker_error("ping", e))?;
        *self.docker.write().await = Some(docker.clone());
        Ok(docker)
    }

    async fn ensure_network(&self, docker: &Docker) -> Result<(), SandboxError> {
        match docker.inspect_network::<String>(&self.network, None).await {
            Ok(_) => Ok(()),
            Err(e) if status_code(&e) == Some(404) => {
                let options = CreateNetworkOptions {
                    name: self.network.clone(),
                    driver: "bridge".to_string(),
                    ..Default::default()
                };
                match docker.create_network(options).await {
                    Ok(_) => {
                        tracing::info!(network = %self.network, "Created sandbox network");
                        Ok(())
                    }
                    // Lost a race with another creator.
                    Err(e) if status_code(&e) == Some(409) => Ok(()),
                    Err(e) => Err(docker_error("create network", e)),
                }
            }
            Err(e) => Err(docker_error("inspect network", e)),
        }
    }
}

fn status_code(e: &bollard::errors::Error) -> Option<u16> {
    match e {
        bollard::errors::Error::DockerResponseServerError { status_code, .. } => {
            Some(*status_code)
        }
        _ => None,
    }
}

fn docker_error(context: &str, e: bollard::errors::Error) -> SandboxError {
    let transient = match status_code(&e) {
        Some(code) => code >= 500,
        None => true,
    };
    SandboxError::Api {
        reason: format!("{}: {}", context, e),
        transient,
    }
}

/// Parse a Kubernetes-style memory quantity (`512Mi`, `4Gi`, `1G`) into bytes.
fn memory_bytes(quantity: &str) -> Option<i64> {
    let q = quantity.trim();
    let split = q.find(|c: char| !c.is_ascii_digit()).unwrap_or(q.len());
    let (digits, unit) = q.split_at(split);
    let n: i64 = digits.parse().ok()?;
    let multiplier: i64 = match unit {
        "" => 1,
        "Ki" => 1 << 10,
        "Mi" => 1 << 20,
        "Gi" => 1 << 30,
        "K" | "k" => 1_000,
        "M" => 1_000_000,
        "G" => 1_000_000_000,
        _ => return None,
    };
    n.checked_mul(multiplier)
}

/// Parse a CPU quantity (`500m`, `2`, `1.5`) into nano-CPUs.
fn nano_cpus(quantity: &str) -> Option<i64> {
    let q = quantity.trim();
    if let Some(milli) = q.strip_suffix('m') {
        return milli.parse::<i64>().ok().map(|m| m * 1_000_000);
    }
    q.parse::<f64>()
        .ok()
        .filter(|c| *c > 0.0)
        .map(|c| (c * 1e9) as i64)
}

fn container_status(state: Option<&bollard::models::ContainerState>) -> UnitStatus {
    let Some(state) = state else {
        return UnitStatus {
            phase: UnitPhase::Unknown,
            all_ready: false,
            message: None,
        };
    };
    let phase = match state.status {
        Some(ContainerStateStatusEnum::RUNNING) => UnitPhase::Running,
        Some(ContainerStateStatusEnum::CREATED | ContainerStateStatusEnum::RESTARTING) => {
            UnitPhase::Pending
        }
        Some(ContainerStateStatusEnum::EXITED | ContainerStateStatusEnum::DEAD) => {
            UnitPhase::Failed
        }
        _ => UnitPhase::Unknown,
    };
    let health = state.health.as_ref().and_then(|h| h.status);
    let all_ready = phase == UnitPhase::Running
        && matches!(
            health,
            None | Some(HealthStatusEnum::HEALTHY) | Some(HealthStatusEnum::NONE)
        );
    UnitStatus {
        phase,
        all_ready,
        message: state.error.clone().filter(|e| !e.is_empty()),
    }
}

#[async_trait]
impl ComputeControlPlane for DockerControlPlane {
    fn name(&self) -> &'static str {
        "docker"
    }

    fn endpoint_url(&self, endpoint_name: &str, port: u16) -> String {
        format!("http://{}:{}", endpoint_name, port)
    }

    async fn create_unit(&self, spec: &SandboxSpec) -> Result<(), SandboxError> {
        let docker = self.docker().await?;
        self.ensure_network(&docker).await?;

        let create_failed = |reason: String| SandboxError::CreateFailed {
            sandbox_id: spec.sandbox_id.clone(),
            reason,
        };

        let host_config = HostConfig {
            memory: memory_bytes(&spec.resources.memory_limit),
            nano_cpus: nano_cpus(&spec.resources.cpu_limit),
            cap_add: Some(vec!["SYS_ADMIN".to_string()]),
            shm_size: Some(1 << 30),
            security_opt: Some(vec!["no-new-privileges:true".to_string()]),
            ..Default::default()
        };

        let secs = |s: u32| i64::from(s) * 1_000_000_000;
        let healthcheck = HealthConfig {
            test: Some(vec![
                "CMD-SHELL".to_string(),
                format!(
                    "curl -fsS http://localhost:{}{} || exit 1",
                    spec.port, spec.readiness.path
                ),
            ]),
            interval: Some(secs(spec.readiness.period)),
            timeout: Some(secs(spec.readiness.timeout)),
            retries: Some(i64::from(spec.readiness.failure_threshold)),
            start_period: Some(secs(spec.readiness.initial_delay)),
            ..Default::default()
        };

        let container_config = Config {
            image: Some(spec.image.clone()),
            env: Some(
                spec.env
                    .iter()
                    .map(|(k, v)| format!("{}={}", k, v))
                    .collect(),
            ),
            labels: Some(spec.labels.clone().into_iter().collect()),
            exposed_ports: Some(HashMap::from([(
                format!("{}/tcp", spec.port),
                HashMap::new(),
            )])),
            healthcheck: Some(healthcheck),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.unit_name.clone(),
            ..Default::default()
        };

        let response = docker
            .create_container(Some(options), container_config)
            .await
            .map_err(|e| match status_code(&e) {
                Some(409) => SandboxError::AlreadyExists {
                    sandbox_id: spec.sandbox_id.clone(),
                    resource: "container".to_string(),
                },
                Some(code) if code < 500 => create_failed(e.to_string()),
                _ => docker_error("create container", e),
            })?;

        docker
            .start_container::<String>(&response.id, None)
            .await
            .map_err(|e| create_failed(format!("failed to start container: {}", e)))?;

        tracing::debug!(container = %spec.unit_name, "Created and started browser container");
        Ok(())
    }

    async fn create_endpoint(&self, spec: &SandboxSpec) -> Result<String, SandboxError> {
        let docker = self.docker().await?;
        let options = ConnectNetworkOptions {
            container: spec.unit_name.clone(),
            endpoint_config: EndpointSettings {
                aliases: Some(vec![spec.endpoint_name.clone()]),
                ..Default::default()
            },
        };
        docker
            .connect_network(&self.network, options)
            .await
            .map_err(|e| SandboxError::CreateFailed {
                sandbox_id: spec.sandbox_id.clone(),
                reason: format!("failed to attach to network {}: {}", self.network, e),
            })?;
        Ok(self.endpoint_url(&spec.endpoint_name, spec.port))
    }

    async fn unit_status(&self, unit_name: &str) -> Result<UnitStatus, SandboxError> {
        let docker = self.docker().await?;
        let info = docker
            .inspect_container(unit_name, None)
            .await
            .map_err(|e| match status_code(&e) {
                Some(404) => SandboxError::Api {
                    reason: format!("container {} not found", unit_name),
                    transient: false,
                },
                _ => docker_error("inspect container", e),
            })?;
        Ok(container_status(info.state.as_ref()))
    }

    async fn delete_unit(&self, unit_name: &str) -> Result<Deletion, SandboxError> {
        let docker = self.docker().await?;
        match docker
            .remove_container(
                unit_name,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => Ok(Deletion::Deleted),
            Err(e) if status_code(&e) == Some(404) => Ok(Deletion::AlreadyAbsent),
            Err(e) => Err(docker_error("remove container", e)),
        }
    }

    async fn delete_endpoint(&self, endpoint_name: &str) -> Result<Deletion, SandboxError> {
        let prefix = format!("{}-svc-", APP_NAME);
        let Some(sandbox_id) = endpoint_name.strip_prefix(&prefix) else {
            return Ok(Deletion::AlreadyAbsent);
        };
        let docker = self.docker().await?;
        let options = DisconnectNetworkOptions {
            container: unit_name(sandbox_id),
            force: true,
        };
        match docker.disconnect_network(&self.network, options).await {
            Ok(()) => Ok(Deletion::Deleted),
            // Removing the container already dropped its alias.
            Err(e) if status_code(&e) == Some(404) => Ok(Deletion::AlreadyAbsent),
            Err(e) => Err(docker_error("disconnect network", e)),
        }
    }

    async fn list_units(&self) -> Result<Vec<ManagedUnit>, SandboxError> {
        let docker = self.docker().await?;
        let options = ListContainersOptions::<String> {
            all: true,
            filters: HashMap::from([(
                "label".to_string(),
                vec![format!("{}={}", LABEL_MANAGED_BY, MANAGED_BY)],
            )]),
            ..Default::default()
        };
        let containers = docker
            .list_containers(Some(options))
            .await
            .map_err(|e| docker_error("list containers", e))?;

        Ok(containers
            .into_iter()
            .filter_map(|c| {
                let name = c
                    .names
                    .as_ref()
                    .and_then(|n| n.first())
                    .map(|n| n.trim_start_matches('/').to_string())?;
                let labels = c.labels.unwrap_or_default();
                let sandbox_id = labels.get(LABEL_SANDBOX_ID).cloned();
                Some(ManagedUnit {
                    endpoint_name: sandbox_id
                        .as_deref()
                        .map(endpoint_name)
                        .unwrap_or_else(|| format!("{}-svc", name)),
                    job_id: labels.get(LABEL_JOB_ID).and_then(|v| v.parse().ok()),
                    sandbox_id,
                    unit_name: name,
                    created_at: c.created.and_then(|t| Utc.timestamp_opt(t, 0).single()),
                })
            })
            .collect())
    }
}
