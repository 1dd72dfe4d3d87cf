//! Kubernetes control plane: one pod plus one ClusterIP service per sandbox.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    Capabilities, Container, ContainerPort, EmptyDirVolumeSource, EnvVar, HTTPGetAction, Pod,
    PodSecurityContext, PodSpec, Probe, ResourceRequirements, SecurityContext, Service,
    ServicePort, ServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::Api;
use kube::api::{DeleteParams, ListParams, PostParams};

use crate::config::SandboxConfig;
use crate::error::SandboxError;
use crate::sandbox::{
    ComputeControlPlane, Deletion, LABEL_JOB_ID, LABEL_MANAGED_BY, LABEL_SANDBOX_ID, MANAGED_BY,
    ManagedUnit, ProbeTiming, SandboxSpec, UnitPhase, UnitStatus, endpoint_name,
};

const DELETE_GRACE_SECS: u32 = 30;

pub struct KubernetesControlPlane {
    client: kube::Client,
    namespace: String,
    service_account: String,
}

impl KubernetesControlPlane {
    /// Connect using in-cluster config or the local kubeconfig.
    pub async fn connect(config: &SandboxConfig) -> Result<Self, SandboxError> {
        let client = kube::Client::try_default()
            .await
            .map_err(|e| SandboxError::Api {
                reason: format!("failed to create Kubernetes client: {}", e),
                transient: false,
            })?;
        tracing::info!(namespace = %config.namespace, "Connected to Kubernetes");
        Ok(Self::with_client(client, config))
    }

    pub fn with_client(client: kube::Client, config: &SandboxConfig) -> Self {
        Self {
            client,
            namespace: config.namespace.clone(),
            service_account: config.service_account.clone(),
        }
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn services(&self) -> Api<Service> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn pod_for(&self, spec: &SandboxSpec) -> Pod {
        let quantities = |cpu: &str, memory: &str| {
            BTreeMap::from([
                ("cpu".to_string(), Quantity(cpu.to_string())),
                ("memory".to_string(), Quantity(memory.to_string())),
            ])
        };

        let container = Container {
            name: "browser".to_string(),
            image: Some(spec.image.clone()),
            image_pull_policy: Some("IfNotPresent".to_string()),
            ports: Some(vec![ContainerPort {
                container_port: i32::from(spec.port),
                name: Some("http".to_string()),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            env: Some(
                spec.env
                    .iter()
                    .map(|(name, value)| EnvVar {
                        name: name.clone(),
                        value: Some(value.clone()),
                        ..Default::default()
                    })
                    .collect(),
            ),
            resources: Some(ResourceRequirements {
                requests: Some(quantities(
                    &spec.resources.cpu_request,
                    &spec.resources.memory_request,
                )),
                limits: Some(quantities(
                    &spec.resources.cpu_limit,
                    &spec.resources.memory_limit,
                )),
                ..Default::default()
            }),
            readiness_probe: Some(http_probe(&spec.readiness, spec.port)),
            liveness_probe: Some(http_probe(&spec.liveness, spec.port)),
            security_context: Some(SecurityContext {
                capabilities: Some(Capabilities {
                    add: Some(vec!["SYS_ADMIN".to_string()]),
                    drop: None,
                }),
                ..Default::default()
            }),
            // Chromium needs more shared memory than the default 64M.
            volume_mounts: Some(vec![VolumeMount {
                name: "dshm".to_string(),
                mount_path: "/dev/shm".to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        };

        Pod {
            metadata: ObjectMeta {
                name: Some(spec.unit_name.clone()),
                namespace: Some(self.namespace.clone()),
                labels: Some(spec.labels.clone()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: vec![container],
                restart_policy: Some("Never".to_string()),
                service_account_name: Some(self.service_account.clone()),
                security_context: Some(PodSecurityContext {
                    fs_group: Some(1000),
                    ..Default::default()
                }),
                volumes: Some(vec![Volume {
                    name: "dshm".to_string(),
                    empty_dir: Some(EmptyDirVolumeSource {
                        medium: Some("Memory".to_string()),
                        ..Default::default()
                    }),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            status: None,
        }
    }

    fn service_for(&self, spec: &SandboxSpec) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some(spec.endpoint_name.clone()),
                namespace: Some(self.namespace.clone()),
                labels: Some(spec.labels.clone()),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                type_: Some("ClusterIP".to_string()),
                selector: Some(BTreeMap::from([(
                    LABEL_SANDBOX_ID.to_string(),
                    spec.sandbox_id.clone(),
                )])),
                ports: Some(vec![ServicePort {
                    name: Some("http".to_string()),
                    port: i32::from(spec.port),
                    target_port: Some(IntOrString::Int(i32::from(spec.port))),
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            status: None,
        }
    }
}

fn http_probe(timing: &ProbeTiming, port: u16) -> Probe {
    Probe {
        http_get: Some(HTTPGetAction {
            path: Some(timing.path.clone()),
            port: IntOrString::Int(i32::from(port)),
            ..Default::default()
        }),
        initial_delay_seconds: Some(timing.initial_delay as i32),
        period_seconds: Some(timing.period as i32),
        timeout_seconds: Some(timing.timeout as i32),
        failure_threshold: Some(timing.failure_threshold as i32),
        ..Default::default()
    }
}

fn is_not_found(e: &kube::Error) -> bool {
    matches!(e, kube::Error::Api(ae) if ae.code == 404)
}

fn api_error(context: &str, e: kube::Error) -> SandboxError {
    let transient = match &e {
        kube::Error::Api(ae) => ae.code == 429 || ae.code >= 500,
        _ => true,
    };
    SandboxError::Api {
        reason: format!("{}: {}", context, e),
        transient,
    }
}

fn create_error(sandbox_id: &str, what: &str, e: kube::Error) -> SandboxError {
    match e {
        kube::Error::Api(ae) if ae.code == 409 => SandboxError::AlreadyExists {
            sandbox_id: sandbox_id.to_string(),
            resource: what.to_string(),
        },
        kube::Error::Api(ae) if ae.code < 500 && ae.code != 429 => SandboxError::CreateFailed {
            sandbox_id: sandbox_id.to_string(),
            reason: format!("{} rejected: {}", what, ae.message),
        },
        other => api_error(&format!("create {}", what), other),
    }
}

fn pod_status(pod: &Pod) -> UnitStatus {
    let Some(status) = &pod.status else {
        return UnitStatus {
            phase: UnitPhase::Pending,
            all_ready: false,
            message: None,
        };
    };
    let phase = match status.phase.as_deref() {
        Some("Running") => UnitPhase::Running,
        Some("Succeeded") => UnitPhase::Succeeded,
        Some("Failed") => UnitPhase::Failed,
        Some("Unknown") => UnitPhase::Unknown,
        _ => UnitPhase::Pending,
    };
    let all_ready = status
        .container_statuses
        .as_ref()
        .is_some_and(|cs| !cs.is_empty() && cs.iter().all(|c| c.ready));
    UnitStatus {
        phase,
        all_ready,
        message: status.message.clone().or_else(|| status.reason.clone()),
    }
}

fn managed_unit(pod: &Pod) -> Option<ManagedUnit> {
    let unit_name = pod.metadata.name.clone()?;
    let labels = pod.metadata.labels.as_ref();
    let sandbox_id = labels.and_then(|l| l.get(LABEL_SANDBOX_ID)).cloned();
    let job_id = labels
        .and_then(|l| l.get(LABEL_JOB_ID))
        .and_then(|v| v.parse().ok());
    let endpoint = match &sandbox_id {
        Some(id) => endpoint_name(id),
        None => format!("{}-svc", unit_name),
    };
    Some(ManagedUnit {
        sandbox_id,
        job_id,
        unit_name,
        endpoint_name: endpoint,
        created_at: pod.metadata.creation_timestamp.as_ref().map(|t| t.0),
    })
}

#[async_trait]
impl ComputeControlPlane for KubernetesControlPlane {
    fn name(&self) -> &'static str {
        "kubernetes"
    }

    fn endpoint_url(&self, endpoint_name: &str, port: u16) -> String {
        format!(
            "http://{}.{}.svc.cluster.local:{}",
            endpoint_name, self.namespace, port
        )
    }

    async fn create_unit(&self, spec: &SandboxSpec) -> Result<(), SandboxError> {
        self.pods()
            .create(&PostParams::default(), &self.pod_for(spec))
            .await
            .map_err(|e| create_error(&spec.sandbox_id, "pod", e))?;
        tracing::debug!(pod = %spec.unit_name, namespace = %self.namespace, "Created pod");
        Ok(())
    }

    async fn create_endpoint(&self, spec: &SandboxSpec) -> Result<String, SandboxError> {
        self.services()
            .create(&PostParams::default(), &self.service_for(spec))
            .await
            .map_err(|e| create_error(&spec.sandbox_id, "service", e))?;
        tracing::debug!(service = %spec.endpoint_name, namespace = %self.namespace, "Created service");
        Ok(self.endpoint_url(&spec.endpoint_name, spec.port))
    }

    async fn unit_status(&self, unit_name: &str) -> Result<UnitStatus, SandboxError> {
        let pod = self.pods().get(unit_name).await.map_err(|e| {
            if is_not_found(&e) {
                SandboxError::Api {
                    reason: format!("pod {} not found", unit_name),
                    transient: false,
                }
            } else {
                api_error("read pod", e)
            }
        })?;
        Ok(pod_status(&pod))
    }

    async fn delete_unit(&self, unit_name: &str) -> Result<Deletion, SandboxError> {
        let params = DeleteParams::default().grace_period(DELETE_GRACE_SECS);
        match self.pods().delete(unit_name, &params).await {
            Ok(_) => Ok(Deletion::Deleted),
            Err(e) if is_not_found(&e) => Ok(Deletion::AlreadyAbsent),
            Err(e) => Err(api_error("delete pod", e)),
        }
    }

    async fn delete_endpoint(&self, endpoint_name: &str) -> Result<Deletion, SandboxError> {
        match self
            .services()
            .delete(endpoint_name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(Deletion::Deleted),
            Err(e) if is_not_found(&e) => Ok(Deletion::AlreadyAbsent),
            Err(e) => Err(api_error("delete service", e)),
        }
    }

    async fn list_units(&self) -> Result<Vec<ManagedUnit>, SandboxError> {
        let params = ListParams::default().labels(&format!("{}={}", LABEL_MANAGED_BY, MANAGED_BY));
        let pods = self
            .pods()
            .list(&params)
            .await
            .map_err(|e| api_error("list pods", e))?;
        Ok(pods.items.iter().filter_map(managed_unit).collect())
    }
}
