//! Ephemeral browser sandboxes, one per job.
//!
//! A sandbox is a compute unit (pod or container) plus a stable network
//! endpoint in front of it. The provisioner creates both, waits for the unit
//! to report ready, probes the browser's own health endpoint, and only then
//! hands the sandbox out. Anything created on a failed attempt is deleted
//! before the failure is returned.
//!
//! ```text
//!  provision(job)
//!     │
//!     ├─► create unit ─► create endpoint ─► poll status ─► probe /health/ready
//!     │                                        │                 │
//!     │                              failed/timeout        attempts used
//!     │                                        └──────┬──────────┘
//!     │                                               ▼
//!     │                                    delete unit + endpoint
//!     ▼
//!  ActiveSandboxes ──► terminate(id) / sweep_idle(max_age) / cleanup_all()
//! ```

mod docker;
mod health;
mod kubernetes;
mod provisioner;
mod registry;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::SandboxError;

pub use docker::DockerControlPlane;
pub use health::{HttpReadinessProbe, ReadinessProbe};
pub use kubernetes::KubernetesControlPlane;
pub use provisioner::SandboxProvisioner;
pub use registry::ActiveSandboxes;

pub const LABEL_APP: &str = "app";
pub const LABEL_SANDBOX_ID: &str = "service-id";
pub const LABEL_JOB_ID: &str = "job-id";
pub const LABEL_COMPONENT: &str = "component";
pub const LABEL_MANAGED_BY: &str = "managed-by";
pub const APP_NAME: &str = "rpa-browser";
pub const MANAGED_BY: &str = "rpa-orchestrator";

/// Compute unit name for a sandbox.
pub fn unit_name(sandbox_id: &str) -> String {
    format!("{}-{}", APP_NAME, sandbox_id)
}

/// Network endpoint name for a sandbox.
pub fn endpoint_name(sandbox_id: &str) -> String {
    format!("{}-svc-{}", APP_NAME, sandbox_id)
}

/// Lifecycle of a sandbox as tracked in the active set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxStatus {
    Provisioning,
    Active,
    /// Teardown was attempted and failed; the next sweep retries it.
    Terminating,
}

impl std::fmt::Display for SandboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Provisioning => write!(f, "provisioning"),
            Self::Active => write!(f, "active"),
            Self::Terminating => write!(f, "terminating"),
        }
    }
}

/// A sandbox owned by a job.
#[derive(Debug, Clone, Serialize)]
pub struct SandboxHandle {
    pub sandbox_id: String,
    pub job_id: i64,
    /// URL the worker drives the browser through.
    pub endpoint: String,
    pub unit_name: String,
    pub endpoint_name: String,
    pub created_at: DateTime<Utc>,
    pub status: SandboxStatus,
}

/// Resource requests and limits, in control plane notation (`500m`, `4Gi`).
#[derive(Debug, Clone)]
pub struct Resources {
    pub cpu_request: String,
    pub cpu_limit: String,
    pub memory_request: String,
    pub memory_limit: String,
}

/// HTTP probe timing, in seconds.
#[derive(Debug, Clone)]
pub struct ProbeTiming {
    pub path: String,
    pub initial_delay: u32,
    pub period: u32,
    pub timeout: u32,
    pub failure_threshold: u32,
}

/// Everything a control plane needs to create one sandbox.
#[derive(Debug, Clone)]
pub struct SandboxSpec {
    pub sandbox_id: String,
    pub job_id: i64,
    pub unit_name: String,
    pub endpoint_name: String,
    pub image: String,
    pub port: u16,
    pub env: Vec<(String, String)>,
    pub labels: BTreeMap<String, String>,
    pub resources: Resources,
    pub readiness: ProbeTiming,
    pub liveness: ProbeTiming,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl UnitPhase {
    /// Phases a browser unit never comes back from.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Unknown)
    }
}

impl std::fmt::Display for UnitPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Running => write!(f, "Running"),
            Self::Succeeded => write!(f, "Succeeded"),
            Self::Failed => write!(f, "Failed"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct UnitStatus {
    pub phase: UnitPhase,
    /// Every container in the unit passed its readiness check.
    pub all_ready: bool,
    pub message: Option<String>,
}

impl UnitStatus {
    pub fn ready() -> Self {
        Self {
            phase: UnitPhase::Running,
            all_ready: true,
            message: None,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.phase == UnitPhase::Running && self.all_ready
    }
}

/// Result of an idempotent delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deletion {
    Deleted,
    AlreadyAbsent,
}

/// A unit found on the control plane carrying this system's labels.
#[derive(Debug, Clone)]
pub struct ManagedUnit {
    pub sandbox_id: Option<String>,
    pub job_id: Option<i64>,
    pub unit_name: String,
    pub endpoint_name: String,
    pub created_at: Option<DateTime<Utc>>,
}

/// Operations on the infrastructure hosting sandboxes.
#[async_trait]
pub trait ComputeControlPlane: Send + Sync {
    fn name(&self) -> &'static str;

    /// URL of an endpoint as reachable from workers.
    fn endpoint_url(&self, endpoint_name: &str, port: u16) -> String;

    async fn create_unit(&self, spec: &SandboxSpec) -> Result<(), SandboxError>;

    /// Create the stable endpoint and return its URL.
    async fn create_endpoint(&self, spec: &SandboxSpec) -> Result<String, SandboxError>;

    async fn unit_status(&self, unit_name: &str) -> Result<UnitStatus, SandboxError>;

    /// Delete a unit; a missing unit is `AlreadyAbsent`, not an error.
    async fn delete_unit(&self, unit_name: &str) -> Result<Deletion, SandboxError>;

    async fn delete_endpoint(&self, endpoint_name: &str) -> Result<Deletion, SandboxError>;

    /// Units labelled `managed-by=rpa-orchestrator`.
    async fn list_units(&self) -> Result<Vec<ManagedUnit>, SandboxError>;
}
