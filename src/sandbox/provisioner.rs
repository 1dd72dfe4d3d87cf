//! Sandbox lifecycle: create, wait for readiness, hand out, tear down.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::clock::{Clock, elapsed};
use crate::config::SandboxConfig;
use crate::error::SandboxError;
use crate::sandbox::{
    APP_NAME, ActiveSandboxes, ComputeControlPlane, Deletion, LABEL_APP, LABEL_COMPONENT,
    LABEL_JOB_ID, LABEL_MANAGED_BY, LABEL_SANDBOX_ID, MANAGED_BY, ManagedUnit, ProbeTiming,
    ReadinessProbe, Resources, SandboxHandle, SandboxSpec, SandboxStatus, endpoint_name,
    unit_name,
};

/// Consecutive status-read failures tolerated while waiting for readiness.
const MAX_STATUS_ERRORS: u32 = 3;

/// Attempts per create or delete call when the control plane reports a
/// transient error.
const API_ATTEMPTS: u32 = 3;

const API_BACKOFF: Duration = Duration::from_secs(1);

/// Creates and destroys browser sandboxes and tracks the live ones.
pub struct SandboxProvisioner {
    config: SandboxConfig,
    plane: Arc<dyn ComputeControlPlane>,
    probe: Arc<dyn ReadinessProbe>,
    clock: Arc<dyn Clock>,
    active: ActiveSandboxes,
}

impl SandboxProvisioner {
    pub fn new(
        config: SandboxConfig,
        plane: Arc<dyn ComputeControlPlane>,
        probe: Arc<dyn ReadinessProbe>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            plane,
            probe,
            clock,
            active: ActiveSandboxes::new(),
        }
    }

    pub fn backend(&self) -> &'static str {
        self.plane.name()
    }

    pub fn control_plane(&self) -> Arc<dyn ComputeControlPlane> {
        Arc::clone(&self.plane)
    }

    /// Create a ready, healthy sandbox for a job.
    ///
    /// On any failure the unit and endpoint created so far are deleted
    /// before the error is returned, and nothing is registered.
    pub async fn provision(&self, job_id: i64) -> Result<SandboxHandle, SandboxError> {
        let sandbox_id = self.new_sandbox_id(job_id);
        let spec = self.spec_for(&sandbox_id, job_id);
        let created_at = self.clock.now();

        tracing::info!(
            job_id = job_id,
            sandbox_id = %sandbox_id,
            backend = self.plane.name(),
            "Provisioning browser sandbox"
        );

        match self.provision_inner(&spec).await {
            Ok(endpoint) => {
                let handle = SandboxHandle {
                    sandbox_id: spec.sandbox_id.clone(),
                    job_id,
                    endpoint,
                    unit_name: spec.unit_name.clone(),
                    endpoint_name: spec.endpoint_name.clone(),
                    created_at,
                    status: SandboxStatus::Active,
                };
                self.active.insert(handle.clone()).await;
                tracing::info!(
                    job_id = job_id,
                    sandbox_id = %handle.sandbox_id,
                    endpoint = %handle.endpoint,
                    waited = ?elapsed(created_at, self.clock.now()),
                    "Browser sandbox ready"
                );
                Ok(handle)
            }
            Err(e) => {
                tracing::warn!(
                    job_id = job_id,
                    sandbox_id = %sandbox_id,
                    error = %e,
                    "Sandbox provisioning failed, removing partial resources"
                );
                if let Err(cleanup) = self
                    .delete_resources(&spec.unit_name, &spec.endpoint_name)
                    .await
                {
                    tracing::error!(
                        sandbox_id = %sandbox_id,
                        error = %cleanup,
                        "Failed to remove partial sandbox resources (left for the reaper)"
                    );
                }
                Err(e)
            }
        }
    }

    /// Inner implementation of provisioning (separated for cleanup).
    async fn provision_inner(&self, spec: &SandboxSpec) -> Result<String, SandboxError> {
        self.create_with_retry("create_unit", spec, || (), || self.plane.create_unit(spec))
            .await?;
        let endpoint = self
            .create_with_retry(
                "create_endpoint",
                spec,
                || self.plane.endpoint_url(&spec.endpoint_name, spec.port),
                || self.plane.create_endpoint(spec),
            )
            .await?;
        self.wait_until_ready(spec).await?;
        self.wait_until_healthy(spec, &endpoint).await?;
        Ok(endpoint)
    }

    /// Retry a create on transient errors. A create that timed out may still
    /// have landed, so a conflict on a later attempt counts as created.
    async fn create_with_retry<T, Fut>(
        &self,
        operation: &str,
        spec: &SandboxSpec,
        existing: impl Fn() -> T,
        create: impl Fn() -> Fut,
    ) -> Result<T, SandboxError>
    where
        Fut: Future<Output = Result<T, SandboxError>>,
    {
        let mut attempt = 1;
        loop {
            match self.call(operation, create()).await {
                Err(SandboxError::AlreadyExists { resource, .. }) if attempt > 1 => {
                    tracing::debug!(
                        sandbox_id = %spec.sandbox_id,
                        resource = %resource,
                        "Resource landed on an earlier attempt"
                    );
                    return Ok(existing());
                }
                Err(e) if e.is_transient() && attempt < API_ATTEMPTS => {
                    tracing::debug!(
                        sandbox_id = %spec.sandbox_id,
                        operation,
                        attempt,
                        error = %e,
                        "Retrying create"
                    );
                    attempt += 1;
                    self.clock.sleep(API_BACKOFF).await;
                }
                other => return other,
            }
        }
    }

    async fn wait_until_ready(&self, spec: &SandboxSpec) -> Result<(), SandboxError> {
        let started = self.clock.now();
        let mut consecutive_errors = 0u32;

        loop {
            match self
                .call("unit_status", self.plane.unit_status(&spec.unit_name))
                .await
            {
                Ok(status) => {
                    consecutive_errors = 0;
                    if status.is_ready() {
                        return Ok(());
                    }
                    if status.phase.is_terminal() {
                        return Err(SandboxError::UnitFailed {
                            sandbox_id: spec.sandbox_id.clone(),
                            phase: match status.message {
                                Some(msg) => format!("{} ({})", status.phase, msg),
                                None => status.phase.to_string(),
                            },
                        });
                    }
                }
                Err(e) if e.is_transient() && consecutive_errors < MAX_STATUS_ERRORS => {
                    consecutive_errors += 1;
                    tracing::debug!(
                        sandbox_id = %spec.sandbox_id,
                        attempt = consecutive_errors,
                        error = %e,
                        "Transient error reading unit status"
                    );
                }
                Err(e) => return Err(e),
            }

            let waited = elapsed(started, self.clock.now());
            if waited >= self.config.ready_timeout {
                return Err(SandboxError::NotReady {
                    sandbox_id: spec.sandbox_id.clone(),
                    waited,
                });
            }
            let remaining = self.config.ready_timeout - waited;
            self.clock
                .sleep(self.config.poll_interval.min(remaining))
                .await;
        }
    }

    async fn wait_until_healthy(
        &self,
        spec: &SandboxSpec,
        endpoint: &str,
    ) -> Result<(), SandboxError> {
        let attempts = self.config.health_attempts;
        for attempt in 1..=attempts {
            if self.probe.check(endpoint).await {
                return Ok(());
            }
            if attempt < attempts {
                self.clock.sleep(self.config.health_interval).await;
            }
        }
        Err(SandboxError::HealthCheckFailed {
            sandbox_id: spec.sandbox_id.clone(),
            attempts,
        })
    }

    /// Delete a sandbox's unit and endpoint.
    ///
    /// The entry leaves the active set before any delete is issued, so two
    /// concurrent callers never both tear it down. If a delete fails the
    /// entry goes back as `terminating` for the next sweep. Returns true
    /// once both resources are gone (already-absent counts).
    pub async fn terminate(&self, sandbox_id: &str) -> bool {
        let taken = self.active.take(sandbox_id).await;
        let (unit, endpoint) = match &taken {
            Some(h) => (h.unit_name.clone(), h.endpoint_name.clone()),
            None => (unit_name(sandbox_id), endpoint_name(sandbox_id)),
        };

        match self.delete_resources(&unit, &endpoint).await {
            Ok(()) => {
                tracing::info!(sandbox_id = %sandbox_id, "Terminated browser sandbox");
                true
            }
            Err(e) => {
                tracing::warn!(
                    sandbox_id = %sandbox_id,
                    error = %e,
                    "Failed to terminate sandbox, will retry on next sweep"
                );
                if let Some(mut handle) = taken {
                    handle.status = SandboxStatus::Terminating;
                    self.active.insert(handle).await;
                }
                false
            }
        }
    }

    /// Terminate the sandbox owned by a job, if one is tracked.
    pub async fn terminate_for_job(&self, job_id: i64) -> bool {
        match self.active.find_by_job(job_id).await {
            Some(handle) => self.terminate(&handle.sandbox_id).await,
            None => false,
        }
    }

    /// Terminate sandboxes older than `max_age` and retry stuck teardowns.
    /// Returns how many were terminated.
    pub async fn sweep_idle(&self, max_age: Duration) -> usize {
        let due = self.active.due_for_sweep(self.clock.now(), max_age).await;
        let mut terminated = 0;
        for sandbox_id in due {
            if self.terminate(&sandbox_id).await {
                terminated += 1;
            }
        }
        terminated
    }

    /// Terminate every tracked sandbox.
    pub async fn cleanup_all(&self) -> usize {
        let mut terminated = 0;
        for handle in self.active.list().await {
            if self.terminate(&handle.sandbox_id).await {
                terminated += 1;
            }
        }
        terminated
    }

    /// Track a unit found on the control plane as owned by `job_id`.
    pub async fn adopt(&self, unit: &ManagedUnit, job_id: i64) -> SandboxHandle {
        let sandbox_id = unit
            .sandbox_id
            .clone()
            .unwrap_or_else(|| unit.unit_name.clone());
        let handle = SandboxHandle {
            sandbox_id,
            job_id,
            endpoint: self
                .plane
                .endpoint_url(&unit.endpoint_name, self.config.port),
            unit_name: unit.unit_name.clone(),
            endpoint_name: unit.endpoint_name.clone(),
            created_at: unit.created_at.unwrap_or_else(|| self.clock.now()),
            status: SandboxStatus::Active,
        };
        self.active.insert(handle.clone()).await;
        tracing::info!(
            job_id = job_id,
            sandbox_id = %handle.sandbox_id,
            "Adopted existing browser sandbox"
        );
        handle
    }

    /// Delete a unit found on the control plane that nothing owns.
    pub async fn remove_orphan(&self, unit: &ManagedUnit) -> bool {
        match self
            .delete_resources(&unit.unit_name, &unit.endpoint_name)
            .await
        {
            Ok(()) => {
                tracing::info!(unit = %unit.unit_name, "Removed orphaned browser sandbox");
                true
            }
            Err(e) => {
                tracing::warn!(unit = %unit.unit_name, error = %e, "Failed to remove orphaned sandbox");
                false
            }
        }
    }

    pub async fn active(&self) -> Vec<SandboxHandle> {
        self.active.list().await
    }

    pub async fn get(&self, sandbox_id: &str) -> Option<SandboxHandle> {
        self.active.get(sandbox_id).await
    }

    /// Attempt both deletes; fail if either one failed.
    async fn delete_resources(&self, unit: &str, endpoint: &str) -> Result<(), SandboxError> {
        let unit_result = self.delete_with_retry(unit, true).await;
        let endpoint_result = self.delete_with_retry(endpoint, false).await;
        unit_result?;
        endpoint_result?;
        Ok(())
    }

    async fn delete_with_retry(&self, name: &str, is_unit: bool) -> Result<Deletion, SandboxError> {
        let mut attempt = 1;
        loop {
            let result = if is_unit {
                self.call("delete_unit", self.plane.delete_unit(name)).await
            } else {
                self.call("delete_endpoint", self.plane.delete_endpoint(name))
                    .await
            };
            match result {
                Err(e) if e.is_transient() && attempt < API_ATTEMPTS => {
                    tracing::debug!(name = %name, attempt, error = %e, "Retrying delete");
                    attempt += 1;
                    self.clock.sleep(API_BACKOFF).await;
                }
                other => return other,
            }
        }
    }

    /// Bound a control plane call by the configured per-call timeout.
    async fn call<T>(
        &self,
        operation: &str,
        fut: impl Future<Output = Result<T, SandboxError>>,
    ) -> Result<T, SandboxError> {
        match tokio::time::timeout(self.config.api_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(SandboxError::Timeout {
                operation: operation.to_string(),
                after: self.config.api_timeout,
            }),
        }
    }

    fn new_sandbox_id(&self, job_id: i64) -> String {
        let suffix = Uuid::new_v4().simple().to_string();
        format!("{}-{}-{}", self.config.id_prefix, job_id, &suffix[..8])
    }

    fn spec_for(&self, sandbox_id: &str, job_id: i64) -> SandboxSpec {
        let cfg = &self.config;
        let labels: BTreeMap<String, String> = [
            (LABEL_APP, APP_NAME.to_string()),
            (LABEL_SANDBOX_ID, sandbox_id.to_string()),
            (LABEL_JOB_ID, job_id.to_string()),
            (LABEL_COMPONENT, "browser-service".to_string()),
            (LABEL_MANAGED_BY, MANAGED_BY.to_string()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        SandboxSpec {
            sandbox_id: sandbox_id.to_string(),
            job_id,
            unit_name: unit_name(sandbox_id),
            endpoint_name: endpoint_name(sandbox_id),
            image: cfg.image.clone(),
            port: cfg.port,
            env: vec![
                ("SERVICE_ID".to_string(), sandbox_id.to_string()),
                ("JOB_ID".to_string(), job_id.to_string()),
                ("BROWSER_PORT".to_string(), cfg.port.to_string()),
            ],
            labels,
            resources: Resources {
                cpu_request: cfg.cpu_request.clone(),
                cpu_limit: cfg.cpu_limit.clone(),
                memory_request: cfg.memory_request.clone(),
                memory_limit: cfg.memory_limit.clone(),
            },
            readiness: ProbeTiming {
                path: cfg.readiness_path.clone(),
                initial_delay: 10,
                period: 5,
                timeout: 3,
                failure_threshold: 3,
            },
            liveness: ProbeTiming {
                path: cfg.liveness_path.clone(),
                initial_delay: 30,
                period: 10,
                timeout: 5,
                failure_threshold: 3,
            },
        }
    }
}
