//! Moves pending jobs to `running` (or `failed`) one dispatch attempt at a time.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::clock::Clock;
use crate::codes::CodeArbiter;
use crate::config::{ApiConfig, CodeArbiterConfig, DispatchConfig};
use crate::error::{CodeError, StoreError};
use crate::jobs::{Action, Job, JobStatus, JobStore, Provider, Transition};
use crate::sandbox::SandboxProvisioner;
use crate::worker::{JobPayload, WorkerClient, WorkerLocator};

/// Where in the dispatch sequence an attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchStage {
    Validation,
    Code,
    Sandbox,
    WorkerLookup,
    WorkerSubmit,
    /// Found in `dispatching` after a restart.
    Recovery,
}

impl DispatchStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Code => "code",
            Self::Sandbox => "sandbox",
            Self::WorkerLookup => "worker_lookup",
            Self::WorkerSubmit => "worker_submit",
            Self::Recovery => "recovery",
        }
    }
}

impl std::fmt::Display for DispatchStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed dispatch attempt, as stored in the job's result.
#[derive(Debug, Clone)]
pub struct DispatchFailure {
    pub stage: DispatchStage,
    pub reason: &'static str,
    pub detail: Option<String>,
}

impl DispatchFailure {
    fn new(stage: DispatchStage, reason: &'static str) -> Self {
        Self {
            stage,
            reason,
            detail: None,
        }
    }

    fn detail(mut self, detail: impl std::fmt::Display) -> Self {
        self.detail = Some(detail.to_string());
        self
    }

    pub fn to_result(&self) -> serde_json::Value {
        let mut result = json!({
            "error": self.reason,
            "stage": self.stage.as_str(),
        });
        if let Some(detail) = &self.detail {
            result["detail"] = json!(detail);
        }
        result
    }
}

/// How one dispatch attempt ended.
#[derive(Debug, Clone)]
pub enum DispatchOutcome {
    Running { worker: String, sandbox_id: String },
    Failed(DispatchFailure),
    /// The job was not claimable; nothing was touched.
    Skipped { reason: String },
}

/// Tally of one dispatch tick.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct DispatchSummary {
    pub running: usize,
    pub failed: usize,
    pub skipped: usize,
    pub panicked: usize,
}

impl DispatchSummary {
    fn record(&mut self, outcome: &DispatchOutcome) {
        match outcome {
            DispatchOutcome::Running { .. } => self.running += 1,
            DispatchOutcome::Failed(_) => self.failed += 1,
            DispatchOutcome::Skipped { .. } => self.skipped += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.running + self.failed + self.skipped + self.panicked
    }
}

/// Knobs the dispatcher needs from several config sections.
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub batch_size: usize,
    pub concurrency: usize,
    pub code_attempts: u32,
    pub store_write_retries: u32,
    pub callback_url: String,
}

impl DispatchSettings {
    pub fn from_config(dispatch: &DispatchConfig, codes: &CodeArbiterConfig, api: &ApiConfig) -> Self {
        Self {
            batch_size: dispatch.batch_size,
            concurrency: dispatch.concurrency.max(1),
            code_attempts: codes.max_attempts,
            store_write_retries: dispatch.store_write_retries.max(1),
            callback_url: api.callback_url(),
        }
    }
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self::from_config(
            &DispatchConfig::default(),
            &CodeArbiterConfig::default(),
            &ApiConfig::default(),
        )
    }
}

const STORE_RETRY_BACKOFF: Duration = Duration::from_millis(500);

pub struct JobDispatcher {
    jobs: Arc<dyn JobStore>,
    codes: Arc<CodeArbiter>,
    sandboxes: Arc<SandboxProvisioner>,
    locator: Arc<dyn WorkerLocator>,
    client: Arc<dyn WorkerClient>,
    clock: Arc<dyn Clock>,
    settings: DispatchSettings,
}

impl JobDispatcher {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        codes: Arc<CodeArbiter>,
        sandboxes: Arc<SandboxProvisioner>,
        locator: Arc<dyn WorkerLocator>,
        client: Arc<dyn WorkerClient>,
        clock: Arc<dyn Clock>,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            jobs,
            codes,
            sandboxes,
            locator,
            client,
            clock,
            settings,
        }
    }

    /// Dispatch one batch of pending jobs on a bounded pool.
    ///
    /// Only listing the batch can fail; per-job failures end up on the job.
    pub async fn run_once(self: &Arc<Self>) -> Result<DispatchSummary, StoreError> {
        let pending = self
            .jobs
            .list_by_status(JobStatus::Pending, self.settings.batch_size, 0)
            .await?;
        if pending.is_empty() {
            return Ok(DispatchSummary::default());
        }
        tracing::debug!(count = pending.len(), "Dispatching pending jobs");

        let permits = Arc::new(Semaphore::new(self.settings.concurrency));
        let mut tasks = JoinSet::new();
        for job in pending {
            let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                break;
            };
            let this = Arc::clone(self);
            tasks.spawn(async move {
                let _permit = permit;
                this.dispatch(&job).await
            });
        }

        let mut summary = DispatchSummary::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => summary.record(&outcome),
                Err(e) => {
                    tracing::error!(error = %e, "Dispatch task panicked");
                    summary.panicked += 1;
                }
            }
        }

        tracing::info!(
            running = summary.running,
            failed = summary.failed,
            skipped = summary.skipped,
            panicked = summary.panicked,
            "Dispatch tick finished"
        );
        Ok(summary)
    }

    /// Run one dispatch attempt. Always leaves a claimed job in `running`
    /// or `failed`, and never leaks a sandbox it provisioned.
    pub async fn dispatch(&self, job: &Job) -> DispatchOutcome {
        match self
            .jobs
            .transition(job.id, &[JobStatus::Pending], JobStatus::Dispatching, None, None)
            .await
        {
            Ok(Transition::Applied(_)) => {}
            Ok(Transition::Rejected { current }) => {
                tracing::debug!(job_id = job.id, current = %current, "Job already claimed, skipping");
                return DispatchOutcome::Skipped {
                    reason: format!("job is {}", current),
                };
            }
            Err(e) => {
                tracing::warn!(job_id = job.id, error = %e, "Failed to claim job");
                return DispatchOutcome::Skipped {
                    reason: e.to_string(),
                };
            }
        }

        match self.dispatch_claimed(job).await {
            Ok(outcome) => outcome,
            Err(failure) => {
                tracing::warn!(
                    job_id = job.id,
                    stage = %failure.stage,
                    reason = failure.reason,
                    detail = ?failure.detail,
                    "Dispatch failed"
                );
                self.finish(
                    job.id,
                    JobStatus::Failed,
                    failure.to_result(),
                    Some(failure.reason),
                )
                .await;
                DispatchOutcome::Failed(failure)
            }
        }
    }

    async fn dispatch_claimed(&self, job: &Job) -> Result<DispatchOutcome, DispatchFailure> {
        let provider: Provider = job.provider.parse().map_err(|e| {
            DispatchFailure::new(DispatchStage::Validation, "unknown provider").detail(e)
        })?;
        let action: Action = job.action.parse().map_err(|e| {
            DispatchFailure::new(DispatchStage::Validation, "unknown action").detail(e)
        })?;
        let family = provider.as_str();

        let code = if self.codes.provider_requires_code(family) {
            match self
                .codes
                .acquire_code(family, job.id, self.settings.code_attempts)
                .await
            {
                Ok(code) => Some(code),
                Err(e @ CodeError::Exhausted { .. }) => {
                    return Err(
                        DispatchFailure::new(DispatchStage::Code, "code acquisition exhausted")
                            .detail(e),
                    );
                }
                Err(e) => {
                    return Err(
                        DispatchFailure::new(DispatchStage::Code, "code acquisition failed")
                            .detail(e),
                    );
                }
            }
        } else {
            None
        };

        let sandbox = match self.sandboxes.provision(job.id).await {
            Ok(handle) => handle,
            Err(e) => {
                self.release_code(code.is_some(), family, job.id).await;
                return Err(
                    DispatchFailure::new(DispatchStage::Sandbox, "sandbox provisioning failed")
                        .detail(e),
                );
            }
        };

        let Some(worker) = self.locator.find_available().await else {
            self.sandboxes.terminate(&sandbox.sandbox_id).await;
            self.release_code(code.is_some(), family, job.id).await;
            return Err(DispatchFailure::new(
                DispatchStage::WorkerLookup,
                "no available worker",
            ));
        };

        let payload = JobPayload {
            job_id: job.id,
            provider: family.to_string(),
            action: action.as_str().to_string(),
            parameters: job.parameters.clone(),
            sandbox_endpoint: sandbox.endpoint.clone(),
            sandbox_id: sandbox.sandbox_id.clone(),
            code,
            callback_url: self.settings.callback_url.clone(),
        };

        if let Err(e) = self.client.submit(&worker, &payload).await {
            self.sandboxes.terminate(&sandbox.sandbox_id).await;
            // Only a clear "no" guarantees the code was never used.
            if e.is_rejection() {
                self.release_code(payload.code.is_some(), family, job.id)
                    .await;
            }
            let reason = if e.is_rejection() {
                "worker rejected job"
            } else {
                "worker submission failed"
            };
            return Err(DispatchFailure::new(DispatchStage::WorkerSubmit, reason).detail(e));
        }

        tracing::info!(
            job_id = job.id,
            worker = %worker,
            sandbox_id = %sandbox.sandbox_id,
            "Job handed to worker"
        );

        let result = json!({
            "worker": worker.url,
            "sandbox_id": sandbox.sandbox_id,
            "sandbox_endpoint": sandbox.endpoint,
        });
        self.finish(job.id, JobStatus::Running, result, None).await;

        Ok(DispatchOutcome::Running {
            worker: worker.url,
            sandbox_id: sandbox.sandbox_id,
        })
    }

    async fn release_code(&self, held: bool, family: &str, job_id: i64) {
        if held {
            self.codes.release(family, job_id).await;
        }
    }

    /// Final write of an attempt, retried on store errors.
    async fn finish(
        &self,
        job_id: i64,
        to: JobStatus,
        result: serde_json::Value,
        reason: Option<&str>,
    ) {
        let attempts = self.settings.store_write_retries;
        for attempt in 1..=attempts {
            match self
                .jobs
                .transition(
                    job_id,
                    &[JobStatus::Dispatching],
                    to,
                    Some(result.clone()),
                    reason,
                )
                .await
            {
                Ok(Transition::Applied(_)) => return,
                Ok(Transition::Rejected { current }) => {
                    // The worker's callback can land before this write.
                    tracing::info!(
                        job_id = job_id,
                        current = %current,
                        target = %to,
                        "Job already moved on, keeping its status"
                    );
                    return;
                }
                Err(e) if attempt < attempts => {
                    tracing::warn!(job_id = job_id, attempt, error = %e, "Retrying job status write");
                    self.clock.sleep(STORE_RETRY_BACKOFF * attempt).await;
                }
                Err(e) => {
                    tracing::error!(
                        job_id = job_id,
                        target = %to,
                        error = %e,
                        "Job status write lost; startup reconciliation will recover it"
                    );
                }
            }
        }
    }
}
