//! Startup reconciliation between the job store and the control plane.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;

use crate::error::OrchestratorError;
use crate::jobs::{JobStatus, JobStore, Transition};
use crate::orchestrator::dispatcher::DispatchStage;
use crate::sandbox::SandboxProvisioner;

/// Upper bound on jobs recovered from `dispatching` in one pass.
const RECOVERY_BATCH: usize = 1000;

const RESTART_REASON: &str = "orchestrator restarted during dispatch";

const STALLED_REASON: &str = "dispatch exceeded its deadline";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub adopted: usize,
    pub terminated: usize,
    pub recovered_jobs: usize,
}

pub struct Reconciler {
    jobs: Arc<dyn JobStore>,
    sandboxes: Arc<SandboxProvisioner>,
}

impl Reconciler {
    pub fn new(jobs: Arc<dyn JobStore>, sandboxes: Arc<SandboxProvisioner>) -> Self {
        Self { jobs, sandboxes }
    }

    /// Rebuild the active sandbox set from what the control plane still
    /// runs, then fail jobs a previous process left mid-dispatch.
    pub async fn run(&self) -> Result<ReconcileReport, OrchestratorError> {
        let mut report = ReconcileReport::default();

        let units = self.sandboxes.control_plane().list_units().await?;
        for unit in &units {
            let owner = match unit.job_id {
                Some(id) => match self.jobs.get(id).await {
                    Ok(job) => job,
                    Err(e) => {
                        tracing::warn!(
                            unit = %unit.unit_name,
                            job_id = id,
                            error = %e,
                            "Could not look up sandbox owner, leaving unit for the next pass"
                        );
                        continue;
                    }
                },
                None => None,
            };
            match owner {
                Some(job) if matches!(job.status, JobStatus::Running | JobStatus::Dispatching) => {
                    self.sandboxes.adopt(unit, job.id).await;
                    report.adopted += 1;
                }
                _ => {
                    if self.sandboxes.remove_orphan(unit).await {
                        report.terminated += 1;
                    }
                }
            }
        }

        let (recovered, terminated) = self.fail_dispatching(None, RESTART_REASON).await?;
        report.recovered_jobs = recovered;
        report.terminated += terminated;

        tracing::info!(
            adopted = report.adopted,
            terminated = report.terminated,
            recovered_jobs = report.recovered_jobs,
            "Reconciliation finished"
        );
        Ok(report)
    }

    /// Fail jobs that have sat in `dispatching` for longer than `older_than`
    /// and tear down their sandboxes. Returns how many jobs were failed.
    pub async fn recover_stalled(
        &self,
        now: DateTime<Utc>,
        older_than: Duration,
    ) -> Result<usize, OrchestratorError> {
        let cutoff = chrono::Duration::from_std(older_than)
            .ok()
            .and_then(|age| now.checked_sub_signed(age))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let (recovered, _) = self.fail_dispatching(Some(cutoff), STALLED_REASON).await?;
        Ok(recovered)
    }

    /// Move `dispatching` jobs (last touched before `cutoff`, if given) to
    /// `failed`. Returns (jobs failed, sandboxes terminated).
    async fn fail_dispatching(
        &self,
        cutoff: Option<DateTime<Utc>>,
        reason: &str,
    ) -> Result<(usize, usize), OrchestratorError> {
        let mut recovered = 0;
        let mut terminated = 0;
        let stuck = self
            .jobs
            .list_by_status(JobStatus::Dispatching, RECOVERY_BATCH, 0)
            .await?;
        for job in stuck {
            if cutoff.is_some_and(|cutoff| job.updated_at >= cutoff) {
                continue;
            }
            let result = json!({
                "error": reason,
                "stage": DispatchStage::Recovery.as_str(),
            });
            match self
                .jobs
                .transition(
                    job.id,
                    &[JobStatus::Dispatching],
                    JobStatus::Failed,
                    Some(result),
                    Some(reason),
                )
                .await?
            {
                Transition::Applied(_) => {
                    recovered += 1;
                    if self.sandboxes.terminate_for_job(job.id).await {
                        terminated += 1;
                    }
                    tracing::warn!(job_id = job.id, reason, "Failed job interrupted mid-dispatch");
                }
                Transition::Rejected { current } => {
                    tracing::debug!(job_id = job.id, current = %current, "Job left dispatching concurrently");
                }
            }
        }
        Ok((recovered, terminated))
    }
}
