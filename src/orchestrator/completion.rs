//! Applies a worker's completion report.

use std::sync::Arc;

use crate::clock::Clock;
use crate::codes::CodeArbiter;
use crate::jobs::{JobStatus, JobStore, Transition};
use crate::orchestrator::notify::{CompletionNotice, CompletionNotifier};
use crate::sandbox::SandboxProvisioner;
use crate::worker::{CodeConsumption, CompletionReport, CompletionStatus};

/// What `on_complete` did.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct CompletionOutcome {
    /// This call moved the job to its terminal status.
    pub applied: bool,
    pub status: JobStatus,
    pub sandbox_released: bool,
}

pub struct CompletionHandler {
    jobs: Arc<dyn JobStore>,
    codes: Arc<CodeArbiter>,
    sandboxes: Arc<SandboxProvisioner>,
    notifier: Option<Arc<CompletionNotifier>>,
    clock: Arc<dyn Clock>,
}

impl CompletionHandler {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        codes: Arc<CodeArbiter>,
        sandboxes: Arc<SandboxProvisioner>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            jobs,
            codes,
            sandboxes,
            notifier: None,
            clock,
        }
    }

    pub fn with_notifier(mut self, notifier: Option<Arc<CompletionNotifier>>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Parse the report's status word and apply it.
    pub async fn handle_report(
        &self,
        report: &CompletionReport,
    ) -> Result<CompletionOutcome, String> {
        let status: CompletionStatus = report.status.parse()?;
        Ok(self
            .on_complete(
                report.job_id,
                status,
                report.result.clone(),
                report.sandbox_id.as_deref(),
                report.code_consumption.as_ref(),
            )
            .await)
    }

    /// Record a job's end. Each step runs even if an earlier one failed,
    /// and a repeated call for the same job changes nothing.
    pub async fn on_complete(
        &self,
        job_id: i64,
        status: CompletionStatus,
        result: Option<serde_json::Value>,
        sandbox_id: Option<&str>,
        code_consumption: Option<&CodeConsumption>,
    ) -> CompletionOutcome {
        let target = status.job_status();

        let applied = match self
            .jobs
            .transition(
                job_id,
                &[JobStatus::Dispatching, JobStatus::Running],
                target,
                result,
                Some("worker callback"),
            )
            .await
        {
            Ok(Transition::Applied(job)) => {
                tracing::info!(job_id = job_id, status = %target, "Job finished");
                Some(job)
            }
            Ok(Transition::Rejected { current }) => {
                tracing::info!(
                    job_id = job_id,
                    current = %current,
                    reported = %target,
                    "Duplicate or late completion, status unchanged"
                );
                None
            }
            Err(e) => {
                tracing::error!(job_id = job_id, error = %e, "Failed to record job completion");
                None
            }
        };

        let sandbox_released = match sandbox_id {
            Some(id) => self.sandboxes.terminate(id).await,
            None => self.sandboxes.terminate_for_job(job_id).await,
        };

        if let Some(usage) = code_consumption {
            self.codes
                .mark_consumed(&usage.provider, job_id, target == JobStatus::Completed)
                .await;
        }

        if let (Some(job), Some(notifier)) = (&applied, &self.notifier) {
            notifier.spawn_send(CompletionNotice::for_job(job, self.clock.now()));
        }

        CompletionOutcome {
            applied: applied.is_some(),
            status: target,
            sandbox_released,
        }
    }
}
