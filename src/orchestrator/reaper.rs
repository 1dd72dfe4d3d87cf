use std::sync::Arc;
use std::time::Duration;

use crate::clock::Clock;
use crate::orchestrator::reconcile::Reconciler;
use crate::sandbox::SandboxProvisioner;

/// Backstop for sandboxes whose job never called back.
pub struct IdleReaper {
    sandboxes: Arc<SandboxProvisioner>,
    max_age: Duration,
    stalled: Option<StalledRecovery>,
}

/// Fails jobs stuck in `dispatching` past the dispatch deadline.
struct StalledRecovery {
    reconciler: Reconciler,
    clock: Arc<dyn Clock>,
    deadline: Duration,
}

impl IdleReaper {
    pub fn new(sandboxes: Arc<SandboxProvisioner>, max_age: Duration) -> Self {
        Self {
            sandboxes,
            max_age,
            stalled: None,
        }
    }

    /// Also fail jobs that have been `dispatching` for longer than `deadline`.
    pub fn with_stalled_recovery(
        mut self,
        reconciler: Reconciler,
        clock: Arc<dyn Clock>,
        deadline: Duration,
    ) -> Self {
        self.stalled = Some(StalledRecovery {
            reconciler,
            clock,
            deadline,
        });
        self
    }

    /// One sweep. Returns how many sandboxes were terminated for age.
    pub async fn sweep(&self) -> usize {
        if let Some(stalled) = &self.stalled {
            match stalled
                .reconciler
                .recover_stalled(stalled.clock.now(), stalled.deadline)
                .await
            {
                Ok(0) => {}
                Ok(recovered) => tracing::warn!(
                    recovered,
                    deadline_secs = stalled.deadline.as_secs(),
                    "Failed jobs stalled in dispatching"
                ),
                Err(e) => tracing::error!(error = %e, "Stalled dispatch recovery failed"),
            }
        }

        let terminated = self.sandboxes.sweep_idle(self.max_age).await;
        if terminated > 0 {
            tracing::info!(
                terminated,
                max_age_secs = self.max_age.as_secs(),
                "Reaped idle sandboxes"
            );
        }
        terminated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{JobStatus, JobStore, NewJob};
    use crate::testing::{Harness, StaticWorkerLocator, WorkerReply};

    #[tokio::test]
    async fn abandoned_sandbox_reaped_after_max_age() {
        let h = Harness::new(
            StaticWorkerLocator::available("http://worker-1:8621"),
            WorkerReply::Accept,
        );
        let job = h.jobs.create(NewJob::new("mfn", "validation")).await.unwrap();
        h.dispatcher.dispatch(&job).await;
        let reaper = IdleReaper::new(h.sandboxes.clone(), Duration::from_secs(600));

        h.clock.advance(Duration::from_secs(120));
        assert_eq!(reaper.sweep().await, 0);

        // Sweeps every 120s catch it no later than interval + max_age.
        h.clock.advance(Duration::from_secs(600));
        assert_eq!(reaper.sweep().await, 1);
        assert!(h.plane.unit_names().is_empty());
        assert!(h.sandboxes.active().await.is_empty());
    }

    #[tokio::test]
    async fn sweep_fails_jobs_stalled_in_dispatching() {
        let h = Harness::new(StaticWorkerLocator::none(), WorkerReply::Accept);
        let job = h.jobs.create(NewJob::new("mfn", "validation")).await.unwrap();
        h.jobs
            .transition(job.id, &[JobStatus::Pending], JobStatus::Dispatching, None, None)
            .await
            .unwrap();
        let reaper = IdleReaper::new(h.sandboxes.clone(), Duration::from_secs(600))
            .with_stalled_recovery(
                Reconciler::new(h.jobs.clone(), h.sandboxes.clone()),
                h.clock.clone(),
                Duration::from_secs(900),
            );

        h.clock.advance(Duration::from_secs(300));
        reaper.sweep().await;
        assert_eq!(
            h.jobs.get(job.id).await.unwrap().unwrap().status,
            JobStatus::Dispatching
        );

        h.clock.advance(Duration::from_secs(601));
        reaper.sweep().await;
        let failed = h.jobs.get(job.id).await.unwrap().unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.result.unwrap()["stage"], "recovery");
    }
}
