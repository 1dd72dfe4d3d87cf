//! Periodic metrics snapshot, emitted as a structured log line.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;

use crate::codes::CodeArbiter;
use crate::jobs::{JobStatus, JobStore};
use crate::sandbox::SandboxProvisioner;

#[derive(Debug, Clone, Serialize)]
pub struct FamilySummary {
    pub generated: i64,
    pub consumed: i64,
    pub success_rate: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    /// Job counts keyed by status name; every status is present.
    pub jobs: BTreeMap<&'static str, u64>,
    pub active_sandboxes: usize,
    pub codes: BTreeMap<String, FamilySummary>,
    pub reservation_store_healthy: bool,
}

pub struct MetricsReporter {
    jobs: Arc<dyn JobStore>,
    sandboxes: Arc<SandboxProvisioner>,
    codes: Arc<CodeArbiter>,
}

impl MetricsReporter {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        sandboxes: Arc<SandboxProvisioner>,
        codes: Arc<CodeArbiter>,
    ) -> Self {
        Self {
            jobs,
            sandboxes,
            codes,
        }
    }

    /// Collect a snapshot. Sources that fail are logged and left empty.
    pub async fn snapshot(&self) -> MetricsSnapshot {
        let counts = match self.jobs.count_by_status().await {
            Ok(counts) => counts,
            Err(e) => {
                tracing::warn!(error = %e, "Could not count jobs for metrics");
                Default::default()
            }
        };
        let jobs = JobStatus::ALL
            .iter()
            .map(|s| (s.as_str(), counts.get(s).copied().unwrap_or(0)))
            .collect();

        let mut codes = BTreeMap::new();
        for family in self.codes.loaded_families() {
            match self.codes.metrics(&family).await {
                Ok(m) => {
                    codes.insert(
                        family,
                        FamilySummary {
                            generated: m.generated,
                            consumed: m.consumed,
                            success_rate: m.success_rate,
                        },
                    );
                }
                Err(e) => tracing::warn!(family = %family, error = %e, "Could not read code metrics"),
            }
        }

        MetricsSnapshot {
            jobs,
            active_sandboxes: self.sandboxes.active().await.len(),
            codes,
            reservation_store_healthy: self.codes.health().await,
        }
    }

    pub async fn report(&self) -> MetricsSnapshot {
        let snapshot = self.snapshot().await;
        tracing::info!(
            pending = snapshot.jobs.get("pending").copied().unwrap_or(0),
            dispatching = snapshot.jobs.get("dispatching").copied().unwrap_or(0),
            running = snapshot.jobs.get("running").copied().unwrap_or(0),
            completed = snapshot.jobs.get("completed").copied().unwrap_or(0),
            failed = snapshot.jobs.get("failed").copied().unwrap_or(0),
            active_sandboxes = snapshot.active_sandboxes,
            reservation_store_healthy = snapshot.reservation_store_healthy,
            codes = %serde_json::to_string(&snapshot.codes).unwrap_or_default(),
            "Metrics snapshot"
        );
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::NewJob;
    use crate::testing::{Harness, StaticWorkerLocator, WorkerReply};

    #[tokio::test]
    async fn snapshot_counts_jobs_sandboxes_and_codes() {
        let h = Harness::new(
            StaticWorkerLocator::available("http://worker-1:8621"),
            WorkerReply::Accept,
        );
        let running = h.jobs.create(NewJob::new("octotel", "validation")).await.unwrap();
        h.jobs.create(NewJob::new("mfn", "validation")).await.unwrap();
        h.dispatcher.dispatch(&running).await;

        let reporter = MetricsReporter::new(h.jobs.clone(), h.sandboxes.clone(), h.codes.clone());
        let snapshot = reporter.report().await;

        assert_eq!(snapshot.jobs["pending"], 1);
        assert_eq!(snapshot.jobs["running"], 1);
        assert_eq!(snapshot.jobs["failed"], 0);
        assert_eq!(snapshot.active_sandboxes, 1);
        assert_eq!(snapshot.codes["octotel"].generated, 1);
        assert!(snapshot.reservation_store_healthy);
    }
}
