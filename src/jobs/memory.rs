use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::clock::{Clock, SystemClock};
use crate::error::StoreError;
use crate::jobs::{Job, JobStatus, JobStore, NewJob, StatusChange, Transition, legal_sources};

struct Entry {
    job: Job,
    history: Vec<StatusChange>,
}

/// Process-local job store for tests and `--memory-store` runs.
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<i64, Entry>>,
    next_id: AtomicI64,
    clock: Arc<dyn Clock>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            next_id: AtomicI64::new(1),
            clock,
        }
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create(&self, new: NewJob) -> Result<Job, StoreError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let now = self.clock.now();
        let job = Job {
            id,
            provider: new.provider,
            action: new.action,
            parameters: new.parameters,
            status: JobStatus::Pending,
            result: None,
            retry_count: 0,
            max_retries: new.max_retries,
            created_at: now,
            updated_at: now,
        };
        let history = vec![StatusChange {
            status: JobStatus::Pending,
            at: now,
            reason: None,
        }];
        self.jobs.write().await.insert(
            id,
            Entry {
                job: job.clone(),
                history,
            },
        );
        Ok(job)
    }

    async fn get(&self, id: i64) -> Result<Option<Job>, StoreError> {
        Ok(self.jobs.read().await.get(&id).map(|e| e.job.clone()))
    }

    async fn transition(
        &self,
        id: i64,
        from: &[JobStatus],
        to: JobStatus,
        result: Option<serde_json::Value>,
        reason: Option<&str>,
    ) -> Result<Transition, StoreError> {
        let allowed = legal_sources(from, to);
        let mut jobs = self.jobs.write().await;
        let entry = jobs.get_mut(&id).ok_or(StoreError::NotFound { id })?;

        let current = entry.job.status;
        if !allowed.contains(&current) {
            return Ok(Transition::Rejected { current });
        }

        let now = self.clock.now();
        entry.job.status = to;
        entry.job.updated_at = now;
        if let Some(result) = result {
            entry.job.result = Some(result);
        }
        entry.history.push(StatusChange {
            status: to,
            at: now,
            reason: reason.map(str::to_string),
        });
        Ok(Transition::Applied(entry.job.clone()))
    }

    async fn list_by_status(
        &self,
        status: JobStatus,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Job>, StoreError> {
        let jobs = self.jobs.read().await;
        let mut matching: Vec<&Job> = jobs
            .values()
            .map(|e| &e.job)
            .filter(|j| j.status == status)
            .collect();
        matching.sort_by_key(|j| (j.created_at, j.id));
        Ok(matching
            .into_iter()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn history(&self, id: i64) -> Result<Vec<StatusChange>, StoreError> {
        self.jobs
            .read()
            .await
            .get(&id)
            .map(|e| e.history.clone())
            .ok_or(StoreError::NotFound { id })
    }

    async fn count_by_status(&self) -> Result<HashMap<JobStatus, u64>, StoreError> {
        let mut counts: HashMap<JobStatus, u64> =
            JobStatus::ALL.iter().map(|s| (*s, 0)).collect();
        for entry in self.jobs.read().await.values() {
            *counts.entry(entry.job.status).or_default() += 1;
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_starts_pending_with_history() {
        let store = InMemoryJobStore::new();
        let job = store.create(NewJob::new("osn", "validation")).await.unwrap();

        assert_eq!(job.status, JobStatus::Pending);
        let history = store.history(job.id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn transition_is_compare_and_set() {
        let store = InMemoryJobStore::new();
        let job = store.create(NewJob::new("osn", "validation")).await.unwrap();

        let first = store
            .transition(job.id, &[JobStatus::Pending], JobStatus::Dispatching, None, None)
            .await
            .unwrap();
        assert!(first.is_applied());

        let second = store
            .transition(job.id, &[JobStatus::Pending], JobStatus::Dispatching, None, None)
            .await
            .unwrap();
        match second {
            Transition::Rejected { current } => assert_eq!(current, JobStatus::Dispatching),
            Transition::Applied(_) => panic!("second claim must be rejected"),
        }
    }

    #[tokio::test]
    async fn illegal_edges_rejected_even_if_listed() {
        let store = InMemoryJobStore::new();
        let job = store.create(NewJob::new("osn", "validation")).await.unwrap();

        // pending -> running skips dispatching.
        let t = store
            .transition(job.id, &[JobStatus::Pending], JobStatus::Running, None, None)
            .await
            .unwrap();
        assert!(!t.is_applied());
        assert_eq!(store.get(job.id).await.unwrap().unwrap().status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn result_and_reason_recorded() {
        let store = InMemoryJobStore::new();
        let job = store.create(NewJob::new("osn", "validation")).await.unwrap();
        store
            .transition(job.id, &[JobStatus::Pending], JobStatus::Dispatching, None, None)
            .await
            .unwrap();
        store
            .transition(
                job.id,
                &[JobStatus::Dispatching],
                JobStatus::Failed,
                Some(serde_json::json!({"error": "no available worker"})),
                Some("no available worker"),
            )
            .await
            .unwrap();

        let stored = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.result.unwrap()["error"], "no available worker");
        let history = store.history(job.id).await.unwrap();
        let statuses: Vec<JobStatus> = history.iter().map(|h| h.status).collect();
        assert_eq!(
            statuses,
            vec![JobStatus::Pending, JobStatus::Dispatching, JobStatus::Failed]
        );
        assert_eq!(history[2].reason.as_deref(), Some("no available worker"));
    }

    #[tokio::test]
    async fn list_by_status_pages_oldest_first() {
        let store = InMemoryJobStore::new();
        let mut ids = Vec::new();
        for _ in 0..5 {
            ids.push(store.create(NewJob::new("mfn", "validation")).await.unwrap().id);
        }
        store
            .transition(ids[0], &[JobStatus::Pending], JobStatus::Dispatching, None, None)
            .await
            .unwrap();

        let page: Vec<i64> = store
            .list_by_status(JobStatus::Pending, 2, 1)
            .await
            .unwrap()
            .iter()
            .map(|j| j.id)
            .collect();
        assert_eq!(page, vec![ids[2], ids[3]]);

        let counts = store.count_by_status().await.unwrap();
        assert_eq!(counts[&JobStatus::Pending], 4);
        assert_eq!(counts[&JobStatus::Dispatching], 1);
        assert_eq!(counts[&JobStatus::Failed], 0);
    }

    #[tokio::test]
    async fn unknown_job_is_not_found() {
        let store = InMemoryJobStore::new();
        let err = store
            .transition(42, &[JobStatus::Running], JobStatus::Completed, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { id: 42 }));
    }
}
