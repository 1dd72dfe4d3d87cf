use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::clock::elapsed;
use crate::sandbox::{SandboxHandle, SandboxStatus};

/// Sandboxes currently owned by jobs, keyed by sandbox id.
///
/// Cheap to clone; clones share the same map.
#[derive(Clone, Default)]
pub struct ActiveSandboxes {
    inner: Arc<RwLock<HashMap<String, SandboxHandle>>>,
}

impl ActiveSandboxes {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, handle: SandboxHandle) {
        self.inner
            .write()
            .await
            .insert(handle.sandbox_id.clone(), handle);
    }

    /// Remove and return an entry. Only one caller can win a given id.
    pub async fn take(&self, sandbox_id: &str) -> Option<SandboxHandle> {
        self.inner.write().await.remove(sandbox_id)
    }

    pub async fn get(&self, sandbox_id: &str) -> Option<SandboxHandle> {
        self.inner.read().await.get(sandbox_id).cloned()
    }

    pub async fn find_by_job(&self, job_id: i64) -> Option<SandboxHandle> {
        self.inner
            .read()
            .await
            .values()
            .find(|h| h.job_id == job_id)
            .cloned()
    }

    pub async fn list(&self) -> Vec<SandboxHandle> {
        let mut handles: Vec<SandboxHandle> = self.inner.read().await.values().cloned().collect();
        handles.sort_by_key(|h| h.created_at);
        handles
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }

    /// Ids older than `max_age`, plus any stuck in `terminating`.
    pub async fn due_for_sweep(&self, now: DateTime<Utc>, max_age: Duration) -> Vec<String> {
        self.inner
            .read()
            .await
            .values()
            .filter(|h| {
                h.status == SandboxStatus::Terminating || elapsed(h.created_at, now) >= max_age
            })
            .map(|h| h.sandbox_id.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(id: &str, job_id: i64, created_at: DateTime<Utc>) -> SandboxHandle {
        SandboxHandle {
            sandbox_id: id.to_string(),
            job_id,
            endpoint: format!("http://{id}:8080"),
            unit_name: crate::sandbox::unit_name(id),
            endpoint_name: crate::sandbox::endpoint_name(id),
            created_at,
            status: SandboxStatus::Active,
        }
    }

    #[tokio::test]
    async fn take_is_exclusive() {
        let active = ActiveSandboxes::new();
        active.insert(handle("a", 1, Utc::now())).await;

        let clone = active.clone();
        assert!(clone.take("a").await.is_some());
        assert!(active.take("a").await.is_none());
        assert!(active.is_empty().await);
    }

    #[tokio::test]
    async fn sweep_selects_old_and_terminating() {
        let now = Utc::now();
        let active = ActiveSandboxes::new();
        active
            .insert(handle("old", 1, now - chrono::Duration::minutes(11)))
            .await;
        active.insert(handle("young", 2, now)).await;
        let mut stuck = handle("stuck", 3, now);
        stuck.status = SandboxStatus::Terminating;
        active.insert(stuck).await;

        let mut due = active.due_for_sweep(now, Duration::from_secs(600)).await;
        due.sort();
        assert_eq!(due, vec!["old", "stuck"]);
        assert_eq!(active.find_by_job(2).await.unwrap().sandbox_id, "young");
    }
}
