use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;

use crate::worker::api::WorkerStatus;
use crate::worker::{WorkerEndpoint, WorkerLocator};

/// Probes a static list of workers, first available wins.
pub struct HttpWorkerLocator {
    client: Client,
    workers: Vec<WorkerEndpoint>,
}

impl HttpWorkerLocator {
    pub fn new(urls: &[String], probe_timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(probe_timeout).build()?;
        Ok(Self {
            client,
            workers: urls.iter().map(WorkerEndpoint::new).collect(),
        })
    }

    pub fn workers(&self) -> &[WorkerEndpoint] {
        &self.workers
    }

    async fn is_available(&self, worker: &WorkerEndpoint) -> bool {
        let url = format!("{}/status", worker.url);
        let response = match self.client.get(&url).send().await {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                tracing::debug!(worker = %worker, status = %r.status(), "Worker status probe failed");
                return false;
            }
            Err(e) => {
                tracing::debug!(worker = %worker, error = %e, "Worker unreachable");
                return false;
            }
        };
        match response.json::<WorkerStatus>().await {
            Ok(status) => status.available,
            Err(e) => {
                tracing::debug!(worker = %worker, error = %e, "Unparseable worker status");
                false
            }
        }
    }
}

#[async_trait]
impl WorkerLocator for HttpWorkerLocator {
    async fn find_available(&self) -> Option<WorkerEndpoint> {
        for worker in &self.workers {
            if self.is_available(worker).await {
                return Some(worker.clone());
            }
        }
        tracing::debug!(pool = self.workers.len(), "No available worker");
        None
    }
}
