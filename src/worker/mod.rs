//! Automation workers: finding one that is free and handing it a job.
//!
//! Workers are external HTTP services. Each exposes `GET /status` and
//! `POST /execute`, drives the job's browser sandbox, and reports back via
//! the orchestrator's callback endpoint.
//!
//! ```text
//! ┌──────────────┐  GET /status    ┌──────────┐
//! │ WorkerLocator├────────────────▶│ worker 1 │ (first available wins)
//! └──────────────┘                 │ worker 2 │
//! ┌──────────────┐  POST /execute  │   ...    │
//! │ WorkerClient ├────────────────▶│          │──▶ /callbacks/job-complete
//! └──────────────┘                 └──────────┘
//! ```

pub mod api;
mod client;
mod locator;

use async_trait::async_trait;

use crate::error::WorkerError;

pub use api::{CodeConsumption, CompletionReport, CompletionStatus, JobPayload};
pub use client::HttpWorkerClient;
pub use locator::HttpWorkerLocator;

/// A worker's base URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerEndpoint {
    pub url: String,
}

impl WorkerEndpoint {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into().trim_end_matches('/').to_string(),
        }
    }
}

impl std::fmt::Display for WorkerEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.url)
    }
}

/// Finds a worker able to take a job right now.
#[async_trait]
pub trait WorkerLocator: Send + Sync {
    async fn find_available(&self) -> Option<WorkerEndpoint>;
}

/// Hands a job to a worker.
#[async_trait]
pub trait WorkerClient: Send + Sync {
    /// `Ok` only when the worker accepted the job.
    async fn submit(&self, worker: &WorkerEndpoint, payload: &JobPayload)
    -> Result<(), WorkerError>;
}
