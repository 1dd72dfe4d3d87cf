use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;

use crate::error::WorkerError;
use crate::worker::api::{JobPayload, SubmitResponse};
use crate::worker::{WorkerClient, WorkerEndpoint};

/// Attempts per submission when the connection itself fails.
const CONNECT_ATTEMPTS: u32 = 3;

const CONNECT_BACKOFF: Duration = Duration::from_millis(250);

/// Submits jobs with `POST {worker}/execute`.
pub struct HttpWorkerClient {
    client: Client,
}

impl HttpWorkerClient {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    /// Send the payload, retrying only failed connects. Nothing reached the
    /// worker in that case; a timeout may mean it already holds the job.
    async fn send(&self, url: &str, payload: &JobPayload) -> Result<reqwest::Response, WorkerError> {
        let mut attempt = 1;
        loop {
            match self.client.post(url).json(payload).send().await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_connect() && attempt < CONNECT_ATTEMPTS => {
                    tracing::debug!(url = %url, attempt, error = %e, "Worker connect failed, retrying");
                    attempt += 1;
                    tokio::time::sleep(CONNECT_BACKOFF).await;
                }
                Err(e) => {
                    return Err(WorkerError::Unreachable {
                        url: url.to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        }
    }
}

#[async_trait]
impl WorkerClient for HttpWorkerClient {
    async fn submit(
        &self,
        worker: &WorkerEndpoint,
        payload: &JobPayload,
    ) -> Result<(), WorkerError> {
        let url = format!("{}/execute", worker.url);
        let response = self.send(&url, payload).await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let reason = format!("HTTP {}: {}", status, body.chars().take(200).collect::<String>());
            // A 5xx may have come after the worker started acting on the job.
            return Err(if status.is_server_error() {
                WorkerError::InvalidResponse { url, reason }
            } else {
                WorkerError::Rejected { url, reason }
            });
        }

        let body: SubmitResponse =
            response
                .json()
                .await
                .map_err(|e| WorkerError::InvalidResponse {
                    url: url.clone(),
                    reason: e.to_string(),
                })?;

        if body.is_accepted() {
            Ok(())
        } else {
            Err(WorkerError::Rejected {
                url,
                reason: body.message.unwrap_or(body.status),
            })
        }
    }
}
