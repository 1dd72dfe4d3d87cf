//! Forwarding completion reports to the system that submitted the job.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;

use crate::config::ApiConfig;
use crate::jobs::Job;

#[derive(Debug, Clone, Serialize)]
pub struct CompletionNotice {
    pub job_id: i64,
    pub external_job_id: Option<String>,
    pub status: String,
    pub result: Option<serde_json::Value>,
    pub completed_at: DateTime<Utc>,
}

impl CompletionNotice {
    pub fn for_job(job: &Job, completed_at: DateTime<Utc>) -> Self {
        Self {
            job_id: job.id,
            external_job_id: job.external_job_id(),
            status: job.status.to_string(),
            result: job.result.clone(),
            completed_at,
        }
    }
}

pub struct CompletionNotifier {
    client: Client,
    endpoint: String,
    token: Option<SecretString>,
}

impl CompletionNotifier {
    pub fn new(
        endpoint: impl Into<String>,
        token: Option<SecretString>,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            token,
        })
    }

    /// `None` when no endpoint is configured.
    pub fn from_config(config: &ApiConfig) -> Result<Option<Self>, reqwest::Error> {
        config
            .notify_endpoint
            .as_ref()
            .map(|endpoint| {
                Self::new(
                    endpoint.clone(),
                    config.notify_token.clone(),
                    config.notify_timeout,
                )
            })
            .transpose()
    }

    pub async fn send(&self, notice: &CompletionNotice) -> Result<(), String> {
        let mut request = self.client.post(&self.endpoint).json(notice);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token.expose_secret());
        }
        let response = request.send().await.map_err(|e| e.to_string())?;
        if !response.status().is_success() {
            return Err(format!("HTTP {}", response.status()));
        }
        Ok(())
    }

    /// Send without waiting; failures are only logged.
    pub fn spawn_send(self: &Arc<Self>, notice: CompletionNotice) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            match this.send(&notice).await {
                Ok(()) => {
                    tracing::debug!(job_id = notice.job_id, "Completion notification delivered")
                }
                Err(e) => tracing::warn!(
                    job_id = notice.job_id,
                    error = %e,
                    "Completion notification failed"
                ),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn sends_notice_with_bearer_token() {
        let (tx, mut rx) = mpsc::unbounded_channel::<(Option<String>, serde_json::Value)>();
        let router = Router::new()
            .route(
                "/done",
                post(
                    |State(tx): State<mpsc::UnboundedSender<(Option<String>, serde_json::Value)>>,
                     headers: HeaderMap,
                     axum::Json(body): axum::Json<serde_json::Value>| async move {
                        let auth = headers
                            .get("authorization")
                            .and_then(|v| v.to_str().ok())
                            .map(str::to_string);
                        let _ = tx.send((auth, body));
                        StatusCode::OK
                    },
                ),
            )
            .with_state(tx);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        let notifier = CompletionNotifier::new(
            format!("http://{addr}/done"),
            Some(SecretString::from("s3cret".to_string())),
            Duration::from_secs(5),
        )
        .unwrap();
        let notice = CompletionNotice {
            job_id: 12,
            external_job_id: Some("EXT-9".to_string()),
            status: "completed".to_string(),
            result: Some(serde_json::json!({"ok": true})),
            completed_at: Utc::now(),
        };

        notifier.send(&notice).await.unwrap();

        let (auth, body) = rx.recv().await.unwrap();
        assert_eq!(auth.as_deref(), Some("Bearer s3cret"));
        assert_eq!(body["external_job_id"], "EXT-9");
        assert_eq!(body["status"], "completed");
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_an_error() {
        let notifier =
            CompletionNotifier::new("http://127.0.0.1:1/done", None, Duration::from_millis(500))
                .unwrap();
        let notice = CompletionNotice {
            job_id: 1,
            external_job_id: None,
            status: "failed".to_string(),
            result: None,
            completed_at: Utc::now(),
        };
        assert!(notifier.send(&notice).await.is_err());
    }
}
