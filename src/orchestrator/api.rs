//! HTTP listener for worker completion callbacks.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use tokio::sync::watch;

use crate::error::OrchestratorError;
use crate::orchestrator::auth::{CallbackAuth, callback_auth_middleware};
use crate::orchestrator::completion::CompletionHandler;
use crate::worker::CompletionReport;

/// Shared state for the callback API.
#[derive(Clone)]
pub struct CallbackState {
    pub completion: Arc<CompletionHandler>,
    pub auth: CallbackAuth,
}

pub struct CallbackApi;

impl CallbackApi {
    pub fn router(state: CallbackState) -> Router {
        Router::new()
            .route("/callbacks/job-complete", post(job_complete))
            .route_layer(axum::middleware::from_fn_with_state(
                state.auth.clone(),
                callback_auth_middleware,
            ))
            // Unauthenticated routes (added after the layer).
            .route("/health", get(health_check))
            .with_state(state)
    }

    /// Serve until `shutdown` turns true.
    pub async fn start(
        state: CallbackState,
        addr: SocketAddr,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), OrchestratorError> {
        let router = Self::router(state);
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| OrchestratorError::ApiStartup {
                addr: addr.to_string(),
                reason: e.to_string(),
            })?;

        tracing::info!("Callback API listening on {}", addr);

        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = shutdown.wait_for(|stop| *stop).await;
            })
            .await
            .map_err(|e| OrchestratorError::ApiStartup {
                addr: addr.to_string(),
                reason: e.to_string(),
            })
    }
}

async fn health_check() -> &'static str {
    "ok"
}

async fn job_complete(
    State(state): State<CallbackState>,
    Json(report): Json<CompletionReport>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<serde_json::Value>)> {
    tracing::debug!(
        job_id = report.job_id,
        status = %report.status,
        sandbox_id = ?report.sandbox_id,
        "Completion callback received"
    );

    let outcome = state
        .completion
        .handle_report(&report)
        .await
        .map_err(|e| {
            tracing::warn!(job_id = report.job_id, error = %e, "Rejected completion callback");
            (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(serde_json::json!({"error": e})),
            )
        })?;

    Ok(Json(serde_json::json!({
        "status": "ok",
        "applied": outcome.applied,
        "job_status": outcome.status,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use secrecy::SecretString;
    use tower::ServiceExt;

    use crate::jobs::{JobStatus, JobStore, NewJob};
    use crate::testing::{Harness, StaticWorkerLocator, WorkerReply};

    fn state(h: &Harness, token: Option<&str>) -> CallbackState {
        CallbackState {
            completion: h.completion.clone(),
            auth: CallbackAuth::new(token.map(|t| SecretString::from(t.to_string()))),
        }
    }

    fn harness() -> Harness {
        Harness::new(
            StaticWorkerLocator::available("http://worker-1:8621"),
            WorkerReply::Accept,
        )
    }

    fn callback(body: serde_json::Value, token: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/callbacks/job-complete")
            .header("content-type", "application/json");
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {}", token));
        }
        builder
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap()
    }

    async fn json_body(resp: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(resp.into_body(), 1024 * 1024)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_needs_no_token() {
        let h = harness();
        let router = CallbackApi::router(state(&h, Some("secret")));

        let req = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let resp = router.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn wrong_token_rejected() {
        let h = harness();
        let router = CallbackApi::router(state(&h, Some("secret")));

        let body = serde_json::json!({"job_id": 1, "status": "success"});
        let resp = router.clone().oneshot(callback(body.clone(), Some("nope"))).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let resp = router.oneshot(callback(body, None)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn completion_applied_through_http() {
        let h = harness();
        let job = h.jobs.create(NewJob::new("mfn", "validation")).await.unwrap();
        h.dispatcher.dispatch(&job).await;
        let sandbox_id = h.client.payloads()[0].sandbox_id.clone();
        let router = CallbackApi::router(state(&h, Some("secret")));

        let body = serde_json::json!({
            "job_id": job.id,
            "status": "success",
            "result": {"reference": "ABC"},
            "sandbox_id": sandbox_id,
        });
        let resp = router.oneshot(callback(body, Some("secret"))).await.unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        let json = json_body(resp).await;
        assert_eq!(json["applied"], true);
        assert_eq!(json["job_status"], "completed");
        assert_eq!(
            h.jobs.get(job.id).await.unwrap().unwrap().status,
            JobStatus::Completed
        );
        assert!(h.sandboxes.active().await.is_empty());
    }

    #[tokio::test]
    async fn unknown_status_is_unprocessable() {
        let h = harness();
        let router = CallbackApi::router(state(&h, None));

        let body = serde_json::json!({"job_id": 1, "status": "half-done"});
        let resp = router.oneshot(callback(body, None)).await.unwrap();

        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let json = json_body(resp).await;
        assert!(json["error"].as_str().unwrap().contains("half-done"));
    }
}
