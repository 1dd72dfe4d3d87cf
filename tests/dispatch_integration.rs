//! End-to-end dispatch against stub workers served on loopback.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use secrecy::SecretString;
use tokio::sync::mpsc;

use rpa_orchestrator::codes::{CodeArbiter, InMemoryReservationStore};
use rpa_orchestrator::config::{CodeArbiterConfig, SandboxConfig};
use rpa_orchestrator::error::WorkerError;
use rpa_orchestrator::jobs::{InMemoryJobStore, JobStatus, JobStore, NewJob};
use rpa_orchestrator::orchestrator::{
    CallbackApi, CallbackAuth, CallbackState, CompletionHandler, DispatchOutcome,
    DispatchSettings, JobDispatcher,
};
use rpa_orchestrator::sandbox::SandboxProvisioner;
use rpa_orchestrator::testing::{FakeControlPlane, OCTOTEL_SECRET, ScriptedProbe, manual_clock};
use rpa_orchestrator::worker::{
    HttpWorkerClient, HttpWorkerLocator, JobPayload, WorkerClient, WorkerEndpoint, WorkerLocator,
};

async fn serve(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{}", addr)
}

/// A worker stub: reports `available` on /status and answers /execute with
/// `reply`, forwarding every accepted payload to `seen`.
fn worker_stub(
    available: bool,
    reply: &'static str,
    seen: Option<mpsc::UnboundedSender<JobPayload>>,
) -> Router {
    Router::new()
        .route(
            "/status",
            get(move || async move {
                Json(serde_json::json!({"available": available, "active_jobs": 0}))
            }),
        )
        .route(
            "/execute",
            post(
                move |State(seen): State<Option<mpsc::UnboundedSender<JobPayload>>>,
                 Json(payload): Json<JobPayload>| async move {
                    if let Some(tx) = seen {
                        let _ = tx.send(payload);
                    }
                    Json(serde_json::json!({"status": reply, "message": "stub"}))
                },
            ),
        )
        .with_state(seen)
}

fn payload(callback_url: &str) -> JobPayload {
    JobPayload {
        job_id: 7,
        provider: "mfn".to_string(),
        action: "validation".to_string(),
        parameters: serde_json::json!({"circuit_number": "FTTX-1"}),
        sandbox_endpoint: "http://rpa-browser-svc-x:8080".to_string(),
        sandbox_id: "browser-7-abcd1234".to_string(),
        code: None,
        callback_url: callback_url.to_string(),
    }
}

#[tokio::test]
async fn locator_skips_busy_and_dead_workers() {
    let busy = serve(worker_stub(false, "accepted", None)).await;
    let free = serve(worker_stub(true, "accepted", None)).await;
    let urls = vec!["http://127.0.0.1:1".to_string(), busy, free.clone()];

    let locator = HttpWorkerLocator::new(&urls, Duration::from_secs(2)).unwrap();
    let found = locator.find_available().await.unwrap();

    assert_eq!(found.url, free);
}

#[tokio::test]
async fn locator_returns_none_when_all_busy() {
    let busy = serve(worker_stub(false, "accepted", None)).await;
    let locator = HttpWorkerLocator::new(&[busy], Duration::from_secs(2)).unwrap();
    assert!(locator.find_available().await.is_none());
}

#[tokio::test]
async fn client_distinguishes_accept_and_reject() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let accepting = serve(worker_stub(true, "accepted", Some(tx))).await;
    let rejecting = serve(worker_stub(true, "rejected", None)).await;
    let client = HttpWorkerClient::new(Duration::from_secs(5)).unwrap();

    client
        .submit(&WorkerEndpoint::new(&accepting), &payload("http://orch/cb"))
        .await
        .unwrap();
    let delivered = rx.recv().await.unwrap();
    assert_eq!(delivered.job_id, 7);
    assert_eq!(delivered.parameters["circuit_number"], "FTTX-1");

    let err = client
        .submit(&WorkerEndpoint::new(&rejecting), &payload("http://orch/cb"))
        .await
        .unwrap_err();
    assert!(err.is_rejection());
}

#[tokio::test]
async fn client_reports_unreachable_worker() {
    let client = HttpWorkerClient::new(Duration::from_secs(2)).unwrap();
    let err = client
        .submit(&WorkerEndpoint::new("http://127.0.0.1:1"), &payload("http://orch/cb"))
        .await
        .unwrap_err();
    assert!(matches!(err, WorkerError::Unreachable { .. }));
}

#[tokio::test]
async fn client_retries_refused_connection() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    // The worker comes up shortly after the first connect is refused.
    let (tx, mut rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
        axum::serve(listener, worker_stub(true, "accepted", Some(tx)))
            .await
            .unwrap();
    });

    let client = HttpWorkerClient::new(Duration::from_secs(5)).unwrap();
    client
        .submit(&WorkerEndpoint::new(&format!("http://{}", addr)), &payload("http://orch/cb"))
        .await
        .unwrap();
    assert_eq!(rx.recv().await.unwrap().job_id, 7);
}

#[tokio::test]
async fn client_does_not_resubmit_after_timeout() {
    let (tx, mut rx) = mpsc::unbounded_channel::<()>();
    let slow = Router::new()
        .route(
            "/execute",
            post(move |State(seen): State<mpsc::UnboundedSender<()>>| async move {
                let _ = seen.send(());
                tokio::time::sleep(Duration::from_secs(2)).await;
                Json(serde_json::json!({"status": "accepted"}))
            }),
        )
        .with_state(tx);
    let url = serve(slow).await;

    let client = HttpWorkerClient::new(Duration::from_millis(200)).unwrap();
    let err = client
        .submit(&WorkerEndpoint::new(&url), &payload("http://orch/cb"))
        .await
        .unwrap_err();

    assert!(matches!(err, WorkerError::Unreachable { .. }));
    rx.recv().await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn job_runs_to_completion_through_worker_and_callback() {
    let clock = manual_clock();
    let jobs = Arc::new(InMemoryJobStore::with_clock(clock.clone()));

    let mut code_config = CodeArbiterConfig::default();
    code_config.secrets.insert(
        "octotel".to_string(),
        SecretString::from(OCTOTEL_SECRET.to_string()),
    );
    let codes = Arc::new(CodeArbiter::new(
        &code_config,
        Arc::new(InMemoryReservationStore::with_clock(clock.clone())),
        clock.clone(),
    ));
    let plane = Arc::new(FakeControlPlane::ready());
    let sandboxes = Arc::new(SandboxProvisioner::new(
        SandboxConfig::default(),
        plane.clone(),
        Arc::new(ScriptedProbe::healthy()),
        clock.clone(),
    ));
    let completion = Arc::new(CompletionHandler::new(
        jobs.clone(),
        codes.clone(),
        sandboxes.clone(),
        clock.clone(),
    ));

    let orchestrator_url = serve(CallbackApi::router(CallbackState {
        completion,
        auth: CallbackAuth::new(Some(SecretString::from("cb-token".to_string()))),
    }))
    .await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let worker_url = serve(worker_stub(true, "accepted", Some(tx))).await;

    let dispatcher = Arc::new(JobDispatcher::new(
        jobs.clone(),
        codes.clone(),
        sandboxes.clone(),
        Arc::new(HttpWorkerLocator::new(&[worker_url.clone()], Duration::from_secs(2)).unwrap()),
        Arc::new(HttpWorkerClient::new(Duration::from_secs(5)).unwrap()),
        clock.clone(),
        DispatchSettings {
            callback_url: format!("{}/callbacks/job-complete", orchestrator_url),
            ..Default::default()
        },
    ));

    let job = jobs
        .create(NewJob::new("octotel", "cancellation").with_parameters(serde_json::json!({
            "circuit_number": "OCT-42",
            "external_job_id": "ext-42",
        })))
        .await
        .unwrap();

    let summary = dispatcher.run_once().await.unwrap();
    assert_eq!(summary.running, 1);

    let delivered = rx.recv().await.unwrap();
    assert_eq!(delivered.job_id, job.id);
    let code = delivered.code.clone().unwrap();
    assert_eq!(code.len(), 6);
    assert!(code.chars().all(|c| c.is_ascii_digit()));
    assert_eq!(jobs.get(job.id).await.unwrap().unwrap().status, JobStatus::Running);
    assert_eq!(sandboxes.active().await.len(), 1);

    // The worker reports back over HTTP.
    let http = reqwest::Client::new();
    let report = serde_json::json!({
        "job_id": job.id,
        "status": "success",
        "result": {"cancellation_reference": "CX-1"},
        "sandbox_id": delivered.sandbox_id,
        "code_consumption": {"provider": "octotel", "success": true},
    });

    let unauthorized = http
        .post(&delivered.callback_url)
        .json(&report)
        .send()
        .await
        .unwrap();
    assert_eq!(unauthorized.status(), reqwest::StatusCode::UNAUTHORIZED);

    let accepted = http
        .post(&delivered.callback_url)
        .bearer_auth("cb-token")
        .json(&report)
        .send()
        .await
        .unwrap();
    assert!(accepted.status().is_success());

    let finished = jobs.get(job.id).await.unwrap().unwrap();
    assert_eq!(finished.status, JobStatus::Completed);
    assert_eq!(finished.result.unwrap()["cancellation_reference"], "CX-1");
    assert!(sandboxes.active().await.is_empty());
    assert!(plane.unit_names().is_empty());

    let metrics = codes.metrics("octotel").await.unwrap();
    assert_eq!(metrics.generated, 1);
    assert_eq!(metrics.successes, 1);

    // A second dispatch tick finds nothing left to do.
    let idle = dispatcher.run_once().await.unwrap();
    assert_eq!(idle.total(), 0);
    assert!(matches!(
        dispatcher.dispatch(&finished_copy(&jobs, job.id).await).await,
        DispatchOutcome::Skipped { .. }
    ));
}

async fn finished_copy(jobs: &InMemoryJobStore, id: i64) -> rpa_orchestrator::jobs::Job {
    jobs.get(id).await.unwrap().unwrap()
}
