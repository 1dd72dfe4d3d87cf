//! Test doubles shared by unit and integration tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

use secrecy::SecretString;

use crate::clock::Clock;
use crate::codes::{CodeArbiter, InMemoryReservationStore};
use crate::config::{CodeArbiterConfig, SandboxConfig};
use crate::error::{SandboxError, WorkerError};
use crate::jobs::InMemoryJobStore;
use crate::orchestrator::{CompletionHandler, DispatchSettings, JobDispatcher};
use crate::sandbox::{
    ComputeControlPlane, Deletion, ManagedUnit, ReadinessProbe, SandboxProvisioner, SandboxSpec,
    UnitPhase, UnitStatus,
};
use crate::worker::{JobPayload, WorkerClient, WorkerEndpoint, WorkerLocator};

/// Clock whose `sleep` advances virtual time instantly.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
    sleeps: Mutex<Vec<Duration>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::at_secs(1_700_000_000)
    }

    pub fn at_secs(secs: i64) -> Self {
        let start = Utc.timestamp_opt(secs, 0).single().unwrap_or_default();
        Self {
            now: Mutex::new(start),
            sleeps: Mutex::new(Vec::new()),
        }
    }

    pub fn advance(&self, by: Duration) {
        let by = chrono::Duration::from_std(by).unwrap_or_default();
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }

    /// Every duration passed to `sleep`, in order.
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn total_slept(&self) -> Duration {
        self.sleeps().iter().sum()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn sleep(&self, duration: Duration) {
        self.sleeps
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(duration);
        self.advance(duration);
    }
}

/// In-memory control plane that records every call.
#[derive(Default)]
pub struct FakeControlPlane {
    state: Mutex<FakeState>,
}

#[derive(Default)]
struct FakeState {
    units: HashMap<String, ManagedUnit>,
    endpoints: HashSet<String>,
    /// Phases returned by successive status reads; the last one repeats.
    phases: Vec<UnitStatus>,
    fail_create_unit: bool,
    fail_create_endpoint: bool,
    /// Unit creates still to fail with a transient error.
    flaky_unit_creates: u32,
    /// Whether a flaky create stores the unit before failing.
    flaky_creates_land: bool,
    unit_creates: u32,
    fail_deletes: bool,
    unit_deletes: Vec<String>,
    endpoint_deletes: Vec<String>,
    status_reads: u32,
}

impl FakeControlPlane {
    pub fn new() -> Self {
        Self::default()
    }

    /// Units report running and ready on the first read.
    pub fn ready() -> Self {
        let plane = Self::new();
        plane.script_phases(vec![UnitStatus::ready()]);
        plane
    }

    pub fn script_phases(&self, phases: Vec<UnitStatus>) {
        self.lock().phases = phases;
    }

    pub fn fail_create_unit(&self) {
        self.lock().fail_create_unit = true;
    }

    pub fn fail_create_endpoint(&self) {
        self.lock().fail_create_endpoint = true;
    }

    /// Fail the next `times` unit creates with a transient error. With
    /// `lands`, the unit is stored anyway, as when a response is lost.
    pub fn flaky_unit_creates(&self, times: u32, lands: bool) {
        let mut state = self.lock();
        state.flaky_unit_creates = times;
        state.flaky_creates_land = lands;
    }

    pub fn unit_creates(&self) -> u32 {
        self.lock().unit_creates
    }

    pub fn fail_deletes(&self, fail: bool) {
        self.lock().fail_deletes = fail;
    }

    /// Register a unit as if an earlier process had created it.
    pub fn seed_unit(&self, unit: ManagedUnit) {
        let mut state = self.lock();
        state.endpoints.insert(unit.endpoint_name.clone());
        state.units.insert(unit.unit_name.clone(), unit);
    }

    pub fn unit_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().units.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn endpoint_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().endpoints.iter().cloned().collect();
        names.sort();
        names
    }

    /// Names passed to `delete_unit`, including no-op deletes.
    pub fn unit_deletes(&self) -> Vec<String> {
        self.lock().unit_deletes.clone()
    }

    pub fn endpoint_deletes(&self) -> Vec<String> {
        self.lock().endpoint_deletes.clone()
    }

    pub fn status_reads(&self) -> u32 {
        self.lock().status_reads
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl ComputeControlPlane for FakeControlPlane {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn endpoint_url(&self, endpoint_name: &str, port: u16) -> String {
        format!("http://{}:{}", endpoint_name, port)
    }

    async fn create_unit(&self, spec: &SandboxSpec) -> Result<(), SandboxError> {
        let mut state = self.lock();
        state.unit_creates += 1;
        if state.fail_create_unit {
            return Err(SandboxError::CreateFailed {
                sandbox_id: spec.sandbox_id.clone(),
                reason: "quota exceeded".to_string(),
            });
        }
        if state.units.contains_key(&spec.unit_name) {
            return Err(SandboxError::AlreadyExists {
                sandbox_id: spec.sandbox_id.clone(),
                resource: "unit".to_string(),
            });
        }
        let flaky = state.flaky_unit_creates > 0;
        if flaky {
            state.flaky_unit_creates -= 1;
        }
        if !flaky || state.flaky_creates_land {
            state.units.insert(
                spec.unit_name.clone(),
                ManagedUnit {
                    sandbox_id: Some(spec.sandbox_id.clone()),
                    job_id: Some(spec.job_id),
                    unit_name: spec.unit_name.clone(),
                    endpoint_name: spec.endpoint_name.clone(),
                    created_at: None,
                },
            );
        }
        if flaky {
            return Err(SandboxError::Api {
                reason: "connection reset".to_string(),
                transient: true,
            });
        }
        Ok(())
    }

    async fn create_endpoint(&self, spec: &SandboxSpec) -> Result<String, SandboxError> {
        let mut state = self.lock();
        if state.fail_create_endpoint {
            return Err(SandboxError::CreateFailed {
                sandbox_id: spec.sandbox_id.clone(),
                reason: "endpoint conflict".to_string(),
            });
        }
        state.endpoints.insert(spec.endpoint_name.clone());
        Ok(self.endpoint_url(&spec.endpoint_name, spec.port))
    }

    async fn unit_status(&self, unit_name: &str) -> Result<UnitStatus, SandboxError> {
        let mut state = self.lock();
        let read = state.status_reads as usize;
        state.status_reads += 1;
        if !state.units.contains_key(unit_name) {
            return Err(SandboxError::Api {
                reason: format!("unit {} not found", unit_name),
                transient: false,
            });
        }
        let status = state
            .phases
            .get(read)
            .or_else(|| state.phases.last())
            .cloned()
            .unwrap_or_else(|| UnitStatus {
                phase: UnitPhase::Pending,
                all_ready: false,
                message: None,
            });
        Ok(status)
    }

    async fn delete_unit(&self, unit_name: &str) -> Result<Deletion, SandboxError> {
        let mut state = self.lock();
        state.unit_deletes.push(unit_name.to_string());
        if state.fail_deletes {
            return Err(SandboxError::Api {
                reason: "control plane unavailable".to_string(),
                transient: true,
            });
        }
        Ok(match state.units.remove(unit_name) {
            Some(_) => Deletion::Deleted,
            None => Deletion::AlreadyAbsent,
        })
    }

    async fn delete_endpoint(&self, endpoint_name: &str) -> Result<Deletion, SandboxError> {
        let mut state = self.lock();
        state.endpoint_deletes.push(endpoint_name.to_string());
        if state.fail_deletes {
            return Err(SandboxError::Api {
                reason: "control plane unavailable".to_string(),
                transient: true,
            });
        }
        Ok(if state.endpoints.remove(endpoint_name) {
            Deletion::Deleted
        } else {
            Deletion::AlreadyAbsent
        })
    }

    async fn list_units(&self) -> Result<Vec<ManagedUnit>, SandboxError> {
        Ok(self.lock().units.values().cloned().collect())
    }
}

/// Readiness probe answering from a script; the last answer repeats.
pub struct ScriptedProbe {
    answers: Vec<bool>,
    calls: AtomicU32,
}

impl ScriptedProbe {
    pub fn new(answers: Vec<bool>) -> Self {
        Self {
            answers,
            calls: AtomicU32::new(0),
        }
    }

    pub fn healthy() -> Self {
        Self::new(vec![true])
    }

    pub fn never() -> Self {
        Self::new(vec![false])
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReadinessProbe for ScriptedProbe {
    async fn check(&self, _endpoint: &str) -> bool {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
        self.answers
            .get(n)
            .or_else(|| self.answers.last())
            .copied()
            .unwrap_or(false)
    }
}

/// Locator that always returns the same answer.
pub struct StaticWorkerLocator {
    worker: Option<WorkerEndpoint>,
    calls: AtomicU32,
}

impl StaticWorkerLocator {
    pub fn available(url: &str) -> Self {
        Self {
            worker: Some(WorkerEndpoint::new(url)),
            calls: AtomicU32::new(0),
        }
    }

    pub fn none() -> Self {
        Self {
            worker: None,
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WorkerLocator for StaticWorkerLocator {
    async fn find_available(&self) -> Option<WorkerEndpoint> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.worker.clone()
    }
}

/// How a [`RecordingWorkerClient`] answers submissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerReply {
    Accept,
    Reject,
    Unreachable,
}

/// Worker client that records payloads and answers per `reply`.
pub struct RecordingWorkerClient {
    reply: WorkerReply,
    payloads: Mutex<Vec<JobPayload>>,
}

impl RecordingWorkerClient {
    pub fn new(reply: WorkerReply) -> Self {
        Self {
            reply,
            payloads: Mutex::new(Vec::new()),
        }
    }

    pub fn payloads(&self) -> Vec<JobPayload> {
        self.payloads
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl WorkerClient for RecordingWorkerClient {
    async fn submit(&self, worker: &WorkerEndpoint, payload: &JobPayload) -> Result<(), WorkerError> {
        self.payloads
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(payload.clone());
        match self.reply {
            WorkerReply::Accept => Ok(()),
            WorkerReply::Reject => Err(WorkerError::Rejected {
                url: worker.url.clone(),
                reason: "busy".to_string(),
            }),
            WorkerReply::Unreachable => Err(WorkerError::Unreachable {
                url: worker.url.clone(),
                reason: "connection reset".to_string(),
            }),
        }
    }
}

/// Shorthand for tests that need a shared clock.
pub fn manual_clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new())
}

/// Octotel test secret (base32 of "12345678901234567890").
pub const OCTOTEL_SECRET: &str = "GEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQ";

/// Every component wired against fakes and one shared manual clock.
pub struct Harness {
    pub clock: Arc<ManualClock>,
    pub jobs: Arc<InMemoryJobStore>,
    pub codes: Arc<CodeArbiter>,
    pub plane: Arc<FakeControlPlane>,
    pub probe: Arc<ScriptedProbe>,
    pub sandboxes: Arc<SandboxProvisioner>,
    pub locator: Arc<StaticWorkerLocator>,
    pub client: Arc<RecordingWorkerClient>,
    pub dispatcher: Arc<JobDispatcher>,
    pub completion: Arc<CompletionHandler>,
}

impl Harness {
    pub fn new(locator: StaticWorkerLocator, reply: WorkerReply) -> Self {
        Self::with_settings(
            FakeControlPlane::ready(),
            locator,
            reply,
            DispatchSettings::default(),
        )
    }

    pub fn with_settings(
        plane: FakeControlPlane,
        locator: StaticWorkerLocator,
        reply: WorkerReply,
        settings: DispatchSettings,
    ) -> Self {
        let clock = manual_clock();
        let jobs = Arc::new(InMemoryJobStore::with_clock(clock.clone()));

        let mut code_config = CodeArbiterConfig::default();
        code_config.secrets.insert(
            "octotel".to_string(),
            SecretString::from(OCTOTEL_SECRET.to_string()),
        );
        let reservations = Arc::new(InMemoryReservationStore::with_clock(clock.clone()));
        let codes = Arc::new(CodeArbiter::new(&code_config, reservations, clock.clone()));

        let plane = Arc::new(plane);
        let probe = Arc::new(ScriptedProbe::healthy());
        let sandboxes = Arc::new(SandboxProvisioner::new(
            SandboxConfig::default(),
            plane.clone(),
            probe.clone(),
            clock.clone(),
        ));

        let locator = Arc::new(locator);
        let client = Arc::new(RecordingWorkerClient::new(reply));
        let dispatcher = Arc::new(JobDispatcher::new(
            jobs.clone(),
            codes.clone(),
            sandboxes.clone(),
            locator.clone(),
            client.clone(),
            clock.clone(),
            settings,
        ));
        let completion = Arc::new(CompletionHandler::new(
            jobs.clone(),
            codes.clone(),
            sandboxes.clone(),
            clock.clone(),
        ));

        Self {
            clock,
            jobs,
            codes,
            plane,
            probe,
            sandboxes,
            locator,
            client,
            dispatcher,
            completion,
        }
    }
}
