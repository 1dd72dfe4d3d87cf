//! Job model and persistence.
//!
//! Status only ever moves forward along this graph:
//!
//! ```text
//! pending ──► dispatching ──► running ──► completed
//!                  │             │
//!                  ├──► failed ◄─┘
//!                  └──► completed   (callback beat the running write)
//! ```
//!
//! Every write is a compare-and-set against the caller's expected current
//! statuses, so duplicate callbacks and racing writers resolve to exactly
//! one effective transition.

mod memory;
mod postgres;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

pub use memory::InMemoryJobStore;
pub use postgres::PostgresJobStore;

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Dispatching,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        Self::Pending,
        Self::Dispatching,
        Self::Running,
        Self::Completed,
        Self::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Dispatching => "dispatching",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether moving from `self` to `next` keeps the lifecycle monotonic.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Dispatching)
                | (Dispatching, Running)
                | (Dispatching, Failed)
                | (Dispatching, Completed)
                | (Running, Completed)
                | (Running, Failed)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "dispatching" => Ok(Self::Dispatching),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Unknown job status: {}", s)),
        }
    }
}

/// External systems jobs automate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Provider {
    Mfn,
    Osn,
    Octotel,
    Evotel,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mfn => "mfn",
            Self::Osn => "osn",
            Self::Octotel => "octotel",
            Self::Evotel => "evotel",
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "mfn" => Ok(Self::Mfn),
            "osn" => Ok(Self::Osn),
            "octotel" => Ok(Self::Octotel),
            "evotel" => Ok(Self::Evotel),
            _ => Err(format!("Unknown provider: {}", s)),
        }
    }
}

/// What a job asks the provider's portal to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Validation,
    Cancellation,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Cancellation => "cancellation",
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Action {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "validation" => Ok(Self::Validation),
            "cancellation" => Ok(Self::Cancellation),
            _ => Err(format!("Unknown action: {}", s)),
        }
    }
}

/// A persisted job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    /// Raw provider name as submitted; validated at dispatch.
    pub provider: String,
    /// Raw action name as submitted; validated at dispatch.
    pub action: String,
    pub parameters: serde_json::Value,
    pub status: JobStatus,
    pub result: Option<serde_json::Value>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Failed with retries left. Scheduling the retry is the submitter's call.
    pub fn retry_eligible(&self) -> bool {
        self.status == JobStatus::Failed && self.retry_count < self.max_retries
    }

    /// Identifier the submitting system uses for this job, if it sent one.
    pub fn external_job_id(&self) -> Option<String> {
        match self.parameters.get("external_job_id")? {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

/// Parameters for creating a job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub provider: String,
    pub action: String,
    pub parameters: serde_json::Value,
    pub max_retries: u32,
}

impl NewJob {
    pub fn new(provider: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            action: action.into(),
            parameters: serde_json::json!({}),
            max_retries: 3,
        }
    }

    pub fn with_parameters(mut self, parameters: serde_json::Value) -> Self {
        self.parameters = parameters;
        self
    }
}

/// One row of a job's audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusChange {
    pub status: JobStatus,
    pub at: DateTime<Utc>,
    pub reason: Option<String>,
}

/// Outcome of a compare-and-set status write.
#[derive(Debug, Clone)]
pub enum Transition {
    Applied(Job),
    /// The job was not in any of the expected statuses.
    Rejected { current: JobStatus },
}

impl Transition {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }
}

/// Durable job storage.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a job in `pending`.
    async fn create(&self, job: NewJob) -> Result<Job, StoreError>;

    async fn get(&self, id: i64) -> Result<Option<Job>, StoreError>;

    /// Move a job to `to` if its current status is one of `from`.
    ///
    /// `result`, when given, replaces the stored result. Edges that would
    /// break monotonicity are rejected whatever `from` says.
    async fn transition(
        &self,
        id: i64,
        from: &[JobStatus],
        to: JobStatus,
        result: Option<serde_json::Value>,
        reason: Option<&str>,
    ) -> Result<Transition, StoreError>;

    /// Jobs in `status`, oldest first.
    async fn list_by_status(
        &self,
        status: JobStatus,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Job>, StoreError>;

    /// Audit trail of a job, oldest first.
    async fn history(&self, id: i64) -> Result<Vec<StatusChange>, StoreError>;

    async fn count_by_status(&self) -> Result<HashMap<JobStatus, u64>, StoreError>;
}

/// Statuses in `from` that may legally move to `to`.
pub(crate) fn legal_sources(from: &[JobStatus], to: JobStatus) -> Vec<JobStatus> {
    from.iter()
        .copied()
        .filter(|s| s.can_transition_to(to))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_are_monotonic() {
        use JobStatus::*;
        assert!(Pending.can_transition_to(Dispatching));
        assert!(Dispatching.can_transition_to(Running));
        assert!(Dispatching.can_transition_to(Failed));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Failed));

        assert!(!Running.can_transition_to(Pending));
        assert!(!Dispatching.can_transition_to(Pending));
        assert!(!Pending.can_transition_to(Running));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Pending));
        for s in JobStatus::ALL {
            assert!(!s.can_transition_to(s), "{s} -> {s}");
        }
    }

    #[test]
    fn status_round_trips_through_str() {
        for s in JobStatus::ALL {
            assert_eq!(s.as_str().parse::<JobStatus>().unwrap(), s);
        }
        assert!("queued".parse::<JobStatus>().is_err());
    }

    #[test]
    fn provider_and_action_parse_case_insensitively() {
        assert_eq!("OctoTel".parse::<Provider>().unwrap(), Provider::Octotel);
        assert_eq!(" mfn ".parse::<Provider>().unwrap(), Provider::Mfn);
        assert!("vumatel".parse::<Provider>().is_err());
        assert_eq!("Cancellation".parse::<Action>().unwrap(), Action::Cancellation);
        assert!("upgrade".parse::<Action>().is_err());
    }

    #[test]
    fn retry_eligibility() {
        let now = Utc::now();
        let mut job = Job {
            id: 1,
            provider: "osn".to_string(),
            action: "validation".to_string(),
            parameters: serde_json::json!({"external_job_id": 991}),
            status: JobStatus::Failed,
            result: None,
            retry_count: 2,
            max_retries: 3,
            created_at: now,
            updated_at: now,
        };
        assert!(job.retry_eligible());
        assert_eq!(job.external_job_id().as_deref(), Some("991"));

        job.retry_count = 3;
        assert!(!job.retry_eligible());

        job.retry_count = 0;
        job.status = JobStatus::Running;
        assert!(!job.retry_eligible());
    }
}
