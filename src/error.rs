//! Error types for the orchestrator.
//!
//! Each subsystem has its own enum. `OrchestratorError` wraps them for the
//! composition root and the CLI; the dispatch path never lets one of these
//! escape past a single job (failures become the job's `failed` result).

use std::time::Duration;

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Configuration parse error: {0}")]
    ParseError(String),
}

/// Errors from a backing store (job store or reservation store).
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Store query failed: {0}")]
    Query(String),

    #[error("Job {id} not found")]
    NotFound { id: i64 },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors from the one-time code arbiter.
#[derive(Debug, thiserror::Error)]
pub enum CodeError {
    #[error("No secret loaded for code family '{family}'")]
    UnknownFamily { family: String },

    #[error("Invalid secret for code family '{family}': {reason}")]
    InvalidSecret { family: String, reason: String },

    #[error("Code acquisition exhausted for '{family}' after {attempts} attempts")]
    Exhausted { family: String, attempts: u32 },

    #[error("Code acquisition for '{family}' cancelled by shutdown")]
    Cancelled { family: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors from sandbox provisioning and teardown.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("Failed to create sandbox {sandbox_id}: {reason}")]
    CreateFailed { sandbox_id: String, reason: String },

    #[error("Sandbox {sandbox_id} {resource} already exists")]
    AlreadyExists { sandbox_id: String, resource: String },

    #[error("Sandbox {sandbox_id} not ready after {waited:?}")]
    NotReady { sandbox_id: String, waited: Duration },

    #[error("Sandbox {sandbox_id} compute unit entered terminal phase {phase}")]
    UnitFailed { sandbox_id: String, phase: String },

    #[error("Sandbox {sandbox_id} failed health check after {attempts} attempts")]
    HealthCheckFailed { sandbox_id: String, attempts: u32 },

    #[error("Control plane error: {reason}")]
    Api { reason: String, transient: bool },

    #[error("Control plane call '{operation}' timed out after {after:?}")]
    Timeout { operation: String, after: Duration },
}

impl SandboxError {
    /// Whether retrying the same call could succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Api { transient, .. } => *transient,
            Self::Timeout { .. } => true,
            _ => false,
        }
    }
}

/// Errors talking to automation workers.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Worker {url} unreachable: {reason}")]
    Unreachable { url: String, reason: String },

    #[error("Worker {url} rejected job: {reason}")]
    Rejected { url: String, reason: String },

    #[error("Worker {url} returned an invalid response: {reason}")]
    InvalidResponse { url: String, reason: String },
}

impl WorkerError {
    /// True when the worker answered and said no, so the payload was never acted on.
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::Rejected { .. })
    }
}

/// Top-level error for the composition root and CLI.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Code(#[from] CodeError),

    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error(transparent)]
    Worker(#[from] WorkerError),

    #[error("Failed to build HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error("Failed to start callback API on {addr}: {reason}")]
    ApiStartup { addr: String, reason: String },
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
