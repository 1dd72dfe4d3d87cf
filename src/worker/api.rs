//! Wire types exchanged with workers.

use serde::{Deserialize, Serialize};

use crate::jobs::JobStatus;

/// Body of `POST {worker}/execute`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobPayload {
    pub job_id: i64,
    pub provider: String,
    pub action: String,
    pub parameters: serde_json::Value,
    pub sandbox_endpoint: String,
    pub sandbox_id: String,
    /// One-time code, when the provider's portal needs one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub callback_url: String,
}

/// Body of `GET {worker}/status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub available: bool,
    #[serde(default)]
    pub active_jobs: Option<u32>,
}

/// Body returned by `POST {worker}/execute`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub status: String,
    #[serde(default)]
    pub message: Option<String>,
}

impl SubmitResponse {
    pub fn is_accepted(&self) -> bool {
        self.status == "accepted"
    }
}

/// Whether the job used its one-time code successfully.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeConsumption {
    pub provider: String,
    pub success: bool,
}

/// Body of `POST /callbacks/job-complete`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionReport {
    pub job_id: i64,
    /// Executor status word; see [`CompletionStatus`].
    pub status: String,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub sandbox_id: Option<String>,
    #[serde(default)]
    pub code_consumption: Option<CodeConsumption>,
}

/// Terminal outcome reported by a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    Completed,
    Failed,
}

impl CompletionStatus {
    pub fn job_status(&self) -> JobStatus {
        match self {
            Self::Completed => JobStatus::Completed,
            Self::Failed => JobStatus::Failed,
        }
    }
}

impl std::str::FromStr for CompletionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "completed" | "success" => Ok(Self::Completed),
            "failed" | "failure" | "error" => Ok(Self::Failed),
            other => Err(format!("unrecognised completion status '{}'", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completion_status_words() {
        assert_eq!("success".parse::<CompletionStatus>().unwrap(), CompletionStatus::Completed);
        assert_eq!("Completed".parse::<CompletionStatus>().unwrap(), CompletionStatus::Completed);
        assert_eq!("error".parse::<CompletionStatus>().unwrap(), CompletionStatus::Failed);
        assert_eq!("failure".parse::<CompletionStatus>().unwrap(), CompletionStatus::Failed);
        assert!("running".parse::<CompletionStatus>().is_err());
    }

    #[test]
    fn payload_omits_absent_code() {
        let payload = JobPayload {
            job_id: 1,
            provider: "mfn".to_string(),
            action: "validation".to_string(),
            parameters: serde_json::json!({}),
            sandbox_endpoint: "http://svc:8080".to_string(),
            sandbox_id: "browser-1-aaaa".to_string(),
            code: None,
            callback_url: "http://orch/callbacks/job-complete".to_string(),
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert!(json.get("code").is_none());
        assert_eq!(json["sandbox_endpoint"], "http://svc:8080");
    }

    #[test]
    fn report_tolerates_missing_optionals() {
        let report: CompletionReport =
            serde_json::from_str(r#"{"job_id": 5, "status": "success"}"#).unwrap();
        assert!(report.sandbox_id.is_none());
        assert!(report.code_consumption.is_none());
    }
}
