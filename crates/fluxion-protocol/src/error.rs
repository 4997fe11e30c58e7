use serde::{Deserialize, Serialize};

/// Machine-readable failure codes carried across the worker boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerErrorCode {
    #[serde(rename = "WORKER_OVERLOADED")]
    Overloaded,
    #[serde(rename = "WORKER_TIMEOUT")]
    Timeout,
    #[serde(rename = "WORKER_VERSION_MISMATCH")]
    VersionMismatch,
    #[serde(rename = "WORKER_DB_NOT_AVAILABLE")]
    DbNotAvailable,
    #[serde(rename = "WORKER_RESPONSE_TOO_LARGE")]
    ResponseTooLarge,
}

impl WorkerErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerErrorCode::Overloaded => "WORKER_OVERLOADED",
            WorkerErrorCode::Timeout => "WORKER_TIMEOUT",
            WorkerErrorCode::VersionMismatch => "WORKER_VERSION_MISMATCH",
            WorkerErrorCode::DbNotAvailable => "WORKER_DB_NOT_AVAILABLE",
            WorkerErrorCode::ResponseTooLarge => "WORKER_RESPONSE_TOO_LARGE",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "WORKER_OVERLOADED" => Some(WorkerErrorCode::Overloaded),
            "WORKER_TIMEOUT" => Some(WorkerErrorCode::Timeout),
            "WORKER_VERSION_MISMATCH" => Some(WorkerErrorCode::VersionMismatch),
            "WORKER_DB_NOT_AVAILABLE" => Some(WorkerErrorCode::DbNotAvailable),
            "WORKER_RESPONSE_TOO_LARGE" => Some(WorkerErrorCode::ResponseTooLarge),
            _ => None,
        }
    }
}

impl std::fmt::Display for WorkerErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failure serialized out of a worker.
///
/// `name` and `message` come from the thrown value; `stack` is preserved when
/// present so the boundary can log it. `code` is set for the typed protocol
/// failures and absent for plain handler throws.
#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
#[error("{name}: {message}")]
pub struct WorkerError {
    pub name: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<WorkerErrorCode>,
}

impl WorkerError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: None,
            code: None,
        }
    }

    pub fn coded(code: WorkerErrorCode, message: impl Into<String>) -> Self {
        Self {
            name: "WorkerError".to_string(),
            message: message.into(),
            stack: None,
            code: Some(code),
        }
    }

    pub fn has_code(&self, code: WorkerErrorCode) -> bool {
        self.code == Some(code)
    }
}
