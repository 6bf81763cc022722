use serde::{Deserialize, Serialize};
use std::fmt;

/// Classification of a job failure.
///
/// Serialized as SCREAMING_SNAKE_CASE, which is also the `error.type` string
/// carried by `task-response` error frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, thiserror::Error)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    #[error("worker provisioning failed")]
    ProvisionError,
    #[error("provisioned worker did not become ready in time")]
    ProvisionTimeout,
    #[error("job could not be handed to the worker")]
    WorkerCommunicationError,
    /// Transient: the worker is behind an anti-bot challenge
    #[error("request blocked by challenge firewall")]
    CloudflareFirewall,
    #[error("worker hard reset failed")]
    WorkerResetError,
    #[error("challenge did not clear in time")]
    RecoveryTimeout,
    #[error("retry budget exhausted")]
    MaxRetriesExceeded,
    #[error("job never became executable on the worker")]
    PreparationTimeout,
    #[error("job failed on the worker")]
    ExecutionError,
    #[error("command frame could not be decoded")]
    InvalidCommand,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ProvisionError => "PROVISION_ERROR",
            ErrorKind::ProvisionTimeout => "PROVISION_TIMEOUT",
            ErrorKind::WorkerCommunicationError => "WORKER_COMMUNICATION_ERROR",
            ErrorKind::CloudflareFirewall => "CLOUDFLARE_FIREWALL",
            ErrorKind::WorkerResetError => "WORKER_RESET_ERROR",
            ErrorKind::RecoveryTimeout => "RECOVERY_TIMEOUT",
            ErrorKind::MaxRetriesExceeded => "MAX_RETRIES_EXCEEDED",
            ErrorKind::PreparationTimeout => "PREPARATION_TIMEOUT",
            ErrorKind::ExecutionError => "EXECUTION_ERROR",
            ErrorKind::InvalidCommand => "INVALID_COMMAND",
        }
    }

    /// Parse an error type reported by a worker (`TASK_ERROR.errorType`).
    ///
    /// Unrecognised names are treated as a plain execution failure.
    pub fn from_worker(error_type: &str) -> Self {
        match error_type {
            "PROVISION_ERROR" => ErrorKind::ProvisionError,
            "PROVISION_TIMEOUT" => ErrorKind::ProvisionTimeout,
            "WORKER_COMMUNICATION_ERROR" => ErrorKind::WorkerCommunicationError,
            "CLOUDFLARE_FIREWALL" => ErrorKind::CloudflareFirewall,
            "WORKER_RESET_ERROR" => ErrorKind::WorkerResetError,
            "RECOVERY_TIMEOUT" => ErrorKind::RecoveryTimeout,
            "MAX_RETRIES_EXCEEDED" => ErrorKind::MaxRetriesExceeded,
            "PREPARATION_TIMEOUT" | "TIMEOUT" => ErrorKind::PreparationTimeout,
            "INVALID_COMMAND" => ErrorKind::InvalidCommand,
            _ => ErrorKind::ExecutionError,
        }
    }

    /// True for the "blocked" classification routed to the retry coordinator
    pub fn is_transient(&self) -> bool {
        matches!(self, ErrorKind::CloudflareFirewall)
    }
}

/// Terminal failure of a job, reported upstream as a `task-response` error frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFailure {
    pub kind: ErrorKind,
    pub message: String,
}

impl JobFailure {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for JobFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)
    }
}

impl std::error::Error for JobFailure {}
