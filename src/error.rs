//! Error types for strider.
//!
//! Every layer of the engine (action, step, block, run) returns explicit
//! `Result` values; retry loops live in the callers, never in catch blocks.
//! Each variant carries a stable code and a retryability classification that
//! the block retry policy consults.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for strider operations.
pub type Result<T> = std::result::Result<T, Error>;

/// strider error types.
#[derive(Error, Debug)]
pub enum Error {
    /// Bad parameter, undefined reference, reference cycle, scope violation.
    /// Never retried; always surfaces to the block/run as a failure.
    #[error("Validation error: {0}")]
    Validation(String),

    /// An output parameter was read before its producing block executed
    /// under the requested scope. Distinct from "does not exist".
    #[error("Output not ready: {0}")]
    NotReady(String),

    /// A step, task, or block exceeded its time budget.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// A sandboxed code block violated its capability boundary.
    /// Terminates the run even under continue_on_failure.
    #[error("Security violation: {0}")]
    Security(String),

    /// External collaborator failure over the network.
    #[error("Network error: {0}")]
    Network(String),

    /// Browser driver failure (session, element resolution, action dispatch).
    #[error("Browser error: {0}")]
    Browser(String),

    /// The run was canceled by an explicit signal.
    #[error("Canceled: {0}")]
    Canceled(String),

    /// Workflow definition could not be parsed.
    #[error("Parse error: {0}")]
    Parse(String),

    /// Engine or collaborator configuration problem.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Run store failure.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Uncategorized failure. Treated as non-retryable and surfaced.
    #[error("Unknown error: {0}")]
    Unknown(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Get the stable error code for reporting surfaces.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Validation(_) => "VALIDATION_ERROR",
            Error::NotReady(_) => "OUTPUT_NOT_READY",
            Error::Timeout(_) => "TIMEOUT",
            Error::Security(_) => "SECURITY_ERROR",
            Error::Network(_) => "NETWORK_ERROR",
            Error::Browser(_) => "BROWSER_ERROR",
            Error::Canceled(_) => "CANCELED",
            Error::Parse(_) => "PARSE_ERROR",
            Error::Config(_) => "CONFIG_ERROR",
            Error::Storage(_) => "STORAGE_ERROR",
            Error::Unknown(_) => "UNKNOWN_ERROR",
            Error::Http(_) => "NETWORK_ERROR",
            Error::Json(_) => "JSON_ERROR",
            Error::Yaml(_) => "YAML_ERROR",
            Error::Io(_) => "IO_ERROR",
        }
    }

    /// Whether the block retry policy may re-attempt after this failure.
    ///
    /// Timeouts and external-collaborator failures are transient; validation,
    /// security, and cancellation are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_) | Error::Network(_) | Error::Browser(_) | Error::Http(_)
        )
    }

    /// Whether this failure must terminate the run even when the failing
    /// block is marked continue_on_failure.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Security(_) | Error::Canceled(_))
    }
}

/// Structured failure reason recorded on block and run records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureReason {
    pub code: String,
    pub message: String,
}

impl FailureReason {
    pub fn from_error(error: &Error) -> Self {
        Self {
            code: error.code().to_string(),
            message: error.to_string(),
        }
    }
}
