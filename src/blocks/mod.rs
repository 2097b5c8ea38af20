//! Block implementations.
//!
//! Blocks are the units of workflow execution. The variant set is closed
//! ([`crate::workflow::BlockKind`]); the engine dispatches exhaustively and
//! each variant module supplies one execution capability. Shared policy
//! (parameter resolution before side effects, retry, timeout,
//! continue_on_failure) lives in the engine, not here.

pub mod code;
pub mod email;
pub mod file;
pub mod for_loop;
pub mod http;
pub mod task;
pub mod validation;

use serde_json::Value;

use crate::error::{Error, FailureReason};
use crate::storage::BlockStatus;
use crate::task::{TaskOutcome, TaskStatus};

/// Per-iteration child status reported by loop blocks.
#[derive(Debug, Clone)]
pub struct ChildStatus {
    pub label: String,
    /// Scope signature the child executed under.
    pub scope: String,
    pub status: BlockStatus,
}

/// Result of one block execution.
#[derive(Debug, Clone)]
pub struct BlockOutcome {
    pub status: BlockStatus,
    pub output: Option<Value>,
    pub failure: Option<FailureReason>,
    pub child_statuses: Vec<ChildStatus>,
}

impl BlockOutcome {
    pub fn completed(output: Value) -> Self {
        Self {
            status: BlockStatus::Completed,
            output: Some(output),
            failure: None,
            child_statuses: Vec::new(),
        }
    }

    pub fn from_error(error: &Error) -> Self {
        let status = match error {
            Error::Timeout(_) => BlockStatus::TimedOut,
            Error::Canceled(_) => BlockStatus::Canceled,
            _ => BlockStatus::Failed,
        };
        Self {
            status,
            output: None,
            failure: Some(FailureReason::from_error(error)),
            child_statuses: Vec::new(),
        }
    }

    /// Map a finished task onto a block outcome.
    pub fn from_task(outcome: TaskOutcome) -> Self {
        let status = match outcome.status {
            TaskStatus::Completed => BlockStatus::Completed,
            TaskStatus::Failed => BlockStatus::Failed,
            TaskStatus::Terminated => BlockStatus::Terminated,
            TaskStatus::Canceled => BlockStatus::Canceled,
        };
        let failure = outcome.failure_reason.map(|message| FailureReason {
            code: match status {
                BlockStatus::Terminated => "TERMINATED".to_string(),
                BlockStatus::Canceled => "CANCELED".to_string(),
                _ => "TASK_FAILED".to_string(),
            },
            message,
        });
        Self {
            status,
            output: Some(outcome.output),
            failure,
            child_statuses: Vec::new(),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status == BlockStatus::Completed
    }

    /// Whether this failure terminates the run even under
    /// continue_on_failure.
    pub fn is_fatal(&self) -> bool {
        self.failure
            .as_ref()
            .map(|f| f.code == "SECURITY_ERROR")
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn error_outcomes_map_statuses() {
        let timeout = BlockOutcome::from_error(&Error::Timeout("t".into()));
        assert_eq!(timeout.status, BlockStatus::TimedOut);

        let canceled = BlockOutcome::from_error(&Error::Canceled("c".into()));
        assert_eq!(canceled.status, BlockStatus::Canceled);

        let network = BlockOutcome::from_error(&Error::Network("n".into()));
        assert_eq!(network.status, BlockStatus::Failed);
        assert!(!network.is_fatal());
    }

    #[test]
    fn security_failures_are_fatal() {
        let outcome = BlockOutcome::from_error(&Error::Security("sandbox".into()));
        assert_eq!(outcome.status, BlockStatus::Failed);
        assert!(outcome.is_fatal());
    }

    #[test]
    fn task_termination_is_not_failure() {
        let outcome = BlockOutcome::from_task(TaskOutcome {
            status: TaskStatus::Terminated,
            output: json!(null),
            steps_taken: 10,
            failure_reason: Some("budget".into()),
            download_triggered: false,
        });
        assert_eq!(outcome.status, BlockStatus::Terminated);
        assert!(!outcome.is_fatal());
    }
}
