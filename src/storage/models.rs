//! Run, block, step, and action records.
//!
//! These are the shapes the engine emits at its persistence write points.
//! The durable store behind [`crate::storage::RunStore`] defines its own
//! schema; everything here must stay queryable mid-run for observability.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::task::actions::ActionResult;

/// Workflow run status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Created,
    Running,
    Completed,
    /// Unrecovered error.
    Failed,
    /// Budget exhaustion or administrative stop. Not an error.
    Terminated,
    /// Explicit cancellation.
    Canceled,
    /// Run deadline exceeded.
    TimedOut,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Created | RunStatus::Running)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Terminated => write!(f, "terminated"),
            Self::Canceled => write!(f, "canceled"),
            Self::TimedOut => write!(f, "timed_out"),
        }
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "terminated" => Ok(Self::Terminated),
            "canceled" => Ok(Self::Canceled),
            "timed_out" => Ok(Self::TimedOut),
            _ => Err(format!("Unknown run status: {}", s)),
        }
    }
}

/// Block execution status.
///
/// `failed -> running` happens only through the bounded retry transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockStatus {
    Running,
    Completed,
    Failed,
    Terminated,
    Canceled,
    TimedOut,
}

impl std::fmt::Display for BlockStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Terminated => write!(f, "terminated"),
            Self::Canceled => write!(f, "canceled"),
            Self::TimedOut => write!(f, "timed_out"),
        }
    }
}

/// One execution instance of a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: String,
    pub workflow_name: String,
    pub organization: String,
    pub status: RunStatus,
    pub input: Value,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// One block execution (one record per attempt chain, updated in place).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockExecution {
    pub id: String,
    pub run_id: String,
    pub label: String,
    /// Loop-scope signature the block executed under; empty at the root.
    pub scope: String,
    pub kind: String,
    pub status: BlockStatus,
    /// 1-based attempt counter.
    pub attempt: u32,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// One step attempt within a task block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub id: String,
    pub run_id: String,
    pub block_label: String,
    pub step_index: u32,
    /// Strictly increasing across retries of the same step.
    pub retry_index: u32,
    pub succeeded: bool,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// One executed action and its result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRecord {
    pub id: String,
    pub run_id: String,
    pub step_id: String,
    pub action_kind: String,
    pub target: Option<String>,
    pub result: ActionResult,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_status_round_trip() {
        for status in [
            RunStatus::Created,
            RunStatus::Running,
            RunStatus::Completed,
            RunStatus::Failed,
            RunStatus::Terminated,
            RunStatus::Canceled,
            RunStatus::TimedOut,
        ] {
            let parsed: RunStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
    }

    #[test]
    fn terminal_statuses_stay_distinct() {
        // Reporting surfaces must be able to tell these apart.
        assert_ne!(RunStatus::Failed.to_string(), RunStatus::Terminated.to_string());
        assert_ne!(RunStatus::Canceled.to_string(), RunStatus::TimedOut.to_string());
        assert!(RunStatus::Canceled.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
    }
}
