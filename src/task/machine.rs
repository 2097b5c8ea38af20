//! The task state machine.
//!
//! A task is one browser-automation unit bounded by a step budget. Each step
//! captures a page snapshot, asks the planner for an ordered action list, and
//! executes those actions through the driver. Steps retry on failure with a
//! strictly increasing retry index; the task ends when a step verifies goal
//! completion, the budget runs out, or the retry budget is exceeded.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::Value;
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

use crate::browser::{BrowserDriver, SessionHandle};
use crate::error::Result;
use crate::planner::{Planner, StepSummary};
use crate::storage::{ActionRecord, RunStore, StepRecord};
use crate::task::actions::{Action, ActionResult};

/// Resolved task configuration, ready to execute.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub block_label: String,
    /// Starting URL; the task continues from the current page if unset.
    pub url: Option<String>,
    pub goal: String,
    pub data_extraction_goal: Option<String>,
    /// Criterion checked by completion verification; defaults to the goal.
    pub completion_criteria: Option<String>,
    /// Condition under which the planner should terminate instead of
    /// completing.
    pub termination_criteria: Option<String>,
    pub max_steps: u32,
    pub max_step_retries: u32,
    pub step_timeout: Duration,
}

/// Terminal task status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// A step verified goal completion.
    Completed,
    /// Retry budget exceeded or a non-retryable failure occurred.
    Failed,
    /// Step budget exhausted, task deadline hit, or goal-driven abort.
    /// Distinct from failed.
    Terminated,
    /// Cooperative cancellation observed between actions.
    Canceled,
}

/// Result of one task execution.
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub status: TaskStatus,
    /// Extracted data or completion payload.
    pub output: Value,
    pub steps_taken: u32,
    pub failure_reason: Option<String>,
    /// A browser download fired during the task.
    pub download_triggered: bool,
}

enum StepOutcome {
    /// Completion verified; payload attached.
    GoalAchieved(Value),
    /// All executed actions succeeded; goal not yet reached.
    Progressed,
    Failed(String),
    /// Goal-driven stop (terminate action or planner abort).
    Aborted(String),
    Canceled,
}

struct StepEval {
    outcome: StepOutcome,
    notes: Vec<String>,
    extracted: Option<Value>,
    download_triggered: bool,
}

/// Execute one task against a reserved browser session.
///
/// Cancellation is observed between action boundaries, never mid-action.
#[instrument(
    name = "task.run",
    skip_all,
    fields(block = %spec.block_label, run_id = %run_id)
)]
#[allow(clippy::too_many_arguments)]
pub async fn run_task(
    spec: &TaskSpec,
    driver: &Arc<dyn BrowserDriver>,
    planner: &Arc<dyn Planner>,
    session: &SessionHandle,
    store: &Arc<dyn RunStore>,
    run_id: &str,
    cancel: &Arc<AtomicBool>,
    deadline: Instant,
) -> Result<TaskOutcome> {
    let mut history: Vec<StepSummary> = Vec::new();
    let mut extracted = Value::Null;
    let mut download_triggered = false;
    let mut steps_taken = 0u32;
    let mut step_index = 0u32;
    let mut retry_index = 0u32;

    if let Some(url) = &spec.url {
        let navigate = Action::Navigate { url: url.clone() };
        match driver.perform_action(session, None, &navigate).await? {
            ActionResult::Success { .. } => {}
            ActionResult::Failure { message, .. } => {
                return Ok(failed_outcome(
                    format!("Initial navigation failed: {}", message),
                    steps_taken,
                ));
            }
            ActionResult::Abort { reason } => {
                return Ok(TaskOutcome {
                    status: TaskStatus::Terminated,
                    output: Value::Null,
                    steps_taken,
                    failure_reason: Some(reason),
                    download_triggered: false,
                });
            }
        }
    }

    while steps_taken < spec.max_steps {
        if cancel.load(Ordering::SeqCst) {
            return Ok(canceled_outcome(steps_taken));
        }

        let Some(remaining) = remaining_until(deadline) else {
            return Ok(TaskOutcome {
                status: TaskStatus::Terminated,
                output: extracted,
                steps_taken,
                failure_reason: Some("Task deadline exceeded".into()),
                download_triggered,
            });
        };

        steps_taken += 1;

        let mut step_record = StepRecord {
            id: uuid::Uuid::new_v4().to_string(),
            run_id: run_id.to_string(),
            block_label: spec.block_label.clone(),
            step_index,
            retry_index,
            succeeded: false,
            error: None,
            started_at: Utc::now(),
            finished_at: None,
        };
        store.save_step(&step_record).await?;

        let step_budget = remaining.min(spec.step_timeout);
        let eval = match timeout(
            step_budget,
            run_step(spec, driver, planner, session, store, run_id, cancel, &step_record.id, &history),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => StepEval {
                outcome: StepOutcome::Failed(format!(
                    "Step timed out after {}s",
                    step_budget.as_secs()
                )),
                notes: vec!["step timed out".into()],
                extracted: None,
                download_triggered: false,
            },
        };

        if let Some(data) = eval.extracted {
            extracted = data;
        }
        download_triggered |= eval.download_triggered;

        history.push(StepSummary {
            step_index,
            retry_index,
            succeeded: !matches!(eval.outcome, StepOutcome::Failed(_)),
            notes: eval.notes,
        });

        step_record.finished_at = Some(Utc::now());
        match &eval.outcome {
            StepOutcome::Failed(message) => step_record.error = Some(message.clone()),
            _ => step_record.succeeded = true,
        }
        store.save_step(&step_record).await?;

        match eval.outcome {
            StepOutcome::GoalAchieved(payload) => {
                let output = if payload.is_null() { extracted } else { payload };
                info!(steps = steps_taken, "Task goal achieved");
                return Ok(TaskOutcome {
                    status: TaskStatus::Completed,
                    output,
                    steps_taken,
                    failure_reason: None,
                    download_triggered,
                });
            }
            StepOutcome::Aborted(reason) => {
                info!(reason = %reason, "Task aborted by goal-driven stop");
                return Ok(TaskOutcome {
                    status: TaskStatus::Terminated,
                    output: extracted,
                    steps_taken,
                    failure_reason: Some(reason),
                    download_triggered,
                });
            }
            StepOutcome::Canceled => return Ok(canceled_outcome(steps_taken)),
            StepOutcome::Progressed => {
                step_index += 1;
                retry_index = 0;
            }
            StepOutcome::Failed(message) => {
                warn!(step = step_index, retry = retry_index, "Step failed: {}", message);
                retry_index += 1;
                if retry_index > spec.max_step_retries {
                    return Ok(failed_outcome(
                        format!(
                            "Step {} exceeded {} retries: {}",
                            step_index, spec.max_step_retries, message
                        ),
                        steps_taken,
                    ));
                }
            }
        }
    }

    Ok(TaskOutcome {
        status: TaskStatus::Terminated,
        output: extracted,
        steps_taken,
        failure_reason: Some(format!("Step budget of {} exhausted", spec.max_steps)),
        download_triggered,
    })
}

/// Execute one step: plan, then dispatch actions in order.
#[allow(clippy::too_many_arguments)]
async fn run_step(
    spec: &TaskSpec,
    driver: &Arc<dyn BrowserDriver>,
    planner: &Arc<dyn Planner>,
    session: &SessionHandle,
    store: &Arc<dyn RunStore>,
    run_id: &str,
    cancel: &Arc<AtomicBool>,
    step_id: &str,
    history: &[StepSummary],
) -> Result<StepEval> {
    let snapshot = driver.capture_page(session).await?;
    let planned = planner.plan(&snapshot, &planning_goal(spec), history).await?;

    if planned.is_empty() {
        return Ok(StepEval {
            outcome: StepOutcome::Failed("Planner returned no actions".into()),
            notes: vec!["empty plan".into()],
            extracted: None,
            download_triggered: false,
        });
    }

    let mut notes = Vec::with_capacity(planned.len());
    let mut extracted: Option<Value> = None;
    let mut download_triggered = false;
    let mut failure: Option<String> = None;

    for planned_action in &planned {
        if cancel.load(Ordering::SeqCst) {
            return Ok(StepEval {
                outcome: StepOutcome::Canceled,
                notes,
                extracted,
                download_triggered,
            });
        }

        let action = &planned_action.action;

        // Completion is a verification point, not a driver call.
        if let Action::Complete { data } = action {
            let criteria = spec
                .completion_criteria
                .as_deref()
                .unwrap_or(spec.goal.as_str());
            let page = driver.capture_page(session).await?;
            let verdict = planner.verify_completion(&page, criteria).await?;
            record_action(store, run_id, step_id, action, &ActionResult::success(Value::Null))
                .await?;

            if verdict.achieved {
                notes.push(format!("complete: {}", verdict.rationale));
                return Ok(StepEval {
                    outcome: StepOutcome::GoalAchieved(data.clone().unwrap_or(Value::Null)),
                    notes,
                    extracted,
                    download_triggered,
                });
            }
            notes.push(format!("completion not verified: {}", verdict.rationale));
            failure = Some(format!("Completion not verified: {}", verdict.rationale));
            break;
        }

        if let Action::Terminate { reason } = action {
            record_action(store, run_id, step_id, action, &ActionResult::success(Value::Null))
                .await?;
            return Ok(StepEval {
                outcome: StepOutcome::Aborted(reason.clone()),
                notes,
                extracted,
                download_triggered,
            });
        }

        let result = dispatch_action(driver, session, action).await?;
        record_action(store, run_id, step_id, action, &result).await?;

        match result {
            ActionResult::Success {
                data,
                download_triggered: download,
                ..
            } => {
                download_triggered |= download;
                if matches!(action, Action::Extract { .. }) {
                    extracted = Some(data);
                }
                notes.push(format!("{}: ok", action.kind()));
            }
            ActionResult::Failure {
                kind,
                message,
                stop_execution_on_failure,
            } => {
                notes.push(format!("{}: {:?}: {}", action.kind(), kind, message));
                failure = Some(message);
                if stop_execution_on_failure {
                    debug!("Stopping step early: failure with stop_execution_on_failure");
                    break;
                }
            }
            ActionResult::Abort { reason } => {
                notes.push(format!("{}: abort", action.kind()));
                return Ok(StepEval {
                    outcome: StepOutcome::Aborted(reason),
                    notes,
                    extracted,
                    download_triggered,
                });
            }
        }
    }

    let outcome = match failure {
        Some(message) => StepOutcome::Failed(message),
        None => StepOutcome::Progressed,
    };

    Ok(StepEval {
        outcome,
        notes,
        extracted,
        download_triggered,
    })
}

/// Resolve the declared target (if any), then perform the action.
async fn dispatch_action(
    driver: &Arc<dyn BrowserDriver>,
    session: &SessionHandle,
    action: &Action,
) -> Result<ActionResult> {
    let element = match action.target() {
        Some(reference) => match driver.resolve_element(session, reference).await {
            Ok(handle) => Some(handle),
            Err(e) => {
                return Ok(ActionResult::failure(
                    crate::task::actions::FailureKind::ElementNotFound,
                    format!("Could not resolve '{}': {}", reference, e),
                    false,
                ))
            }
        },
        None => None,
    };

    driver.perform_action(session, element.as_ref(), action).await
}

async fn record_action(
    store: &Arc<dyn RunStore>,
    run_id: &str,
    step_id: &str,
    action: &Action,
    result: &ActionResult,
) -> Result<()> {
    store
        .save_action(&ActionRecord {
            id: uuid::Uuid::new_v4().to_string(),
            run_id: run_id.to_string(),
            step_id: step_id.to_string(),
            action_kind: action.kind().to_string(),
            target: action.target().map(str::to_string),
            result: result.clone(),
            created_at: Utc::now(),
        })
        .await
}

/// The goal text handed to the planner, with the extraction goal and
/// termination criterion folded in.
fn planning_goal(spec: &TaskSpec) -> String {
    let mut goal = spec.goal.clone();
    if let Some(extraction) = &spec.data_extraction_goal {
        if extraction != &spec.goal {
            goal = format!("{} Also extract: {}", goal, extraction);
        }
    }
    if let Some(termination) = &spec.termination_criteria {
        goal = format!("{} Terminate if: {}", goal, termination);
    }
    goal
}

fn failed_outcome(reason: String, steps_taken: u32) -> TaskOutcome {
    TaskOutcome {
        status: TaskStatus::Failed,
        output: Value::Null,
        steps_taken,
        failure_reason: Some(reason),
        download_triggered: false,
    }
}

fn canceled_outcome(steps_taken: u32) -> TaskOutcome {
    TaskOutcome {
        status: TaskStatus::Canceled,
        output: Value::Null,
        steps_taken,
        failure_reason: Some("Run canceled".into()),
        download_triggered: false,
    }
}

fn remaining_until(deadline: Instant) -> Option<Duration> {
    let now = Instant::now();
    if now >= deadline {
        None
    } else {
        Some(deadline.saturating_duration_since(now))
    }
}
