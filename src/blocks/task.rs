//! Task blocks - browser automation driven by the planner.
//!
//! `task` is the general form; `navigation`, `extraction`, and `login` are
//! specializations that preset the goal framing. All four resolve their
//! templates, reserve a browser session from the pool, and delegate to the
//! task state machine. The session is released on every exit path.

use std::time::Duration;

use serde_json::Value;
use tracing::warn;

use super::BlockOutcome;
use crate::context::{ContextSnapshot, RunContext};
use crate::engine::{RunEnv, Runner};
use crate::error::{Error, Result};
use crate::task::{run_task, TaskSpec};
use crate::workflow::expression::{render_template, value_to_string};
use crate::workflow::{BlockDef, BlockKind};

/// Execute a task-family block.
pub async fn execute(
    runner: &Runner,
    block: &BlockDef,
    ctx: &RunContext,
    env: &RunEnv,
) -> Result<BlockOutcome> {
    let snapshot = ctx.snapshot();
    let spec = build_spec(block, &snapshot, env)?;

    let lease = runner.sessions().reserve().await?;

    let outcome = run_task(
        &spec,
        runner.driver(),
        runner.planner(),
        lease.handle(),
        runner.store(),
        &env.run_id,
        &env.cancel,
        env.deadline,
    )
    .await;

    // Release the session before surfacing the task result.
    if let Err(e) = lease.close().await {
        warn!(block = %block.label, "Failed to close browser session: {}", e);
    }

    Ok(BlockOutcome::from_task(outcome?))
}

fn build_spec(block: &BlockDef, snapshot: &ContextSnapshot, env: &RunEnv) -> Result<TaskSpec> {
    let render = |template: &str| -> Result<String> {
        Ok(value_to_string(&render_template(template, snapshot)?))
    };

    let mut max_steps = env.settings.max_steps_per_task;
    let mut termination_criteria = None;
    let (url, goal, data_extraction_goal, completion_criteria) = match &block.kind {
        BlockKind::Task(config) => {
            if let Some(steps) = config.max_steps {
                max_steps = steps;
            }
            termination_criteria = config
                .termination_criteria
                .as_deref()
                .map(&render)
                .transpose()?;
            (
                config.url.as_deref().map(&render).transpose()?,
                render(&config.goal)?,
                config
                    .data_extraction_goal
                    .as_deref()
                    .map(&render)
                    .transpose()?,
                config
                    .completion_criteria
                    .as_deref()
                    .map(&render)
                    .transpose()?,
            )
        }
        BlockKind::Navigation { url, goal } => {
            let url = render(url)?;
            let goal = match goal {
                Some(goal) => render(goal)?,
                None => format!("Navigate to {} and confirm the page loaded", url),
            };
            (Some(url.clone()), goal.clone(), None, Some(goal))
        }
        BlockKind::Extraction { url, goal, schema } => {
            let goal = render(goal)?;
            let extraction_goal = match schema {
                Some(schema) => format!("{} Return data matching this schema: {}", goal, schema),
                None => goal.clone(),
            };
            (
                url.as_deref().map(&render).transpose()?,
                extraction_goal.clone(),
                Some(extraction_goal),
                Some(goal),
            )
        }
        BlockKind::Login { url, goal, .. } => {
            let goal = match goal {
                Some(goal) => render(goal)?,
                None => {
                    "Log in with the stored account credential and confirm the authenticated state"
                        .to_string()
                }
            };
            (Some(render(url)?), goal.clone(), None, Some(goal))
        }
        other => {
            return Err(Error::Unknown(format!(
                "Block '{}' of kind '{}' is not a task",
                block.label,
                other.name()
            )))
        }
    };

    Ok(TaskSpec {
        block_label: block.label.clone(),
        url,
        goal,
        data_extraction_goal,
        completion_criteria,
        termination_criteria,
        max_steps,
        max_step_retries: env.settings.max_step_retries,
        step_timeout: Duration::from_secs(env.settings.step_timeout_seconds.max(1)),
    })
}

/// Resolved extraction output is the natural loop-value source; expose the
/// helper so loop resolution shares it.
pub(crate) fn as_loop_values(value: &Value, max_items: usize, label: &str) -> Result<Vec<Value>> {
    let items = value.as_array().ok_or_else(|| {
        Error::Validation(format!(
            "Loop block '{}' resolved a non-array loop source",
            label
        ))
    })?;

    if items.len() > max_items {
        return Err(Error::Validation(format!(
            "Loop block '{}' has {} items, exceeding the limit of {}",
            label,
            items.len(),
            max_items
        )));
    }

    Ok(items.clone())
}
