//! Loop block - iterate a child block sequence over resolved loop values.
//!
//! Each iteration pushes a fresh scope (current_index / current_item /
//! current_value) onto its own context view, so nested loops shadow outer
//! variables and parallel iterations never share a stack. Fan-out is bounded
//! by `max_parallel`; all writes to shared context state go through the
//! context mutex.

use std::sync::atomic::Ordering;

use serde_json::Value;
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use super::{task::as_loop_values, BlockOutcome, ChildStatus};
use crate::context::{BlockMetadata, RunContext};
use crate::engine::{RunEnv, Runner};
use crate::error::{Error, FailureReason, Result};
use crate::storage::BlockStatus;
use crate::workflow::expression::render_template;
use crate::workflow::BlockDef;

/// Execute a loop block.
pub async fn execute(
    runner: &Runner,
    label: &str,
    loop_over: &str,
    max_parallel: usize,
    children: &[BlockDef],
    ctx: &RunContext,
    env: &RunEnv,
) -> Result<BlockOutcome> {
    let snapshot = ctx.snapshot();
    let source = render_template(loop_over, &snapshot)?;
    let items = as_loop_values(&source, env.settings.max_loop_items, label)?;

    if items.is_empty() {
        debug!(block = %label, "Loop source resolved to an empty array");
        return Ok(BlockOutcome::completed(Value::Array(Vec::new())));
    }

    if max_parallel <= 1 {
        execute_sequential(runner, label, items, children, ctx, env).await
    } else {
        execute_parallel(runner, label, items, children, max_parallel, ctx, env).await
    }
}

async fn execute_sequential(
    runner: &Runner,
    label: &str,
    items: Vec<Value>,
    children: &[BlockDef],
    ctx: &RunContext,
    env: &RunEnv,
) -> Result<BlockOutcome> {
    let mut results = Vec::with_capacity(items.len());
    let mut child_statuses = Vec::new();

    for (index, item) in items.into_iter().enumerate() {
        if env.cancel.load(Ordering::SeqCst) {
            return Ok(canceled_outcome(child_statuses));
        }

        let iter_ctx = ctx.scoped(BlockMetadata::for_iteration(label, index, item));

        match run_iteration(runner, children, &iter_ctx, env).await? {
            IterationResult::Completed { output, statuses } => {
                child_statuses.extend(statuses);
                results.push(output);
            }
            IterationResult::Stopped { outcome, statuses } => {
                child_statuses.extend(statuses);
                return Ok(with_children(outcome, child_statuses));
            }
        }
    }

    let mut outcome = BlockOutcome::completed(Value::Array(results));
    outcome.child_statuses = child_statuses;
    Ok(outcome)
}

/// Bounded fan-out: spawn up to `max_parallel` iterations, refill as slots
/// free up. The first unrecovered failure cancels the remaining iterations.
async fn execute_parallel(
    runner: &Runner,
    label: &str,
    items: Vec<Value>,
    children: &[BlockDef],
    max_parallel: usize,
    ctx: &RunContext,
    env: &RunEnv,
) -> Result<BlockOutcome> {
    let total = items.len();
    let mut results = vec![Value::Null; total];
    let mut child_statuses = Vec::new();
    let mut stopped: Option<BlockOutcome> = None;

    let mut join_set: JoinSet<(usize, Result<IterationResult>)> = JoinSet::new();
    let mut items = items.into_iter().enumerate();

    let mut spawn_next =
        |join_set: &mut JoinSet<(usize, Result<IterationResult>)>,
         items: &mut std::iter::Enumerate<std::vec::IntoIter<Value>>| {
            if let Some((index, item)) = items.next() {
                let runner = runner.clone();
                let children = children.to_vec();
                let iter_ctx = ctx.scoped(BlockMetadata::for_iteration(label, index, item));
                let env = env.clone();

                join_set.spawn(async move {
                    let result = run_iteration(&runner, &children, &iter_ctx, &env).await;
                    (index, result)
                });
                true
            } else {
                false
            }
        };

    for _ in 0..max_parallel.min(total) {
        spawn_next(&mut join_set, &mut items);
    }

    while let Some(joined) = join_set.join_next().await {
        match joined {
            Ok((index, Ok(IterationResult::Completed { output, statuses }))) => {
                child_statuses.extend(statuses);
                results[index] = output;
            }
            Ok((index, Ok(IterationResult::Stopped { outcome, statuses }))) => {
                warn!(block = %label, iteration = index, "Loop iteration stopped; canceling rest");
                child_statuses.extend(statuses);
                stopped = Some(outcome);
                join_set.abort_all();
                while join_set.join_next().await.is_some() {}
                break;
            }
            Ok((index, Err(e))) => {
                error!(block = %label, iteration = index, "Loop iteration error: {}", e);
                join_set.abort_all();
                while join_set.join_next().await.is_some() {}
                return Err(e);
            }
            Err(e) => {
                join_set.abort_all();
                while join_set.join_next().await.is_some() {}
                return Err(Error::Unknown(format!(
                    "Loop '{}' worker task join failed: {}",
                    label, e
                )));
            }
        }

        if stopped.is_none() {
            spawn_next(&mut join_set, &mut items);
        }
    }

    if let Some(outcome) = stopped {
        return Ok(with_children(outcome, child_statuses));
    }

    let mut outcome = BlockOutcome::completed(Value::Array(results));
    outcome.child_statuses = child_statuses;
    Ok(outcome)
}

enum IterationResult {
    /// Every child completed (or was absorbed); output is the last child's.
    Completed {
        output: Value,
        statuses: Vec<ChildStatus>,
    },
    /// An unrecovered child failure or cancellation ends the loop.
    Stopped {
        outcome: BlockOutcome,
        statuses: Vec<ChildStatus>,
    },
}

async fn run_iteration(
    runner: &Runner,
    children: &[BlockDef],
    iter_ctx: &RunContext,
    env: &RunEnv,
) -> Result<IterationResult> {
    let mut statuses = Vec::with_capacity(children.len());
    let mut output = Value::Null;

    for child in children {
        if env.cancel.load(Ordering::SeqCst) {
            return Ok(IterationResult::Stopped {
                outcome: canceled_outcome(Vec::new()),
                statuses,
            });
        }

        let outcome = runner.execute_block(child, iter_ctx, env).await?;
        statuses.push(ChildStatus {
            label: child.label.clone(),
            scope: iter_ctx.scope_signature(),
            status: outcome.status,
        });

        match outcome.status {
            BlockStatus::Completed => {
                output = outcome.output.unwrap_or(Value::Null);
            }
            BlockStatus::Canceled => {
                return Ok(IterationResult::Stopped { outcome, statuses });
            }
            _ => {
                if outcome.is_fatal() || !child.continue_on_failure {
                    return Ok(IterationResult::Stopped { outcome, statuses });
                }
                // Absorbed child failure; the iteration continues.
            }
        }
    }

    Ok(IterationResult::Completed { output, statuses })
}

fn canceled_outcome(child_statuses: Vec<ChildStatus>) -> BlockOutcome {
    BlockOutcome {
        status: BlockStatus::Canceled,
        output: None,
        failure: Some(FailureReason {
            code: "CANCELED".into(),
            message: "Run canceled".into(),
        }),
        child_statuses,
    }
}

fn with_children(mut outcome: BlockOutcome, child_statuses: Vec<ChildStatus>) -> BlockOutcome {
    outcome.child_statuses = child_statuses;
    outcome
}
