//! Browser-automation tasks: the task, step, and action hierarchy.

pub mod actions;
mod machine;

pub use actions::{Action, ActionResult, FailureKind, ScrollDirection};
pub use machine::{run_task, TaskOutcome, TaskSpec, TaskStatus};
