//! AI planner interface.
//!
//! The planner turns a page snapshot and a goal into an ordered list of
//! atomic actions, and verifies goal completion. The engine treats it as an
//! opaque external service; prompt construction and model choice live behind
//! this trait.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::browser::PageSnapshot;
use crate::error::Result;
use crate::task::actions::Action;

/// One action proposed by the planner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedAction {
    #[serde(flatten)]
    pub action: Action,
    /// Planner's stated reasoning, recorded for observability.
    #[serde(default)]
    pub reasoning: Option<String>,
    #[serde(default)]
    pub confidence: Option<f64>,
}

impl From<Action> for PlannedAction {
    fn from(action: Action) -> Self {
        Self {
            action,
            reasoning: None,
            confidence: None,
        }
    }
}

/// Condensed record of an already-executed step, included in planner context
/// so it does not repeat failed approaches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSummary {
    pub step_index: u32,
    pub retry_index: u32,
    pub succeeded: bool,
    /// Short per-action descriptions, e.g. `click #submit: element not found`.
    pub notes: Vec<String>,
}

/// Goal-verification verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verification {
    pub achieved: bool,
    pub rationale: String,
}

/// Planner/LLM service consumed by the task state machine.
#[async_trait]
pub trait Planner: Send + Sync {
    /// Produce an ordered action list for the current page toward `goal`.
    async fn plan(
        &self,
        snapshot: &PageSnapshot,
        goal: &str,
        history: &[StepSummary],
    ) -> Result<Vec<PlannedAction>>;

    /// Judge whether the goal is satisfied on the current page.
    async fn verify_completion(&self, snapshot: &PageSnapshot, goal: &str) -> Result<Verification>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn planned_action_flattens_action_fields() {
        let payload = json!({
            "action": "click",
            "target": "btn-next",
            "reasoning": "pagination control",
            "confidence": 0.92
        });

        let planned: PlannedAction = serde_json::from_value(payload).unwrap();
        assert_eq!(planned.action.kind(), "click");
        assert_eq!(planned.reasoning.as_deref(), Some("pagination control"));
    }

    #[test]
    fn planned_action_from_bare_action() {
        let planned: PlannedAction = Action::Wait { seconds: 2 }.into();
        assert_eq!(planned.action.kind(), "wait");
        assert!(planned.reasoning.is_none());
    }
}
