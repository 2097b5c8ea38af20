//! Atomic browser actions and their outcomes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One atomic browser operation with its declared target.
///
/// Planned by the AI planner, dispatched through the browser driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    Navigate {
        url: String,
    },
    Click {
        target: String,
    },
    InputText {
        target: String,
        text: String,
    },
    SelectOption {
        target: String,
        option: String,
    },
    Scroll {
        #[serde(default)]
        target: Option<String>,
        #[serde(default)]
        direction: ScrollDirection,
    },
    Wait {
        seconds: u64,
    },
    /// Extract data from the current page per the task's extraction goal.
    Extract {
        goal: String,
    },
    UploadFile {
        target: String,
        /// Object-storage key of the payload to attach.
        object_key: String,
    },
    /// Declare the goal achieved; verified by the planner before the task
    /// completes.
    Complete {
        #[serde(default)]
        data: Option<Value>,
    },
    /// Goal-driven stop that is not a failure.
    Terminate {
        reason: String,
    },
    SolveCaptcha {
        #[serde(default)]
        target: Option<String>,
    },
    PollVerificationCode {
        source: String,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScrollDirection {
    #[default]
    Down,
    Up,
}

impl Action {
    /// The declared element/target reference, if the action has one.
    pub fn target(&self) -> Option<&str> {
        match self {
            Action::Click { target }
            | Action::InputText { target, .. }
            | Action::SelectOption { target, .. }
            | Action::UploadFile { target, .. } => Some(target),
            Action::Scroll { target, .. } | Action::SolveCaptcha { target } => target.as_deref(),
            _ => None,
        }
    }

    /// Short action name for records and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Action::Navigate { .. } => "navigate",
            Action::Click { .. } => "click",
            Action::InputText { .. } => "input_text",
            Action::SelectOption { .. } => "select_option",
            Action::Scroll { .. } => "scroll",
            Action::Wait { .. } => "wait",
            Action::Extract { .. } => "extract",
            Action::UploadFile { .. } => "upload_file",
            Action::Complete { .. } => "complete",
            Action::Terminate { .. } => "terminate",
            Action::SolveCaptcha { .. } => "solve_captcha",
            Action::PollVerificationCode { .. } => "poll_verification_code",
        }
    }
}

/// Tagged outcome of one action.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ActionResult {
    Success {
        #[serde(default)]
        data: Value,
        /// The action started a file download in the browser.
        #[serde(default)]
        download_triggered: bool,
        /// The driver fell back to interacting with a sibling element.
        #[serde(default)]
        used_sibling_fallback: bool,
        /// The driver fell back to interacting with the parent element.
        #[serde(default)]
        used_parent_fallback: bool,
    },
    Failure {
        kind: FailureKind,
        message: String,
        /// When true, the remaining actions of the current step are skipped.
        #[serde(default)]
        stop_execution_on_failure: bool,
    },
    /// Terminal, goal-driven stop that is not a failure.
    Abort {
        reason: String,
    },
}

impl ActionResult {
    pub fn success(data: Value) -> Self {
        ActionResult::Success {
            data,
            download_triggered: false,
            used_sibling_fallback: false,
            used_parent_fallback: false,
        }
    }

    pub fn failure(kind: FailureKind, message: impl Into<String>, stop: bool) -> Self {
        ActionResult::Failure {
            kind,
            message: message.into(),
            stop_execution_on_failure: stop,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ActionResult::Success { .. })
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, ActionResult::Failure { .. })
    }
}

/// Failure classification for a single action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    ElementNotFound,
    Timeout,
    Network,
    Browser,
    Validation,
    Unknown,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn action_targets() {
        let click = Action::Click {
            target: "btn-submit".into(),
        };
        assert_eq!(click.target(), Some("btn-submit"));
        assert_eq!(click.kind(), "click");

        let nav = Action::Navigate {
            url: "https://example.com".into(),
        };
        assert_eq!(nav.target(), None);
    }

    #[test]
    fn action_round_trips_through_json() {
        let action = Action::InputText {
            target: "field-user".into(),
            text: "ada".into(),
        };
        let json = serde_json::to_value(&action).unwrap();
        assert_eq!(json["action"], "input_text");

        let back: Action = serde_json::from_value(json).unwrap();
        assert_eq!(back.kind(), "input_text");
    }

    #[test]
    fn failure_carries_stop_flag() {
        let result = ActionResult::failure(FailureKind::ElementNotFound, "gone", true);
        match result {
            ActionResult::Failure {
                stop_execution_on_failure,
                ..
            } => assert!(stop_execution_on_failure),
            _ => panic!("expected failure"),
        }
    }

    #[test]
    fn planner_shaped_payload_deserializes() {
        let payload = json!({
            "result": "success",
            "data": {"extracted": [1, 2]},
            "download_triggered": true
        });
        let result: ActionResult = serde_json::from_value(payload).unwrap();
        match result {
            ActionResult::Success {
                download_triggered, ..
            } => assert!(download_triggered),
            _ => panic!("expected success"),
        }
    }
}
