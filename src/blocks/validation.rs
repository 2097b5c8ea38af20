//! Validation block - assert a boolean expression against the context.
//!
//! Expressions may reference context state either as bare identifiers
//! (`total > 10`, resolved from parameter values and outputs) or in template
//! form (`${summary.output.total} > 10`); template references are rewritten
//! to bound values before evaluation.

use serde_json::{json, Value};
use tracing::debug;

use super::code;
use super::BlockOutcome;
use crate::context::ContextSnapshot;
use crate::error::{Error, Result};
use crate::workflow::expression::{referenced_paths, resolve_reference};

/// Evaluate the expression; fail the block with the configured message when
/// it is false.
pub fn execute(
    expression: &str,
    error_message: &str,
    snapshot: &ContextSnapshot,
) -> Result<BlockOutcome> {
    let (rewritten, bindings) = bind_expression(expression, snapshot)?;

    debug!(expression = %rewritten, "Evaluating validation block");

    let result = code::evaluate_with_bindings(&rewritten, &bindings)?;
    let passed = match result {
        Value::Bool(b) => b,
        other => {
            return Err(Error::Validation(format!(
                "Validation expression must evaluate to a boolean, got {}",
                other
            )))
        }
    };

    if passed {
        return Ok(BlockOutcome::completed(json!({ "passed": true })));
    }

    let message = if error_message.is_empty() {
        format!("Validation failed: {}", expression)
    } else {
        error_message.to_string()
    };
    Err(Error::Validation(message))
}

/// Rewrite `${path}` references to synthetic identifiers bound to their
/// resolved values, and bind every visible parameter value, output, and
/// loop-scope variable for bare-identifier use.
fn bind_expression(
    expression: &str,
    snapshot: &ContextSnapshot,
) -> Result<(String, Vec<(String, Value)>)> {
    let mut rewritten = expression.to_string();
    let mut bindings = code::scope_bindings(snapshot);

    for (key, value) in snapshot.visible_bindings() {
        bindings.push((key, value));
    }

    for (index, path) in referenced_paths(expression).iter().enumerate() {
        let value = resolve_reference(path, snapshot)?;
        let name = format!("ref_{}", index);
        rewritten = rewritten
            .replace(&format!("${{{}}}", path), &name)
            .replace(&format!("${{ {} }}", path), &name);
        bindings.push((name, value));
    }

    Ok((rewritten, bindings))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextSnapshot;
    use serde_json::json;
    use std::collections::HashMap;

    fn snapshot(
        values: Vec<(&str, serde_json::Value)>,
        outputs: Vec<(&str, serde_json::Value)>,
    ) -> ContextSnapshot {
        ContextSnapshot::for_tests(
            None,
            values
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
            outputs
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        )
    }

    #[test]
    fn passing_assertion_completes() {
        let snap = snapshot(vec![("total", json!(15))], vec![]);
        let outcome = execute("total > 10", "", &snap).unwrap();
        assert!(outcome.succeeded());
    }

    #[test]
    fn failing_assertion_uses_configured_message() {
        let snap = snapshot(vec![("total", json!(5))], vec![]);
        let err = execute("total > 10", "total too small", &snap).unwrap_err();
        assert!(err.to_string().contains("total too small"));
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[test]
    fn template_references_with_paths_work() {
        let snap = snapshot(vec![], vec![("summary", json!({"total": 15}))]);
        let outcome = execute("${summary.output.total} > 10", "", &snap).unwrap();
        assert!(outcome.succeeded());
    }

    #[test]
    fn non_boolean_expression_is_validation_error() {
        let snap = snapshot(vec![("total", json!(5))], vec![]);
        let err = execute("total + 1", "", &snap).unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
        assert!(err.to_string().contains("boolean"));
    }

    #[test]
    fn undefined_template_reference_fails() {
        let snap = snapshot(vec![], vec![]);
        let err = execute("${ghost} == 1", "", &snap).unwrap_err();
        assert!(err.to_string().contains("Undefined reference"));
    }
}
