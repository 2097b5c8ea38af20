//! Code block - sandboxed expression evaluation.
//!
//! The evaluator is an in-process, capability-restricted Rhai engine:
//! operation and depth limits, no module loading, no I/O, and only the
//! block's declared variables (plus loop-scope bindings) in scope. Breaking
//! out of that boundary is a `Security` error, which terminates the run even
//! under continue_on_failure.

use rhai::{Dynamic, Engine, EvalAltResult, Scope};
use serde_json::Value;
use tracing::debug;

use crate::context::ContextSnapshot;
use crate::error::{Error, Result};

/// Operation budget per evaluation.
const MAX_OPERATIONS: u64 = 100_000;
/// Expression nesting limits (global, function-level).
const MAX_EXPR_DEPTH: usize = 64;
/// Call stack limit.
const MAX_CALL_LEVELS: usize = 32;

/// Evaluate a code block body against its declared variables.
///
/// `variables` lists the parameter keys (or block labels) injected into the
/// evaluator scope. Loop-scope bindings are always injected when active.
pub fn evaluate(code: &str, variables: &[String], snapshot: &ContextSnapshot) -> Result<Value> {
    debug!(vars = variables.len(), "Evaluating code block");

    let mut bindings = scope_bindings(snapshot);
    for key in variables {
        let value = snapshot
            .value(key)
            .or_else(|| snapshot.output(key))
            .cloned()
            .ok_or_else(|| {
                Error::Validation(format!("Code block declares undefined variable '{}'", key))
            })?;
        bindings.push((key.clone(), value));
    }

    evaluate_with_bindings(code, &bindings)
}

/// Evaluate an expression with explicit scope bindings. The sandbox limits
/// apply identically; nothing outside `bindings` is reachable.
pub fn evaluate_with_bindings(code: &str, bindings: &[(String, Value)]) -> Result<Value> {
    let engine = restricted_engine();
    let mut scope = Scope::new();

    for (name, value) in bindings {
        scope.push(sanitize_identifier(name), json_to_dynamic(value.clone()));
    }

    let result: Dynamic = engine
        .eval_with_scope(&mut scope, code)
        .map_err(classify_eval_error)?;

    Ok(dynamic_to_json(result))
}

/// Loop-scope bindings active in the snapshot.
pub fn scope_bindings(snapshot: &ContextSnapshot) -> Vec<(String, Value)> {
    match snapshot.scope() {
        Some(meta) => vec![
            (
                "current_index".to_string(),
                Value::from(meta.current_index as u64),
            ),
            ("current_item".to_string(), meta.current_item.clone()),
            ("current_value".to_string(), meta.current_value.clone()),
        ],
        None => Vec::new(),
    }
}

/// Evaluate a boolean expression (validation blocks, conditions).
pub fn evaluate_bool(
    expression: &str,
    variables: &[String],
    snapshot: &ContextSnapshot,
) -> Result<bool> {
    match evaluate(expression, variables, snapshot)? {
        Value::Bool(b) => Ok(b),
        other => Err(Error::Validation(format!(
            "Expression must evaluate to a boolean, got {}",
            other
        ))),
    }
}

fn restricted_engine() -> Engine {
    let mut engine = Engine::new();
    engine.set_max_operations(MAX_OPERATIONS);
    engine.set_max_expr_depths(MAX_EXPR_DEPTH, MAX_EXPR_DEPTH);
    engine.set_max_call_levels(MAX_CALL_LEVELS);
    engine.set_max_string_size(1_000_000);
    engine.set_max_array_size(100_000);
    engine.set_max_map_size(100_000);
    engine
}

/// Capability violations become `Security`; plain script mistakes stay
/// `Validation`.
fn classify_eval_error(error: Box<EvalAltResult>) -> Error {
    match *error {
        EvalAltResult::ErrorTooManyOperations(_) => {
            Error::Security("Code block exceeded its operation budget".into())
        }
        EvalAltResult::ErrorStackOverflow(_) => {
            Error::Security("Code block exceeded its call depth".into())
        }
        EvalAltResult::ErrorDataTooLarge(what, _) => {
            Error::Security(format!("Code block exceeded its data budget: {}", what))
        }
        EvalAltResult::ErrorVariableNotFound(name, _) => Error::Security(format!(
            "Code block referenced undeclared variable '{}'",
            name
        )),
        EvalAltResult::ErrorFunctionNotFound(name, _) => Error::Security(format!(
            "Code block called unavailable function '{}'",
            name
        )),
        other => Error::Validation(format!("Code evaluation failed: {}", other)),
    }
}

/// Rhai identifiers cannot contain '-'; parameter keys can.
fn sanitize_identifier(key: &str) -> String {
    key.replace('-', "_")
}

fn json_to_dynamic(value: Value) -> Dynamic {
    match value {
        Value::Null => Dynamic::UNIT,
        Value::Bool(b) => Dynamic::from(b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Dynamic::from(i)
            } else if let Some(f) = n.as_f64() {
                Dynamic::from(f)
            } else {
                Dynamic::UNIT
            }
        }
        Value::String(s) => Dynamic::from(s),
        Value::Array(arr) => {
            let vec: Vec<Dynamic> = arr.into_iter().map(json_to_dynamic).collect();
            Dynamic::from(vec)
        }
        Value::Object(obj) => {
            let mut map = rhai::Map::new();
            for (k, v) in obj {
                map.insert(k.into(), json_to_dynamic(v));
            }
            Dynamic::from(map)
        }
    }
}

fn dynamic_to_json(value: Dynamic) -> Value {
    if value.is_unit() {
        Value::Null
    } else if value.is_bool() {
        Value::Bool(value.as_bool().unwrap_or(false))
    } else if value.is_int() {
        serde_json::json!(value.as_int().unwrap_or(0))
    } else if value.is_float() {
        serde_json::json!(value.as_float().unwrap_or(0.0))
    } else if value.is_string() {
        Value::String(value.into_string().unwrap_or_default())
    } else if value.is_array() {
        match value.into_array() {
            Ok(arr) => Value::Array(arr.into_iter().map(dynamic_to_json).collect()),
            Err(_) => Value::Null,
        }
    } else if value.is_map() {
        match value.try_cast::<rhai::Map>() {
            Some(map) => {
                let obj: serde_json::Map<String, Value> = map
                    .into_iter()
                    .map(|(k, v)| (k.to_string(), dynamic_to_json(v)))
                    .collect();
                Value::Object(obj)
            }
            None => Value::Null,
        }
    } else {
        Value::String(value.to_string())
    }
}
