//! Parameter reference and template resolution.
//!
//! Templates embed references like `${current_item}` or
//! `${read_totals.output.amount}`. Resolution is read-only against an
//! immutable [`ContextSnapshot`]: loop-scope variables first, then resolved
//! parameter values, then recorded block outputs. There is no code execution
//! here; anything beyond dotted-path lookup belongs in a code block.

use std::sync::OnceLock;

use regex_lite::Regex;
use serde_json::Value;

use crate::context::ContextSnapshot;
use crate::error::{Error, Result};

/// Loop-scope variable names resolvable inside an active loop iteration.
pub const SCOPE_VARS: [&str; 3] = ["current_index", "current_item", "current_value"];

fn placeholder_regex() -> &'static Regex {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    PLACEHOLDER.get_or_init(|| {
        Regex::new(r"\$\{\s*([A-Za-z_][A-Za-z0-9_\-]*(?:\.[A-Za-z0-9_\-]+)*)\s*\}")
            .expect("valid regex")
    })
}

/// Render a template against a context snapshot.
///
/// A template that consists of a single placeholder returns the referenced
/// value with its type intact; mixed templates stringify each substitution.
pub fn render_template(template: &str, snapshot: &ContextSnapshot) -> Result<Value> {
    let regex = placeholder_regex();

    // Single bare placeholder: pass the typed value through.
    let trimmed = template.trim();
    if let Some(caps) = regex.captures(trimmed) {
        if caps.get(0).map(|m| m.as_str()) == Some(trimmed) {
            let path = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
            return resolve_reference(path, snapshot);
        }
    }

    let mut rendered = String::with_capacity(template.len());
    let mut last = 0;
    for caps in regex.captures_iter(template) {
        let whole = caps.get(0).expect("capture 0");
        let path = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
        let value = resolve_reference(path, snapshot)?;
        rendered.push_str(&template[last..whole.start()]);
        rendered.push_str(&value_to_string(&value));
        last = whole.end();
    }
    rendered.push_str(&template[last..]);

    Ok(Value::String(rendered))
}

/// Render template references inside a JSON value recursively.
pub fn render_value(body: &Value, snapshot: &ContextSnapshot) -> Result<Value> {
    match body {
        Value::String(s) => render_template(s, snapshot),
        Value::Object(obj) => {
            let mut rendered = serde_json::Map::with_capacity(obj.len());
            for (k, v) in obj {
                rendered.insert(k.clone(), render_value(v, snapshot)?);
            }
            Ok(Value::Object(rendered))
        }
        Value::Array(arr) => {
            let rendered: Result<Vec<Value>> =
                arr.iter().map(|v| render_value(v, snapshot)).collect();
            Ok(Value::Array(rendered?))
        }
        _ => Ok(body.clone()),
    }
}

/// Resolve one dotted reference path against the snapshot.
///
/// Resolution order: innermost loop scope, then parameter values, then block
/// outputs. `label.output` and `label.output.field` address recorded outputs.
pub fn resolve_reference(path: &str, snapshot: &ContextSnapshot) -> Result<Value> {
    let mut segments = path.split('.');
    let head = segments
        .next()
        .ok_or_else(|| Error::Validation("Empty reference".into()))?;
    let rest: Vec<&str> = segments.collect();

    if SCOPE_VARS.contains(&head) {
        let scope = snapshot.scope().ok_or_else(|| {
            Error::Validation(format!(
                "Loop variable '{}' referenced outside of a loop",
                head
            ))
        })?;
        let value = match head {
            "current_index" => Value::from(scope.current_index as u64),
            "current_item" => scope.current_item.clone(),
            _ => scope.current_value.clone(),
        };
        return descend(value, &rest, path);
    }

    if let Some(value) = snapshot.value(head) {
        return descend(value.clone(), &rest, path);
    }

    if let Some(output) = snapshot.output(head) {
        // Allow both `label` and `label.output` to address the recorded value.
        let rest = if rest.first() == Some(&"output") {
            &rest[1..]
        } else {
            &rest[..]
        };
        return descend(output.clone(), rest, path);
    }

    Err(Error::Validation(format!("Undefined reference '{}'", head)))
}

/// Extract the head identifiers referenced by a template.
///
/// The engine uses this to resolve a block's parameters (and only those)
/// before any side effect.
pub fn referenced_keys(template: &str) -> Vec<String> {
    placeholder_regex()
        .captures_iter(template)
        .filter_map(|caps| caps.get(1))
        .filter_map(|m| m.as_str().split('.').next().map(str::to_string))
        .collect()
}

/// Extract the full dotted reference paths in a template, in order.
pub fn referenced_paths(template: &str) -> Vec<String> {
    placeholder_regex()
        .captures_iter(template)
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
        .collect()
}

fn descend(value: Value, segments: &[&str], full_path: &str) -> Result<Value> {
    let mut current = value;
    for segment in segments {
        current = match &current {
            Value::Object(obj) => obj.get(*segment).cloned().ok_or_else(|| {
                Error::Validation(format!("Reference '{}' has no field '{}'", full_path, segment))
            })?,
            Value::Array(arr) => {
                let index: usize = segment.parse().map_err(|_| {
                    Error::Validation(format!(
                        "Reference '{}' indexes an array with non-numeric '{}'",
                        full_path, segment
                    ))
                })?;
                arr.get(index).cloned().ok_or_else(|| {
                    Error::Validation(format!(
                        "Reference '{}' index {} out of bounds",
                        full_path, index
                    ))
                })?
            }
            _ => {
                return Err(Error::Validation(format!(
                    "Reference '{}' cannot descend into a scalar at '{}'",
                    full_path, segment
                )))
            }
        };
    }
    Ok(current)
}

/// Convert a JSON value to its template substitution string.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        _ => value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::BlockMetadata;
    use serde_json::json;

    fn snapshot_with(values: Vec<(&str, Value)>, outputs: Vec<(&str, Value)>) -> ContextSnapshot {
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
    fn single_placeholder_keeps_type() {
        let snap = snapshot_with(vec![("count", json!(7))], vec![]);
        assert_eq!(render_template("${count}", &snap).unwrap(), json!(7));
        assert_eq!(render_template(" ${ count } ", &snap).unwrap(), json!(7));
    }

    #[test]
    fn mixed_template_stringifies() {
        let snap = snapshot_with(vec![("name", json!("Ada")), ("n", json!(2))], vec![]);
        let rendered = render_template("hello ${name}, run ${n}", &snap).unwrap();
        assert_eq!(rendered, json!("hello Ada, run 2"));
    }

    #[test]
    fn output_reference_with_path() {
        let snap = snapshot_with(
            vec![],
            vec![("fetch", json!({"total": 12.5, "rows": [1, 2]}))],
        );
        assert_eq!(
            render_template("${fetch.output.total}", &snap).unwrap(),
            json!(12.5)
        );
        assert_eq!(
            render_template("${fetch.output.rows.1}", &snap).unwrap(),
            json!(2)
        );
        // Bare label also works.
        assert_eq!(
            render_template("${fetch.total}", &snap).unwrap(),
            json!(12.5)
        );
    }

    #[test]
    fn loop_variables_resolve_in_scope() {
        let scope = BlockMetadata {
            current_index: 3,
            current_item: json!("row-3"),
            current_value: json!("row-3"),
            parent_block_label: "each".into(),
        };
        let snap = ContextSnapshot::for_tests(Some(scope), Default::default(), Default::default());

        assert_eq!(render_template("${current_index}", &snap).unwrap(), json!(3));
        assert_eq!(
            render_template("${current_item}", &snap).unwrap(),
            json!("row-3")
        );
    }

    #[test]
    fn loop_variable_outside_loop_is_scope_violation() {
        let snap = snapshot_with(vec![], vec![]);
        let err = render_template("${current_item}", &snap).unwrap_err();
        assert!(err.to_string().contains("outside of a loop"));
    }

    #[test]
    fn undefined_reference_errors() {
        let snap = snapshot_with(vec![], vec![]);
        let err = render_template("${missing}", &snap).unwrap_err();
        assert!(err.to_string().contains("Undefined reference"));
    }

    #[test]
    fn scalar_descent_errors() {
        let snap = snapshot_with(vec![("n", json!(5))], vec![]);
        assert!(render_template("${n.field}", &snap).is_err());
    }

    #[test]
    fn referenced_keys_extracts_heads() {
        let keys = referenced_keys("go to ${portal_url}/x with ${creds.user} and ${current_item}");
        assert_eq!(keys, vec!["portal_url", "creds", "current_item"]);
    }

    #[test]
    fn render_value_recurses() {
        let snap = snapshot_with(vec![("msg", json!("hi"))], vec![]);
        let body = json!({
            "text": "${msg}",
            "nested": {"again": "${msg}!"},
            "list": ["${msg}", 4]
        });

        let rendered = render_value(&body, &snap).unwrap();
        assert_eq!(rendered["text"], json!("hi"));
        assert_eq!(rendered["nested"]["again"], json!("hi!"));
        assert_eq!(rendered["list"][0], json!("hi"));
        assert_eq!(rendered["list"][1], json!(4));
    }
}
