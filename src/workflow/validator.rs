//! Workflow definition validation.
//!
//! Everything here runs before a run is created. A workflow that passes
//! validation cannot hit a reference cycle or a duplicate label at run time.

use std::collections::{HashMap, HashSet};

use super::types::{BlockDef, BlockKind, ParameterDef, Workflow};
use crate::error::{Error, Result};

/// Validate a workflow definition.
///
/// Checks for:
/// - Required fields (name, blocks)
/// - Unique block labels, including loop children
/// - Unique parameter keys
/// - Context parameter chains that are acyclic and fully defined
/// - Output parameters that reference existing blocks
/// - Variant-specific required configuration
pub fn validate_workflow(workflow: &Workflow) -> Result<()> {
    if workflow.name.is_empty() {
        return Err(Error::Validation("Workflow name is required".into()));
    }

    if !workflow
        .name
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-' || c == '_')
    {
        return Err(Error::Validation(
            "Workflow name must contain only alphanumeric characters, hyphens, and underscores"
                .into(),
        ));
    }

    if workflow.blocks.is_empty() {
        return Err(Error::Validation(
            "Workflow must have at least one block".into(),
        ));
    }

    let mut labels = HashSet::new();
    collect_labels(&workflow.blocks, &mut labels)?;

    validate_parameters(workflow, &labels)?;

    validate_blocks(&workflow.blocks)?;

    let parameter_keys: HashSet<&str> = workflow.parameters.iter().map(|p| p.key()).collect();
    let mut seen = HashSet::new();
    validate_output_references(&workflow.blocks, &labels, &parameter_keys, &mut seen)?;

    Ok(())
}

/// Reject template references to block outputs that are declared after (or
/// inside) the referencing block. A parameter key shadowing nothing is left
/// alone: unknown heads may be supplied as run input.
fn validate_output_references<'a>(
    blocks: &'a [BlockDef],
    labels: &HashSet<&str>,
    parameter_keys: &HashSet<&str>,
    seen: &mut HashSet<&'a str>,
) -> Result<()> {
    for block in blocks {
        for reference in block.kind.template_refs() {
            if parameter_keys.contains(reference.as_str()) {
                continue;
            }
            if labels.contains(reference.as_str()) && !seen.contains(reference.as_str()) {
                return Err(Error::Validation(format!(
                    "Block '{}' references the output of block '{}' before it executes",
                    block.label, reference
                )));
            }
        }

        if let BlockKind::ForLoop { blocks, .. } = &block.kind {
            validate_output_references(blocks, labels, parameter_keys, seen)?;
        }

        seen.insert(block.label.as_str());
    }
    Ok(())
}

fn collect_labels<'a>(blocks: &'a [BlockDef], labels: &mut HashSet<&'a str>) -> Result<()> {
    for block in blocks {
        if block.label.is_empty() {
            return Err(Error::Validation("Block label cannot be empty".into()));
        }
        if !labels.insert(block.label.as_str()) {
            return Err(Error::Validation(format!(
                "Duplicate block label: {}",
                block.label
            )));
        }
        if let BlockKind::ForLoop { blocks, .. } = &block.kind {
            collect_labels(blocks, labels)?;
        }
    }
    Ok(())
}

fn validate_parameters(workflow: &Workflow, labels: &HashSet<&str>) -> Result<()> {
    let mut keys = HashSet::new();
    for param in &workflow.parameters {
        if param.key().is_empty() {
            return Err(Error::Validation("Parameter key cannot be empty".into()));
        }
        if !keys.insert(param.key()) {
            return Err(Error::Validation(format!(
                "Duplicate parameter key: {}",
                param.key()
            )));
        }

        match param {
            ParameterDef::Output { key, block, .. } => {
                if !labels.contains(block.as_str()) {
                    return Err(Error::Validation(format!(
                        "Output parameter '{}' references non-existent block '{}'",
                        key, block
                    )));
                }
            }
            ParameterDef::Secret { key, reference, .. } => {
                if reference.is_empty() {
                    return Err(Error::Validation(format!(
                        "Secret parameter '{}' has an empty reference",
                        key
                    )));
                }
            }
            ParameterDef::Context { key, source, .. } => {
                if source.is_empty() {
                    return Err(Error::Validation(format!(
                        "Context parameter '{}' has an empty source",
                        key
                    )));
                }
            }
            ParameterDef::Static { .. } => {}
        }
    }

    // Context chains must reference defined keys.
    for param in &workflow.parameters {
        if let Some(source) = param.source() {
            if !keys.contains(source) {
                return Err(Error::Validation(format!(
                    "Context parameter '{}' dereferences undefined parameter '{}'",
                    param.key(),
                    source
                )));
            }
        }
    }

    // Reject reference cycles here so resolution can never recurse forever.
    if let Some(cycle_key) = find_cycle(&workflow.parameters) {
        return Err(Error::Validation(format!(
            "Parameter reference cycle involving '{}'",
            cycle_key
        )));
    }

    Ok(())
}

/// DFS over context-parameter references. Returns a key on a cycle.
fn find_cycle(parameters: &[ParameterDef]) -> Option<&str> {
    let edges: HashMap<&str, &str> = parameters
        .iter()
        .filter_map(|p| p.source().map(|s| (p.key(), s)))
        .collect();

    let mut visited: HashSet<&str> = HashSet::new();

    for start in edges.keys() {
        if visited.contains(start) {
            continue;
        }

        let mut path: HashSet<&str> = HashSet::new();
        let mut current = *start;
        loop {
            if !path.insert(current) {
                return Some(current);
            }
            visited.insert(current);
            match edges.get(current) {
                Some(next) => current = *next,
                None => break,
            }
        }
    }

    None
}

fn validate_blocks(blocks: &[BlockDef]) -> Result<()> {
    for block in blocks {
        match &block.kind {
            BlockKind::ForLoop {
                loop_over, blocks, ..
            } => {
                if loop_over.is_empty() {
                    return Err(Error::Validation(format!(
                        "Loop block '{}' has an empty loop_over source",
                        block.label
                    )));
                }
                if blocks.is_empty() {
                    return Err(Error::Validation(format!(
                        "Loop block '{}' has no child blocks",
                        block.label
                    )));
                }
                validate_blocks(blocks)?;
            }
            BlockKind::Validation { expression, .. } => {
                if expression.is_empty() {
                    return Err(Error::Validation(format!(
                        "Validation block '{}' has an empty expression",
                        block.label
                    )));
                }
            }
            BlockKind::Code { code, .. } => {
                if code.is_empty() {
                    return Err(Error::Validation(format!(
                        "Code block '{}' has an empty body",
                        block.label
                    )));
                }
            }
            BlockKind::Task(config) => {
                if config.goal.is_empty() {
                    return Err(Error::Validation(format!(
                        "Task block '{}' has an empty goal",
                        block.label
                    )));
                }
            }
            BlockKind::HttpRequest { url, method, .. } => {
                if url.is_empty() {
                    return Err(Error::Validation(format!(
                        "HTTP block '{}' has an empty url",
                        block.label
                    )));
                }
                let method = method.to_uppercase();
                if !matches!(
                    method.as_str(),
                    "GET" | "POST" | "PUT" | "PATCH" | "DELETE" | "HEAD"
                ) {
                    return Err(Error::Validation(format!(
                        "HTTP block '{}' has unsupported method '{}'",
                        block.label, method
                    )));
                }
            }
            BlockKind::SendEmail { to, .. } => {
                if to.is_empty() {
                    return Err(Error::Validation(format!(
                        "Email block '{}' has no recipients",
                        block.label
                    )));
                }
            }
            _ => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::parse_workflow;

    #[test]
    fn validate_empty_name() {
        let yaml = r#"
name: ""
blocks:
  - label: a
    type: code
    code: "1"
"#;
        let workflow = parse_workflow(yaml).unwrap();
        assert!(validate_workflow(&workflow).is_err());
    }

    #[test]
    fn validate_duplicate_labels_across_nesting() {
        let yaml = r#"
name: test
blocks:
  - label: a
    type: code
    code: "1"
  - label: outer
    type: for_loop
    loop_over: "${a.output}"
    blocks:
      - label: a
        type: code
        code: "2"
"#;
        let workflow = parse_workflow(yaml).unwrap();
        let err = validate_workflow(&workflow).unwrap_err();
        assert!(err.to_string().contains("Duplicate block label"));
    }

    #[test]
    fn validate_context_cycle() {
        let yaml = r#"
name: test
parameters:
  - type: context
    key: a
    source: b
  - type: context
    key: b
    source: a
blocks:
  - label: noop
    type: code
    code: "1"
"#;
        let workflow = parse_workflow(yaml).unwrap();
        let err = validate_workflow(&workflow).unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn validate_self_referencing_parameter() {
        let yaml = r#"
name: test
parameters:
  - type: context
    key: a
    source: a
blocks:
  - label: noop
    type: code
    code: "1"
"#;
        let workflow = parse_workflow(yaml).unwrap();
        assert!(validate_workflow(&workflow).is_err());
    }

    #[test]
    fn validate_output_parameter_unknown_block() {
        let yaml = r#"
name: test
parameters:
  - type: output
    key: result
    block: nonexistent
blocks:
  - label: noop
    type: code
    code: "1"
"#;
        let workflow = parse_workflow(yaml).unwrap();
        let err = validate_workflow(&workflow).unwrap_err();
        assert!(err.to_string().contains("nonexistent"));
    }

    #[test]
    fn validate_acyclic_chain_passes() {
        let yaml = r#"
name: test
parameters:
  - type: static
    key: root
    value: 42
  - type: context
    key: alias
    source: root
  - type: context
    key: alias2
    source: alias
blocks:
  - label: noop
    type: code
    code: "1"
"#;
        let workflow = parse_workflow(yaml).unwrap();
        assert!(validate_workflow(&workflow).is_ok());
    }

    #[test]
    fn validate_empty_loop_body() {
        let yaml = r#"
name: test
blocks:
  - label: spin
    type: for_loop
    loop_over: "${items}"
    blocks: []
"#;
        let workflow = parse_workflow(yaml).unwrap();
        let err = validate_workflow(&workflow).unwrap_err();
        assert!(err.to_string().contains("no child blocks"));
    }

    #[test]
    fn validate_bad_http_method() {
        let yaml = r#"
name: test
blocks:
  - label: call
    type: http_request
    url: https://example.com
    method: TRACE
"#;
        let workflow = parse_workflow(yaml).unwrap();
        assert!(validate_workflow(&workflow).is_err());
    }

    #[test]
    fn validate_forward_output_reference() {
        let yaml = r#"
name: test
blocks:
  - label: early
    type: validation
    expression: "${late.output} == 1"
  - label: late
    type: code
    code: "1"
"#;
        let workflow = parse_workflow(yaml).unwrap();
        let err = validate_workflow(&workflow).unwrap_err();
        assert!(err.to_string().contains("before it executes"));
    }

    #[test]
    fn validate_backward_output_reference_passes() {
        let yaml = r#"
name: test
blocks:
  - label: early
    type: code
    code: "1"
  - label: late
    type: validation
    expression: "${early.output} == 1"
"#;
        let workflow = parse_workflow(yaml).unwrap();
        assert!(validate_workflow(&workflow).is_ok());
    }

    #[test]
    fn validate_unknown_head_is_allowed_as_run_input() {
        // Heads that are neither labels nor declared parameters may be
        // supplied when the run starts.
        let yaml = r#"
name: test
blocks:
  - label: check
    type: validation
    expression: "${account_id} != 0"
"#;
        let workflow = parse_workflow(yaml).unwrap();
        assert!(validate_workflow(&workflow).is_ok());
    }

    #[test]
    fn validate_valid_workflow() {
        let yaml = r#"
name: valid-flow
blocks:
  - label: fetch
    type: http_request
    url: https://example.com/data
  - label: check
    type: validation
    expression: "true"
"#;
        let workflow = parse_workflow(yaml).unwrap();
        assert!(validate_workflow(&workflow).is_ok());
    }
}
