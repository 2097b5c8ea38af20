//! Workflow definition types.
//!
//! A workflow is an immutable, ordered sequence of typed blocks plus a set of
//! declared parameters. Definitions are YAML-first so that agents and humans
//! generate them the same way.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A complete workflow definition.
///
/// # Example YAML
///
/// ```yaml
/// name: invoice-download
/// organization: acme
///
/// parameters:
///   - type: secret
///     key: portal_password
///     reference: vault/acme/portal
///
/// blocks:
///   - label: login
///     type: login
///     url: https://portal.example.com/login
///     credential: portal_password
///
///   - label: download-invoices
///     type: task
///     goal: Download every invoice newer than last month
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    /// Unique workflow name (used as identifier)
    pub name: String,

    /// Human-readable description
    #[serde(default)]
    pub description: String,

    /// Owning organization
    #[serde(default)]
    pub organization: String,

    /// Version number (for tracking changes)
    #[serde(default = "default_version")]
    pub version: u32,

    /// Declared parameters available to every block
    #[serde(default)]
    pub parameters: Vec<ParameterDef>,

    /// JSON Schema for validating initial run parameters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,

    /// Blocks, executed in declaration order
    pub blocks: Vec<BlockDef>,

    /// Run-level settings
    #[serde(default)]
    pub settings: WorkflowSettings,
}

fn default_version() -> u32 {
    1
}

/// A declared parameter: a polymorphic value provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParameterDef {
    /// Literal or declared default value.
    Static {
        key: String,
        #[serde(default)]
        value: Value,
        #[serde(default)]
        description: String,
    },
    /// Resolves by dereferencing another parameter's key.
    /// Chains must be acyclic; validated at definition time.
    Context {
        key: String,
        source: String,
        #[serde(default)]
        description: String,
    },
    /// Reads a previously recorded block output under the current scope.
    Output {
        key: String,
        block: String,
        /// Optional dotted path into the recorded output value.
        #[serde(default)]
        path: Option<String>,
        #[serde(default)]
        description: String,
    },
    /// Fetched from the external secret store; cached per run.
    Secret {
        key: String,
        reference: String,
        #[serde(default)]
        description: String,
    },
}

impl ParameterDef {
    /// The key this parameter registers under.
    pub fn key(&self) -> &str {
        match self {
            ParameterDef::Static { key, .. }
            | ParameterDef::Context { key, .. }
            | ParameterDef::Output { key, .. }
            | ParameterDef::Secret { key, .. } => key,
        }
    }

    /// The parameter key this one dereferences, if any.
    pub fn source(&self) -> Option<&str> {
        match self {
            ParameterDef::Context { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// A block in the workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockDef {
    /// Unique block label within the workflow
    pub label: String,

    /// Proceed to the next block even if this one fails
    #[serde(default)]
    pub continue_on_failure: bool,

    /// Retry configuration for retryable failures
    #[serde(default)]
    pub retry: Option<RetryPolicy>,

    /// Timeout for this block in seconds (overrides the engine default)
    #[serde(default)]
    pub timeout_seconds: Option<u64>,

    /// Register the recorded output under this parameter key as well
    #[serde(default)]
    pub output_key: Option<String>,

    /// Variant-specific configuration
    #[serde(flatten)]
    pub kind: BlockKind,
}

/// Block variants. A closed set: dispatch is exhaustive at compile time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BlockKind {
    /// General browser-automation task driven by the planner.
    Task(TaskBlockConfig),
    /// Task specialization: navigate to a URL and confirm arrival.
    Navigation {
        url: String,
        #[serde(default)]
        goal: Option<String>,
    },
    /// Task specialization: extract structured data from the page.
    Extraction {
        #[serde(default)]
        url: Option<String>,
        goal: String,
        /// Optional schema describing the expected extraction shape.
        #[serde(default)]
        schema: Option<Value>,
    },
    /// Task specialization: authenticate with a secret-backed credential.
    Login {
        url: String,
        /// Parameter key holding the credential (typically a secret parameter).
        credential: String,
        #[serde(default)]
        goal: Option<String>,
    },
    /// Iterate a child block sequence over resolved loop values.
    ForLoop {
        /// Template or parameter reference resolving to an array.
        loop_over: String,
        /// Bounded fan-out; 1 means sequential.
        #[serde(default)]
        max_parallel: Option<usize>,
        blocks: Vec<BlockDef>,
    },
    /// Evaluate an expression in the sandboxed evaluator.
    Code {
        code: String,
        /// Parameter keys injected into the evaluator scope. Nothing else is.
        #[serde(default)]
        variables: Vec<String>,
    },
    /// Assert a boolean expression against the context.
    Validation {
        expression: String,
        #[serde(default)]
        error_message: String,
    },
    /// Make an HTTP request.
    HttpRequest {
        url: String,
        #[serde(default = "default_method")]
        method: String,
        #[serde(default)]
        headers: Option<Value>,
        #[serde(default)]
        body: Option<Value>,
        #[serde(default)]
        timeout_seconds: Option<u64>,
    },
    /// Store a value (or a browser-triggered download) in object storage.
    FileDownload {
        /// Template for the value to store; empty means the task download.
        #[serde(default)]
        source: String,
        /// Object key template.
        destination: String,
    },
    /// Read an object from storage and expose it as the block output.
    FileUpload {
        /// Object key template.
        source: String,
        #[serde(default)]
        encode_base64: bool,
    },
    /// Send an email through the mailer interface.
    SendEmail {
        to: Vec<String>,
        subject: String,
        body: String,
        #[serde(default)]
        attachments: Vec<String>,
    },
}

fn default_method() -> String {
    "GET".to_string()
}

impl BlockKind {
    /// Head identifiers referenced by this variant's templates.
    ///
    /// The engine resolves these (and only these) before any side effect;
    /// the validator uses them to reject forward references to block outputs.
    pub fn template_refs(&self) -> Vec<String> {
        use crate::workflow::expression::referenced_keys;

        fn collect_value_refs(value: &Value, refs: &mut Vec<String>) {
            match value {
                Value::String(s) => refs.extend(crate::workflow::expression::referenced_keys(s)),
                Value::Object(obj) => obj.values().for_each(|v| collect_value_refs(v, refs)),
                Value::Array(arr) => arr.iter().for_each(|v| collect_value_refs(v, refs)),
                _ => {}
            }
        }

        fn push_template(refs: &mut Vec<String>, template: &str) {
            refs.extend(referenced_keys(template));
        }

        let mut refs = Vec::new();

        match self {
            BlockKind::Task(config) => {
                if let Some(url) = &config.url {
                    push_template(&mut refs, url);
                }
                push_template(&mut refs, &config.goal);
                if let Some(goal) = &config.data_extraction_goal {
                    push_template(&mut refs, goal);
                }
                if let Some(criteria) = &config.completion_criteria {
                    push_template(&mut refs, criteria);
                }
                if let Some(criteria) = &config.termination_criteria {
                    push_template(&mut refs, criteria);
                }
            }
            BlockKind::Navigation { url, goal } => {
                push_template(&mut refs, url);
                if let Some(goal) = goal {
                    push_template(&mut refs, goal);
                }
            }
            BlockKind::Extraction { url, goal, .. } => {
                if let Some(url) = url {
                    push_template(&mut refs, url);
                }
                push_template(&mut refs, goal);
            }
            BlockKind::Login {
                url,
                credential,
                goal,
            } => {
                push_template(&mut refs, url);
                refs.push(credential.clone());
                if let Some(goal) = goal {
                    push_template(&mut refs, goal);
                }
            }
            BlockKind::ForLoop { loop_over, .. } => push_template(&mut refs, loop_over),
            BlockKind::Code { variables, .. } => refs.extend(variables.iter().cloned()),
            BlockKind::Validation { expression, .. } => push_template(&mut refs, expression),
            BlockKind::HttpRequest {
                url,
                headers,
                body,
                ..
            } => {
                push_template(&mut refs, url);
                if let Some(headers) = headers {
                    collect_value_refs(headers, &mut refs);
                }
                if let Some(body) = body {
                    collect_value_refs(body, &mut refs);
                }
            }
            BlockKind::FileDownload {
                source,
                destination,
            } => {
                push_template(&mut refs, source);
                push_template(&mut refs, destination);
            }
            BlockKind::FileUpload { source, .. } => push_template(&mut refs, source),
            BlockKind::SendEmail {
                to,
                subject,
                body,
                attachments,
            } => {
                for recipient in to {
                    push_template(&mut refs, recipient);
                }
                push_template(&mut refs, subject);
                push_template(&mut refs, body);
                for attachment in attachments {
                    push_template(&mut refs, attachment);
                }
            }
        }

        refs
    }

    /// Short variant name for records and logs.
    pub fn name(&self) -> &'static str {
        match self {
            BlockKind::Task(_) => "task",
            BlockKind::Navigation { .. } => "navigation",
            BlockKind::Extraction { .. } => "extraction",
            BlockKind::Login { .. } => "login",
            BlockKind::ForLoop { .. } => "for_loop",
            BlockKind::Code { .. } => "code",
            BlockKind::Validation { .. } => "validation",
            BlockKind::HttpRequest { .. } => "http_request",
            BlockKind::FileDownload { .. } => "file_download",
            BlockKind::FileUpload { .. } => "file_upload",
            BlockKind::SendEmail { .. } => "send_email",
        }
    }
}

/// Configuration for a planner-driven task block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskBlockConfig {
    /// Starting URL template; the task continues from the current page if unset.
    #[serde(default)]
    pub url: Option<String>,

    /// Navigation goal handed to the planner.
    pub goal: String,

    /// Separate goal describing what data to extract, if any.
    #[serde(default)]
    pub data_extraction_goal: Option<String>,

    /// Criterion the planner verifies before declaring the goal achieved.
    #[serde(default)]
    pub completion_criteria: Option<String>,

    /// Criterion that ends the task as terminated rather than completed.
    #[serde(default)]
    pub termination_criteria: Option<String>,

    /// Step budget override for this task.
    #[serde(default)]
    pub max_steps: Option<u32>,
}

/// Retry configuration for a block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum attempts, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay between attempts in seconds
    #[serde(default = "default_delay_seconds")]
    pub delay_seconds: u64,

    /// Backoff strategy
    #[serde(default)]
    pub backoff: BackoffType,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            delay_seconds: default_delay_seconds(),
            backoff: BackoffType::default(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_delay_seconds() -> u64 {
    5
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffType {
    /// Fixed delay between attempts
    #[default]
    Fixed,
    /// Linearly increasing delay
    Linear,
    /// Exponentially increasing delay
    Exponential,
}

/// Run-level workflow settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSettings {
    /// Maximum run duration in seconds
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,

    /// Step budget per task block
    #[serde(default = "default_max_steps")]
    pub max_steps_per_task: u32,

    /// Step retry budget per task block
    #[serde(default = "default_max_step_retries")]
    pub max_step_retries: u32,

    /// Per-step time budget in seconds
    #[serde(default = "default_step_timeout")]
    pub step_timeout_seconds: u64,

    /// Maximum number of items a for_loop may iterate.
    /// Prevents memory exhaustion from unbounded loop sources.
    #[serde(default = "default_max_loop_items")]
    pub max_loop_items: usize,

    /// Default loop fan-out when a for_loop does not set max_parallel
    #[serde(default = "default_loop_parallelism")]
    pub loop_parallelism: usize,
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            timeout_seconds: default_timeout(),
            max_steps_per_task: default_max_steps(),
            max_step_retries: default_max_step_retries(),
            step_timeout_seconds: default_step_timeout(),
            max_loop_items: default_max_loop_items(),
            loop_parallelism: default_loop_parallelism(),
        }
    }
}

fn default_timeout() -> u64 {
    3600
}

fn default_max_steps() -> u32 {
    10
}

fn default_max_step_retries() -> u32 {
    3
}

fn default_step_timeout() -> u64 {
    120
}

fn default_max_loop_items() -> usize {
    10_000
}

fn default_loop_parallelism() -> usize {
    1
}

impl Workflow {
    /// Get a top-level block by label.
    pub fn get_block(&self, label: &str) -> Option<&BlockDef> {
        self.blocks.iter().find(|b| b.label == label)
    }

    /// All block labels in declaration order, recursing into loop bodies.
    pub fn block_labels(&self) -> Vec<&str> {
        fn collect<'a>(blocks: &'a [BlockDef], out: &mut Vec<&'a str>) {
            for block in blocks {
                out.push(block.label.as_str());
                if let BlockKind::ForLoop { blocks, .. } = &block.kind {
                    collect(blocks, out);
                }
            }
        }

        let mut labels = Vec::new();
        collect(&self.blocks, &mut labels);
        labels
    }

    /// Whether any block (including loop children) drives a browser task.
    pub fn has_task_blocks(&self) -> bool {
        fn any_task(blocks: &[BlockDef]) -> bool {
            blocks.iter().any(|b| match &b.kind {
                BlockKind::Task(_)
                | BlockKind::Navigation { .. }
                | BlockKind::Extraction { .. }
                | BlockKind::Login { .. } => true,
                BlockKind::ForLoop { blocks, .. } => any_task(blocks),
                _ => false,
            })
        }

        any_task(&self.blocks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_labels_recurse_into_loops() {
        let workflow: Workflow = serde_yaml::from_str(
            r#"
name: nested
blocks:
  - label: outer
    type: for_loop
    loop_over: "${rows}"
    blocks:
      - label: inner
        type: code
        code: "1 + 1"
"#,
        )
        .unwrap();

        assert_eq!(workflow.block_labels(), vec!["outer", "inner"]);
        assert!(!workflow.has_task_blocks());
    }

    #[test]
    fn task_specializations_count_as_tasks() {
        let workflow: Workflow = serde_yaml::from_str(
            r#"
name: nav
blocks:
  - label: go
    type: navigation
    url: https://example.com
"#,
        )
        .unwrap();

        assert!(workflow.has_task_blocks());
        assert_eq!(workflow.blocks[0].kind.name(), "navigation");
    }

    #[test]
    fn template_refs_cover_variants() {
        let kind = BlockKind::HttpRequest {
            url: "${base}/items".into(),
            method: "POST".into(),
            headers: Some(serde_json::json!({"Authorization": "Bearer ${token}"})),
            body: Some(serde_json::json!({"q": "${query}"})),
            timeout_seconds: None,
        };
        let refs = kind.template_refs();
        assert!(refs.contains(&"base".to_string()));
        assert!(refs.contains(&"token".to_string()));
        assert!(refs.contains(&"query".to_string()));

        let login = BlockKind::Login {
            url: "https://x.test".into(),
            credential: "portal_password".into(),
            goal: None,
        };
        assert!(login.template_refs().contains(&"portal_password".to_string()));
    }

    #[test]
    fn retry_policy_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.delay_seconds, 5);
        assert_eq!(policy.backoff, BackoffType::Fixed);
    }
}
