//! The run-scoped execution context.
//!
//! One `RunContext` exists per workflow run, created and torn down with it.
//! It owns the parameter registry, the lazily populated resolved-value cache,
//! the write-once block output map, and the loop-scope stack. All shared
//! state sits behind one mutex; each loop iteration (parallel or not) works
//! through its own context view with its own scope stack, so nested loops
//! shadow outer loop variables without coordination.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::Value;

use crate::error::{Error, Result};
use crate::secrets::SecretStore;
use crate::workflow::ParameterDef;

/// Defense-in-depth bound on context-parameter chains. Cycles are rejected at
/// definition time; this guard catches registry mutations that bypass it.
pub const MAX_REFERENCE_DEPTH: u32 = 16;

/// Loop-iteration-local variable bindings.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockMetadata {
    pub current_index: usize,
    pub current_item: Value,
    pub current_value: Value,
    pub parent_block_label: String,
}

impl BlockMetadata {
    pub fn for_iteration(parent: &str, index: usize, item: Value) -> Self {
        Self {
            current_index: index,
            current_value: item.clone(),
            current_item: item,
            parent_block_label: parent.to_string(),
        }
    }

    /// Scope-signature segment for this iteration.
    fn segment(&self) -> String {
        format!("{}[{}]", self.parent_block_label, self.current_index)
    }
}

#[derive(Default)]
struct ContextState {
    registry: HashMap<String, ParameterDef>,
    /// (parameter key, scope signature) -> resolved value.
    /// Populated lazily, never invalidated within a run.
    values: HashMap<(String, String), Value>,
    /// (block label, scope signature) -> recorded output. Write-once.
    outputs: HashMap<(String, String), Value>,
}

/// Mutable, run-scoped state container.
///
/// Cloning produces a view onto the same shared state with an independent
/// scope stack; [`RunContext::scoped`] is how loop iterations get their own
/// bindings.
#[derive(Clone)]
pub struct RunContext {
    state: Arc<Mutex<ContextState>>,
    secrets: Arc<dyn SecretStore>,
    scopes: Vec<BlockMetadata>,
}

impl RunContext {
    pub fn new(secrets: Arc<dyn SecretStore>) -> Self {
        Self {
            state: Arc::new(Mutex::new(ContextState::default())),
            secrets,
            scopes: Vec::new(),
        }
    }

    /// Register (or replace) a parameter provider.
    pub fn register(&self, parameter: ParameterDef) {
        let mut state = self.state.lock().expect("context lock");
        state.registry.insert(parameter.key().to_string(), parameter);
    }

    /// Whether a parameter key is registered.
    pub fn has_parameter(&self, key: &str) -> bool {
        self.state
            .lock()
            .expect("context lock")
            .registry
            .contains_key(key)
    }

    /// Signature of the current scope, e.g. `rows[2]/cells[0]`.
    pub fn scope_signature(&self) -> String {
        self.scopes
            .iter()
            .map(BlockMetadata::segment)
            .collect::<Vec<_>>()
            .join("/")
    }

    /// Signatures visible from the current scope, innermost first, ending
    /// with the root (empty) signature.
    fn visible_signatures(&self) -> Vec<String> {
        let mut signatures = Vec::with_capacity(self.scopes.len() + 1);
        for depth in (0..=self.scopes.len()).rev() {
            signatures.push(
                self.scopes[..depth]
                    .iter()
                    .map(BlockMetadata::segment)
                    .collect::<Vec<_>>()
                    .join("/"),
            );
        }
        signatures
    }

    /// Current loop-scope stack depth.
    pub fn scope_depth(&self) -> usize {
        self.scopes.len()
    }

    /// Push a loop-iteration scope onto this view's stack.
    pub fn push_scope(&mut self, metadata: BlockMetadata) {
        self.scopes.push(metadata);
    }

    /// Pop the innermost loop-iteration scope.
    pub fn pop_scope(&mut self) -> Option<BlockMetadata> {
        self.scopes.pop()
    }

    /// A child view with `metadata` pushed. Parallel iterations each take one
    /// of these so no stack is ever shared across tasks.
    pub fn scoped(&self, metadata: BlockMetadata) -> RunContext {
        let mut child = self.clone();
        child.push_scope(metadata);
        child
    }

    /// Resolve a registered parameter to its value.
    ///
    /// Static, context, and secret parameters cache under the root signature
    /// (one secret fetch per run); output parameters cache under the current
    /// scope signature. Resolving a cached (key, scope) pair never re-invokes
    /// an external provider.
    pub async fn resolve_parameter(&self, key: &str) -> Result<Value> {
        self.resolve_with_depth(key, 0).await
    }

    fn resolve_with_depth<'a>(
        &'a self,
        key: &'a str,
        depth: u32,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<Value>> + Send + 'a>> {
        Box::pin(async move {
            if depth > MAX_REFERENCE_DEPTH {
                return Err(Error::Validation(format!(
                    "Parameter reference chain exceeds depth {} at '{}'",
                    MAX_REFERENCE_DEPTH, key
                )));
            }

            let definition = {
                let state = self.state.lock().expect("context lock");
                let Some(definition) = state.registry.get(key).cloned() else {
                    return Err(Error::Validation(format!("Undefined parameter '{}'", key)));
                };

                let cache_key = (key.to_string(), self.cache_signature(&definition));
                if let Some(value) = state.values.get(&cache_key) {
                    return Ok(value.clone());
                }
                definition
            };

            // Lock released: external fetches and recursion happen outside it.
            let value = match &definition {
                ParameterDef::Static { value, .. } => value.clone(),
                ParameterDef::Context { source, .. } => {
                    self.resolve_with_depth(source, depth + 1).await?
                }
                ParameterDef::Secret { reference, .. } => {
                    let secret = self.secrets.fetch(reference).await?;
                    Value::String(secret.expose().to_string())
                }
                ParameterDef::Output { block, path, .. } => {
                    let output = self.output(block)?;
                    match path {
                        Some(path) => lookup_path(&output, path).ok_or_else(|| {
                            Error::Validation(format!(
                                "Output of block '{}' has no path '{}'",
                                block, path
                            ))
                        })?,
                        None => output,
                    }
                }
            };

            let mut state = self.state.lock().expect("context lock");
            state
                .values
                .entry((key.to_string(), self.cache_signature(&definition)))
                .or_insert_with(|| value.clone());
            Ok(value)
        })
    }

    fn cache_signature(&self, definition: &ParameterDef) -> String {
        match definition {
            ParameterDef::Output { .. } => self.scope_signature(),
            _ => String::new(),
        }
    }

    /// Record a block output under the current scope.
    ///
    /// Recording twice for the same (label, scope) pair is a validation
    /// error; the same label under a different loop iteration records
    /// independently.
    pub fn record_output(&self, label: &str, value: Value) -> Result<()> {
        let signature = self.scope_signature();
        let mut state = self.state.lock().expect("context lock");
        let key = (label.to_string(), signature);
        if state.outputs.contains_key(&key) {
            return Err(Error::Validation(format!(
                "Output for block '{}' already recorded in scope '{}'",
                key.0, key.1
            )));
        }
        state.outputs.insert(key, value);
        Ok(())
    }

    /// Read a recorded output visible from the current scope (innermost
    /// iteration first, then enclosing scopes, then the root).
    ///
    /// Returns `NotReady` when the producer has not yet executed under any
    /// visible scope.
    pub fn output(&self, label: &str) -> Result<Value> {
        let state = self.state.lock().expect("context lock");
        for signature in self.visible_signatures() {
            if let Some(value) = state.outputs.get(&(label.to_string(), signature)) {
                return Ok(value.clone());
            }
        }
        Err(Error::NotReady(format!(
            "Block '{}' has not recorded an output in scope '{}'",
            label,
            self.scope_signature()
        )))
    }

    /// Immutable view for the expression resolver.
    ///
    /// Contains the innermost scope bindings plus every cached value and
    /// recorded output visible from the current scope, flattened innermost
    /// first.
    pub fn snapshot(&self) -> ContextSnapshot {
        let state = self.state.lock().expect("context lock");
        let visible = self.visible_signatures();

        let mut values: HashMap<String, Value> = HashMap::new();
        let mut outputs: HashMap<String, Value> = HashMap::new();

        for signature in &visible {
            for ((key, sig), value) in &state.values {
                if sig == signature && !values.contains_key(key) {
                    values.insert(key.clone(), value.clone());
                }
            }
            for ((label, sig), value) in &state.outputs {
                if sig == signature && !outputs.contains_key(label) {
                    outputs.insert(label.clone(), value.clone());
                }
            }
        }

        ContextSnapshot {
            scope: self.scopes.last().cloned(),
            values,
            outputs,
        }
    }
}

/// Immutable context view handed to the expression resolver.
#[derive(Debug, Clone)]
pub struct ContextSnapshot {
    scope: Option<BlockMetadata>,
    values: HashMap<String, Value>,
    outputs: HashMap<String, Value>,
}

impl ContextSnapshot {
    /// The innermost active loop scope, if any.
    pub fn scope(&self) -> Option<&BlockMetadata> {
        self.scope.as_ref()
    }

    /// A resolved parameter value.
    pub fn value(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// A recorded block output visible at this scope.
    pub fn output(&self, label: &str) -> Option<&Value> {
        self.outputs.get(label)
    }

    /// Every visible parameter value and output, for evaluators that bind
    /// context state as bare identifiers.
    pub fn visible_bindings(&self) -> Vec<(String, Value)> {
        self.values
            .iter()
            .chain(self.outputs.iter())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn for_tests(
        scope: Option<BlockMetadata>,
        values: HashMap<String, Value>,
        outputs: HashMap<String, Value>,
    ) -> Self {
        Self {
            scope,
            values,
            outputs,
        }
    }
}

fn lookup_path(value: &Value, path: &str) -> Option<Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = match current {
            Value::Object(obj) => obj.get(segment)?,
            Value::Array(arr) => arr.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current.clone())
}
