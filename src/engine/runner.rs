//! Workflow runner.
//!
//! Sequences blocks per the workflow definition, owns the run context for
//! the run's lifetime, applies per-block retry/timeout/continue-on-failure
//! policy, and guarantees a persisted terminal status and context teardown
//! on every exit path, including cancellation.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::Value;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, instrument, warn, Span};

use crate::blocks::email::{Mailer, NoopMailer};
use crate::blocks::file::{MemoryObjectStore, ObjectStore};
use crate::blocks::{self, BlockOutcome};
use crate::browser::{BrowserDriver, SessionConfig, SessionPool};
use crate::config::Config;
use crate::context::RunContext;
use crate::error::{Error, FailureReason, Result};
use crate::planner::Planner;
use crate::secrets::{InMemorySecretStore, SecretStore};
use crate::shutdown::ShutdownCoordinator;
use crate::storage::{BlockExecution, BlockStatus, RunRecord, RunStatus, RunStore};
use crate::validation::validate_input;
use crate::workflow::{
    validate_workflow, BackoffType, BlockDef, BlockKind, ParameterDef, RetryPolicy, Workflow,
    WorkflowSettings,
};

/// Registry that tracks per-run cancel signals.
///
/// This lets an API/CLI surface signal a running execution; the runner
/// observes the signal between blocks and the task machine between actions,
/// never mid-action.
#[derive(Clone, Default)]
pub struct CancelRegistry {
    signals: Arc<tokio::sync::Mutex<HashMap<String, Arc<AtomicBool>>>>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a run and return its cancel signal.
    pub async fn register(&self, run_id: &str) -> Arc<AtomicBool> {
        let signal = Arc::new(AtomicBool::new(false));
        self.signals
            .lock()
            .await
            .insert(run_id.to_string(), signal.clone());
        signal
    }

    /// Request cancellation of a run. Returns false if the run is not active.
    pub async fn request_cancel(&self, run_id: &str) -> bool {
        if let Some(signal) = self.signals.lock().await.get(run_id) {
            signal.store(true, Ordering::SeqCst);
            true
        } else {
            false
        }
    }

    /// Request cancellation of every active run. Returns false if none are
    /// active.
    pub async fn request_cancel_all(&self) -> bool {
        let signals = self.signals.lock().await;
        for signal in signals.values() {
            signal.store(true, Ordering::SeqCst);
        }
        !signals.is_empty()
    }

    /// Unregister a run (called when the run reaches a terminal status).
    pub async fn unregister(&self, run_id: &str) {
        self.signals.lock().await.remove(run_id);
    }
}

/// Per-run execution environment threaded through block dispatch.
#[derive(Clone)]
pub struct RunEnv {
    pub run_id: String,
    pub deadline: Instant,
    pub cancel: Arc<AtomicBool>,
    pub settings: WorkflowSettings,
}

/// Workflow runner wired to its external collaborators.
#[derive(Clone)]
pub struct Runner {
    driver: Arc<dyn BrowserDriver>,
    planner: Arc<dyn Planner>,
    store: Arc<dyn RunStore>,
    secrets: Arc<dyn SecretStore>,
    objects: Arc<dyn ObjectStore>,
    mailer: Arc<dyn Mailer>,
    sessions: Arc<SessionPool>,
    http: reqwest::Client,
    config: Config,
    cancel_registry: CancelRegistry,
    shutdown: Option<Arc<ShutdownCoordinator>>,
}

impl Runner {
    /// Create a runner with default collaborators for the optional seams
    /// (empty secret store, in-memory object store, no mailer).
    pub fn new(
        driver: Arc<dyn BrowserDriver>,
        planner: Arc<dyn Planner>,
        store: Arc<dyn RunStore>,
    ) -> Self {
        let config = Config::default();
        let sessions = Self::build_pool(&driver, &config);
        Self {
            driver,
            planner,
            store,
            secrets: Arc::new(InMemorySecretStore::new()),
            objects: Arc::new(MemoryObjectStore::new()),
            mailer: Arc::new(NoopMailer),
            sessions,
            http: blocks::http::build_client(),
            config,
            cancel_registry: CancelRegistry::new(),
            shutdown: None,
        }
    }

    /// Override engine/browser configuration (rebuilds the session pool).
    pub fn with_config(mut self, config: Config) -> Self {
        self.sessions = Self::build_pool(&self.driver, &config);
        self.config = config;
        self
    }

    pub fn with_secrets(mut self, secrets: Arc<dyn SecretStore>) -> Self {
        self.secrets = secrets;
        self
    }

    pub fn with_object_store(mut self, objects: Arc<dyn ObjectStore>) -> Self {
        self.objects = objects;
        self
    }

    pub fn with_mailer(mut self, mailer: Arc<dyn Mailer>) -> Self {
        self.mailer = mailer;
        self
    }

    /// Attach a shutdown coordinator; a requested shutdown stops runs at the
    /// next block boundary as `terminated`.
    pub fn with_shutdown(mut self, shutdown: Arc<ShutdownCoordinator>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Handle for signaling cancellation of active runs.
    pub fn cancel_registry(&self) -> CancelRegistry {
        self.cancel_registry.clone()
    }

    fn build_pool(driver: &Arc<dyn BrowserDriver>, config: &Config) -> Arc<SessionPool> {
        Arc::new(SessionPool::new(
            driver.clone(),
            config.browser.max_sessions,
            SessionConfig {
                navigation_timeout_seconds: Some(config.browser.navigation_timeout_seconds),
                ..SessionConfig::default()
            },
        ))
    }

    fn is_shutdown_requested(&self) -> bool {
        self.shutdown
            .as_ref()
            .map(|s| s.is_shutdown_requested())
            .unwrap_or(false)
    }

    /// Execute a workflow run to a terminal status.
    #[instrument(
        name = "run.execute",
        skip(self, workflow, input),
        fields(workflow_name = %workflow.name, run_id = tracing::field::Empty)
    )]
    pub async fn execute(&self, workflow: &Workflow, input: Value) -> Result<RunRecord> {
        validate_workflow(workflow)?;
        validate_input(workflow.input_schema.as_ref(), &input)?;

        let run_id = uuid::Uuid::new_v4().to_string();
        Span::current().record("run_id", run_id.as_str());
        info!("Starting run {} of workflow '{}'", run_id, workflow.name);

        let mut run = RunRecord {
            id: run_id.clone(),
            workflow_name: workflow.name.clone(),
            organization: workflow.organization.clone(),
            status: RunStatus::Running,
            input: input.clone(),
            output: None,
            error: None,
            started_at: Utc::now(),
            finished_at: None,
        };
        self.store.save_run(&run).await?;

        let cancel = self.cancel_registry.register(&run_id).await;

        // The run context is created with the run and torn down with it.
        let ctx = RunContext::new(self.secrets.clone());
        for parameter in &workflow.parameters {
            ctx.register(parameter.clone());
        }
        if let Value::Object(entries) = &input {
            for (key, value) in entries {
                ctx.register(ParameterDef::Static {
                    key: key.clone(),
                    value: value.clone(),
                    description: String::new(),
                });
            }
        }

        let env = RunEnv {
            run_id: run_id.clone(),
            deadline: Instant::now()
                + Duration::from_secs(workflow.settings.timeout_seconds.max(1)),
            cancel,
            settings: workflow.settings.clone(),
        };

        let mut last_output = Value::Null;
        let mut terminal = RunStatus::Completed;
        let mut error_msg: Option<String> = None;

        for block in &workflow.blocks {
            if env.cancel.load(Ordering::SeqCst) {
                terminal = RunStatus::Canceled;
                error_msg = Some("Run canceled".into());
                break;
            }

            if self.is_shutdown_requested() {
                terminal = RunStatus::Terminated;
                error_msg = Some("Server shutdown".into());
                break;
            }

            if Instant::now() >= env.deadline {
                terminal = RunStatus::TimedOut;
                error_msg = Some(format!(
                    "Run timed out after {} seconds",
                    workflow.settings.timeout_seconds
                ));
                break;
            }

            // Infrastructure errors (storage, duplicate output) still tear
            // the run down with a persisted terminal status.
            let outcome = match self.execute_block(block, &ctx, &env).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    run.status = RunStatus::Failed;
                    run.error = Some(e.to_string());
                    run.finished_at = Some(Utc::now());
                    self.store.save_run(&run).await.ok();
                    self.cancel_registry.unregister(&run_id).await;
                    return Err(e);
                }
            };

            match outcome.status {
                BlockStatus::Completed => {
                    if let Some(output) = outcome.output {
                        last_output = output;
                    }
                }
                BlockStatus::Canceled => {
                    terminal = RunStatus::Canceled;
                    error_msg = failure_message(&outcome.failure, "Run canceled");
                    break;
                }
                BlockStatus::Failed | BlockStatus::TimedOut | BlockStatus::Terminated => {
                    if outcome.is_fatal() {
                        error!(
                            block = %block.label,
                            "Security failure; terminating run despite continue_on_failure"
                        );
                        terminal = RunStatus::Failed;
                        error_msg = failure_message(&outcome.failure, "Security violation");
                        break;
                    }

                    if block.continue_on_failure {
                        warn!(
                            block = %block.label,
                            "Block failed (continuing): {}",
                            failure_message(&outcome.failure, "unknown failure")
                                .unwrap_or_default()
                        );
                        continue;
                    }

                    terminal = match outcome.status {
                        BlockStatus::Terminated => RunStatus::Terminated,
                        // A block that timed out because the run budget ran
                        // out surfaces as a run timeout.
                        BlockStatus::TimedOut if Instant::now() >= env.deadline => {
                            RunStatus::TimedOut
                        }
                        _ => RunStatus::Failed,
                    };
                    error_msg = failure_message(&outcome.failure, "Block failed");
                    break;
                }
                BlockStatus::Running => {
                    // Dispatch never returns a non-terminal block status.
                    terminal = RunStatus::Failed;
                    error_msg = Some(format!("Block '{}' returned running", block.label));
                    break;
                }
            }
        }

        if env.cancel.load(Ordering::SeqCst) && terminal == RunStatus::Completed {
            terminal = RunStatus::Canceled;
            error_msg = Some("Run canceled".into());
        }

        run.status = terminal;
        run.error = error_msg;
        run.output = match terminal {
            RunStatus::Completed => Some(last_output),
            _ => None,
        };
        run.finished_at = Some(Utc::now());

        self.store.save_run(&run).await?;
        self.cancel_registry.unregister(&run_id).await;

        info!("Run {} finished with status {}", run_id, run.status);
        Ok(run)
    }

    /// Execute one block: resolve parameters, dispatch the variant, apply the
    /// retry policy, and record the output on success.
    ///
    /// Boxed for recursion through loop bodies.
    pub(crate) fn execute_block<'a>(
        &'a self,
        block: &'a BlockDef,
        ctx: &'a RunContext,
        env: &'a RunEnv,
    ) -> Pin<Box<dyn Future<Output = Result<BlockOutcome>> + Send + 'a>> {
        Box::pin(self.execute_block_inner(block, ctx, env))
    }

    #[instrument(
        name = "block.execute",
        skip(self, block, ctx, env),
        fields(block = %block.label, kind = %block.kind.name(), run_id = %env.run_id)
    )]
    async fn execute_block_inner(
        &self,
        block: &BlockDef,
        ctx: &RunContext,
        env: &RunEnv,
    ) -> Result<BlockOutcome> {
        let mut record = BlockExecution {
            id: uuid::Uuid::new_v4().to_string(),
            run_id: env.run_id.clone(),
            label: block.label.clone(),
            scope: ctx.scope_signature(),
            kind: block.kind.name().to_string(),
            status: BlockStatus::Running,
            attempt: 1,
            output: None,
            error: None,
            started_at: Utc::now(),
            finished_at: None,
        };
        self.store.save_block_execution(&record).await?;

        let max_attempts = block
            .retry
            .as_ref()
            .map(|r| r.max_attempts.max(1))
            .unwrap_or(1);

        loop {
            if env.cancel.load(Ordering::SeqCst) {
                let outcome = BlockOutcome::from_error(&Error::Canceled("Run canceled".into()));
                self.finish_block_record(&mut record, &outcome).await?;
                return Ok(outcome);
            }

            let Some(remaining) = remaining_until(env.deadline) else {
                let outcome =
                    BlockOutcome::from_error(&Error::Timeout("Run deadline exceeded".into()));
                self.finish_block_record(&mut record, &outcome).await?;
                return Ok(outcome);
            };

            let block_budget = Duration::from_secs(
                block
                    .timeout_seconds
                    .unwrap_or(self.config.engine.block_timeout_seconds)
                    .max(1),
            )
            .min(remaining);

            info!("Executing block '{}' [{}]", block.label, block.kind.name());

            let result = match timeout(block_budget, self.dispatch(block, ctx, env)).await {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout(format!(
                    "Block '{}' timed out after {}s",
                    block.label,
                    block_budget.as_secs()
                ))),
            };

            match result {
                Ok(outcome) => {
                    if outcome.succeeded() {
                        if let Some(output) = &outcome.output {
                            ctx.record_output(&block.label, output.clone())?;
                            if let Some(output_key) = &block.output_key {
                                ctx.register(ParameterDef::Output {
                                    key: output_key.clone(),
                                    block: block.label.clone(),
                                    path: None,
                                    description: String::new(),
                                });
                            }
                        }
                        debug!("Block '{}' completed", block.label);
                    }
                    self.finish_block_record(&mut record, &outcome).await?;
                    return Ok(outcome);
                }
                Err(e) => {
                    if e.is_retryable() && record.attempt < max_attempts {
                        let policy = block.retry.clone().unwrap_or_default();
                        let delay = retry_delay(&policy, record.attempt);

                        let still_remaining = remaining_until(env.deadline).unwrap_or_default();
                        if delay >= still_remaining {
                            let outcome = BlockOutcome::from_error(&Error::Timeout(format!(
                                "Block '{}' retry delay exceeds remaining run budget",
                                block.label
                            )));
                            self.finish_block_record(&mut record, &outcome).await?;
                            return Ok(outcome);
                        }

                        warn!(
                            "Block '{}' attempt {}/{} failed: {}. Retrying in {}s",
                            block.label,
                            record.attempt,
                            max_attempts,
                            e,
                            delay.as_secs()
                        );

                        // failed -> running, the one legal re-entry, bounded
                        // by the retry policy.
                        record.attempt += 1;
                        record.error = Some(e.to_string());
                        self.store.save_block_execution(&record).await?;

                        sleep(delay).await;
                        continue;
                    }

                    error!("Block '{}' failed: {}", block.label, e);
                    let outcome = BlockOutcome::from_error(&e);
                    self.finish_block_record(&mut record, &outcome).await?;
                    return Ok(outcome);
                }
            }
        }
    }

    async fn finish_block_record(
        &self,
        record: &mut BlockExecution,
        outcome: &BlockOutcome,
    ) -> Result<()> {
        record.status = outcome.status;
        record.output = outcome.output.clone();
        record.error = outcome.failure.as_ref().map(|f| f.message.clone());
        record.finished_at = Some(Utc::now());
        self.store.save_block_execution(record).await
    }

    /// Variant dispatch. Parameters referenced by the block's templates are
    /// resolved (priming the context cache, including secret fetches) before
    /// any side effect.
    async fn dispatch(
        &self,
        block: &BlockDef,
        ctx: &RunContext,
        env: &RunEnv,
    ) -> Result<BlockOutcome> {
        for key in block.kind.template_refs() {
            if ctx.has_parameter(&key) {
                ctx.resolve_parameter(&key).await?;
            }
        }

        match &block.kind {
            BlockKind::Task(_)
            | BlockKind::Navigation { .. }
            | BlockKind::Extraction { .. }
            | BlockKind::Login { .. } => blocks::task::execute(self, block, ctx, env).await,
            BlockKind::ForLoop {
                loop_over,
                max_parallel,
                blocks: children,
            } => {
                blocks::for_loop::execute(
                    self,
                    &block.label,
                    loop_over,
                    max_parallel.unwrap_or(env.settings.loop_parallelism),
                    children,
                    ctx,
                    env,
                )
                .await
            }
            BlockKind::Code { code, variables } => {
                let snapshot = ctx.snapshot();
                let output = blocks::code::evaluate(code, variables, &snapshot)?;
                Ok(BlockOutcome::completed(output))
            }
            BlockKind::Validation {
                expression,
                error_message,
            } => {
                let snapshot = ctx.snapshot();
                blocks::validation::execute(expression, error_message, &snapshot)
            }
            BlockKind::HttpRequest {
                url,
                method,
                headers,
                body,
                timeout_seconds,
            } => {
                let snapshot = ctx.snapshot();
                let request = blocks::http::resolve_request(
                    url,
                    method,
                    headers.as_ref(),
                    body.as_ref(),
                    *timeout_seconds,
                    &snapshot,
                )?;
                blocks::http::execute(&self.http, request).await
            }
            BlockKind::FileDownload {
                source,
                destination,
            } => {
                let snapshot = ctx.snapshot();
                blocks::file::execute_download(&self.objects, source, destination, &snapshot).await
            }
            BlockKind::FileUpload {
                source,
                encode_base64,
            } => {
                let snapshot = ctx.snapshot();
                blocks::file::execute_upload(&self.objects, source, *encode_base64, &snapshot).await
            }
            BlockKind::SendEmail {
                to,
                subject,
                body,
                attachments,
            } => {
                let snapshot = ctx.snapshot();
                blocks::email::execute(
                    &self.mailer,
                    to,
                    subject,
                    body,
                    attachments,
                    &snapshot,
                )
                .await
            }
        }
    }

    pub(crate) fn driver(&self) -> &Arc<dyn BrowserDriver> {
        &self.driver
    }

    pub(crate) fn planner(&self) -> &Arc<dyn Planner> {
        &self.planner
    }

    pub(crate) fn store(&self) -> &Arc<dyn RunStore> {
        &self.store
    }

    pub(crate) fn sessions(&self) -> &Arc<SessionPool> {
        &self.sessions
    }
}

fn failure_message(failure: &Option<FailureReason>, fallback: &str) -> Option<String> {
    Some(
        failure
            .as_ref()
            .map(|f| f.message.clone())
            .unwrap_or_else(|| fallback.to_string()),
    )
}

fn remaining_until(deadline: Instant) -> Option<Duration> {
    let now = Instant::now();
    if now >= deadline {
        None
    } else {
        Some(deadline.saturating_duration_since(now))
    }
}

fn retry_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let base = policy.delay_seconds;
    let secs = match policy.backoff {
        BackoffType::Fixed => base,
        BackoffType::Linear => base.saturating_mul(attempt as u64),
        BackoffType::Exponential => {
            let shift = attempt.saturating_sub(1).min(20);
            base.saturating_mul(1u64 << shift)
        }
    };
    Duration::from_secs(secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocks::email::RecordingMailer;
    use crate::browser::{ElementHandle, PageSnapshot, SessionHandle};
    use crate::planner::{PlannedAction, StepSummary, Verification};
    use crate::secrets::SecretValue;
    use crate::storage::MemoryStore;
    use crate::task::{Action, ActionResult};
    use crate::workflow::parse_workflow;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    // ============================================================================
    // Test Collaborators
    // ============================================================================

    /// Driver where every action succeeds; extract actions return `data`.
    struct NullDriver {
        open_sessions: AtomicUsize,
        extract_data: Value,
    }

    impl NullDriver {
        fn new() -> Arc<Self> {
            Self::with_extract_data(Value::Null)
        }

        fn with_extract_data(data: Value) -> Arc<Self> {
            Arc::new(Self {
                open_sessions: AtomicUsize::new(0),
                extract_data: data,
            })
        }
    }

    #[async_trait]
    impl BrowserDriver for NullDriver {
        async fn open_session(&self, _config: &SessionConfig) -> Result<SessionHandle> {
            let n = self.open_sessions.fetch_add(1, Ordering::SeqCst);
            Ok(SessionHandle {
                id: format!("session-{}", n),
            })
        }

        async fn close_session(&self, _session: &SessionHandle) -> Result<()> {
            self.open_sessions.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }

        async fn capture_page(&self, _session: &SessionHandle) -> Result<PageSnapshot> {
            Ok(PageSnapshot::default())
        }

        async fn resolve_element(
            &self,
            _session: &SessionHandle,
            reference: &str,
        ) -> Result<ElementHandle> {
            Ok(ElementHandle {
                id: reference.to_string(),
            })
        }

        async fn perform_action(
            &self,
            _session: &SessionHandle,
            _element: Option<&ElementHandle>,
            action: &Action,
        ) -> Result<ActionResult> {
            Ok(match action {
                Action::Extract { .. } => ActionResult::success(self.extract_data.clone()),
                _ => ActionResult::success(Value::Null),
            })
        }
    }

    /// Planner that replays scripted step plans with an optional delay.
    struct ScriptedPlanner {
        plans: Mutex<VecDeque<Vec<PlannedAction>>>,
        repeat: Option<Vec<PlannedAction>>,
        verify_achieved: bool,
        plan_delay: Duration,
    }

    impl ScriptedPlanner {
        fn new(plans: Vec<Vec<Action>>, verify_achieved: bool) -> Arc<Self> {
            Arc::new(Self {
                plans: Mutex::new(
                    plans
                        .into_iter()
                        .map(|p| p.into_iter().map(PlannedAction::from).collect())
                        .collect(),
                ),
                repeat: None,
                verify_achieved,
                plan_delay: Duration::ZERO,
            })
        }

        /// Plan the same actions every step, with a delay per plan call.
        fn repeating(actions: Vec<Action>, plan_delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                plans: Mutex::new(VecDeque::new()),
                repeat: Some(actions.into_iter().map(PlannedAction::from).collect()),
                verify_achieved: false,
                plan_delay,
            })
        }
    }

    #[async_trait]
    impl Planner for ScriptedPlanner {
        async fn plan(
            &self,
            _snapshot: &PageSnapshot,
            _goal: &str,
            _history: &[StepSummary],
        ) -> Result<Vec<PlannedAction>> {
            if !self.plan_delay.is_zero() {
                tokio::time::sleep(self.plan_delay).await;
            }
            if let Some(repeat) = &self.repeat {
                return Ok(repeat.clone());
            }
            Ok(self.plans.lock().unwrap().pop_front().unwrap_or_default())
        }

        async fn verify_completion(
            &self,
            _snapshot: &PageSnapshot,
            _goal: &str,
        ) -> Result<Verification> {
            Ok(Verification {
                achieved: self.verify_achieved,
                rationale: "scripted".into(),
            })
        }
    }

    /// Secret store that counts fetches.
    struct CountingSecretStore {
        fetches: AtomicUsize,
    }

    #[async_trait]
    impl SecretStore for CountingSecretStore {
        async fn fetch(&self, _reference: &str) -> Result<SecretValue> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            Ok(SecretValue::new("swordfish"))
        }
    }

    // ============================================================================
    // Helper Functions
    // ============================================================================

    fn runner_with(driver: Arc<dyn BrowserDriver>, planner: Arc<dyn Planner>) -> (Runner, Arc<MemoryStore>) {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let store = Arc::new(MemoryStore::new());
        (
            Runner::new(driver, planner, store.clone() as Arc<dyn RunStore>),
            store,
        )
    }

    fn basic_runner() -> (Runner, Arc<MemoryStore>) {
        runner_with(NullDriver::new(), ScriptedPlanner::new(vec![], false))
    }

    // ============================================================================
    // Basic Execution Tests
    // ============================================================================

    #[tokio::test]
    async fn test_execute_simple_workflow() {
        let (runner, _store) = basic_runner();

        let workflow = parse_workflow(
            r#"
name: simple
blocks:
  - label: compute
    type: code
    code: "1 + 1"
"#,
        )
        .unwrap();

        let run = runner.execute(&workflow, Value::Null).await.unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.output, Some(json!(2)));
        assert!(run.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_outputs_chain_between_blocks() {
        let (runner, _store) = basic_runner();

        let workflow = parse_workflow(
            r#"
name: chained
blocks:
  - label: rows
    type: code
    code: "[10, 20, 30]"
  - label: total
    type: code
    code: "rows.reduce(|sum, v| sum + v, 0)"
    variables: [rows]
"#,
        )
        .unwrap();

        let run = runner.execute(&workflow, Value::Null).await.unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.output, Some(json!(60)));
    }

    #[tokio::test]
    async fn test_initial_parameters_reach_blocks() {
        let (runner, _store) = basic_runner();

        let workflow = parse_workflow(
            r#"
name: params
parameters:
  - type: static
    key: factor
    value: 3
blocks:
  - label: scaled
    type: code
    code: "n * factor"
    variables: [n, factor]
"#,
        )
        .unwrap();

        let run = runner.execute(&workflow, json!({"n": 5})).await.unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.output, Some(json!(15)));
    }

    #[tokio::test]
    async fn test_input_schema_rejects_bad_parameters() {
        let (runner, _store) = basic_runner();

        let workflow = parse_workflow(
            r#"
name: schema-guard
input_schema:
  type: object
  required: [account_id]
blocks:
  - label: noop
    type: code
    code: "1"
"#,
        )
        .unwrap();

        let err = runner.execute(&workflow, json!({})).await.unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    // ============================================================================
    // Loop Tests
    // ============================================================================

    #[tokio::test]
    async fn test_for_loop_doubles_each_item() {
        let (runner, store) = basic_runner();

        let workflow = parse_workflow(
            r#"
name: loop-double
blocks:
  - label: rows
    type: code
    code: "[1, 2, 3]"
  - label: each-row
    type: for_loop
    loop_over: "${rows.output}"
    blocks:
      - label: double
        type: code
        code: "current_item * 2"
"#,
        )
        .unwrap();

        let run = runner.execute(&workflow, Value::Null).await.unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.output, Some(json!([2, 4, 6])));

        // Child executions are recorded once per iteration scope.
        let blocks = store.block_executions(&run.id).await.unwrap();
        let child_scopes: Vec<String> = blocks
            .iter()
            .filter(|b| b.label == "double")
            .map(|b| b.scope.clone())
            .collect();
        assert_eq!(
            child_scopes,
            vec!["each-row[0]", "each-row[1]", "each-row[2]"]
        );
    }

    #[tokio::test]
    async fn test_parallel_loop_preserves_item_order() {
        let (runner, _store) = basic_runner();

        let workflow = parse_workflow(
            r#"
name: loop-parallel
blocks:
  - label: rows
    type: code
    code: "[1, 2, 3, 4, 5, 6]"
  - label: each-row
    type: for_loop
    loop_over: "${rows.output}"
    max_parallel: 3
    blocks:
      - label: square
        type: code
        code: "current_item * current_item"
"#,
        )
        .unwrap();

        let run = runner.execute(&workflow, Value::Null).await.unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.output, Some(json!([1, 4, 9, 16, 25, 36])));
    }

    #[tokio::test]
    async fn test_nested_loops_shadow_outer_variables() {
        let (runner, _store) = basic_runner();

        let workflow = parse_workflow(
            r#"
name: loop-nested
blocks:
  - label: outer-rows
    type: code
    code: "[[1, 2], [3, 4]]"
  - label: outer
    type: for_loop
    loop_over: "${outer-rows.output}"
    blocks:
      - label: inner
        type: for_loop
        loop_over: "${current_item}"
        blocks:
          - label: bump
            type: code
            code: "current_item + 100"
"#,
        )
        .unwrap();

        let run = runner.execute(&workflow, Value::Null).await.unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        // Inner loop output per outer iteration; outer collects them.
        assert_eq!(run.output, Some(json!([[101, 102], [103, 104]])));
    }

    #[tokio::test]
    async fn test_loop_over_non_array_fails() {
        let (runner, _store) = basic_runner();

        let workflow = parse_workflow(
            r#"
name: loop-bad-source
blocks:
  - label: scalar
    type: code
    code: "42"
  - label: spin
    type: for_loop
    loop_over: "${scalar.output}"
    blocks:
      - label: never
        type: code
        code: "1"
"#,
        )
        .unwrap();

        let run = runner.execute(&workflow, Value::Null).await.unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.error.unwrap().contains("non-array"));
    }

    #[tokio::test]
    async fn test_loop_child_failure_stops_remaining_iterations() {
        let (runner, store) = basic_runner();

        // The second iteration fails its validation; iteration 3 never runs.
        let workflow = parse_workflow(
            r#"
name: loop-halts
blocks:
  - label: rows
    type: code
    code: "[1, 2, 3]"
  - label: each-row
    type: for_loop
    loop_over: "${rows.output}"
    blocks:
      - label: check
        type: validation
        expression: "current_item != 2"
        error_message: bad row
"#,
        )
        .unwrap();

        let run = runner.execute(&workflow, Value::Null).await.unwrap();
        assert_eq!(run.status, RunStatus::Failed);

        let blocks = store.block_executions(&run.id).await.unwrap();
        let scopes: Vec<String> = blocks
            .iter()
            .filter(|b| b.label == "check")
            .map(|b| b.scope.clone())
            .collect();
        assert_eq!(scopes, vec!["each-row[0]", "each-row[1]"]);
    }

    #[tokio::test]
    async fn test_loop_child_continue_on_failure_keeps_iterating() {
        let (runner, store) = basic_runner();

        let workflow = parse_workflow(
            r#"
name: loop-absorbs
blocks:
  - label: rows
    type: code
    code: "[1, 2, 3]"
  - label: each-row
    type: for_loop
    loop_over: "${rows.output}"
    blocks:
      - label: check
        type: validation
        expression: "current_item != 2"
        error_message: bad row
        continue_on_failure: true
      - label: double
        type: code
        code: "current_item * 2"
"#,
        )
        .unwrap();

        let run = runner.execute(&workflow, Value::Null).await.unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        // Every iteration ran to its last child despite the absorbed failure.
        assert_eq!(run.output, Some(json!([2, 4, 6])));

        let blocks = store.block_executions(&run.id).await.unwrap();
        let failed = blocks
            .iter()
            .find(|b| b.label == "check" && b.scope == "each-row[1]")
            .unwrap();
        assert_eq!(failed.status, BlockStatus::Failed);
    }

    // ============================================================================
    // Failure Policy Tests
    // ============================================================================

    #[tokio::test]
    async fn test_continue_on_failure_allows_completed_run() {
        let (runner, store) = basic_runner();

        let workflow = parse_workflow(
            r#"
name: absorb-failure
blocks:
  - label: check
    type: validation
    expression: "false"
    error_message: expected failure
    continue_on_failure: true
  - label: after
    type: code
    code: "\"still ran\""
"#,
        )
        .unwrap();

        let run = runner.execute(&workflow, Value::Null).await.unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.output, Some(json!("still ran")));

        // The failure is still recorded.
        let blocks = store.block_executions(&run.id).await.unwrap();
        let check = blocks.iter().find(|b| b.label == "check").unwrap();
        assert_eq!(check.status, BlockStatus::Failed);
        assert!(check.error.as_deref().unwrap().contains("expected failure"));
    }

    #[tokio::test]
    async fn test_failure_without_continue_stops_run() {
        let (runner, store) = basic_runner();

        let workflow = parse_workflow(
            r#"
name: hard-failure
blocks:
  - label: check
    type: validation
    expression: "false"
  - label: never
    type: code
    code: "1"
"#,
        )
        .unwrap();

        let run = runner.execute(&workflow, Value::Null).await.unwrap();
        assert_eq!(run.status, RunStatus::Failed);

        let blocks = store.block_executions(&run.id).await.unwrap();
        assert!(blocks.iter().all(|b| b.label != "never"));
    }

    #[tokio::test]
    async fn test_security_failure_ignores_continue_on_failure() {
        let (runner, store) = basic_runner();

        let workflow = parse_workflow(
            r#"
name: sandbox-escape
blocks:
  - label: sneaky
    type: code
    code: "undeclared_thing + 1"
    continue_on_failure: true
  - label: never
    type: code
    code: "1"
"#,
        )
        .unwrap();

        let run = runner.execute(&workflow, Value::Null).await.unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.error.unwrap().contains("undeclared"));

        let blocks = store.block_executions(&run.id).await.unwrap();
        assert!(blocks.iter().all(|b| b.label != "never"));
    }

    #[tokio::test]
    async fn test_retryable_failure_consumes_attempts() {
        let (runner, store) = basic_runner();

        // file_upload of a missing object is a Network (retryable) failure.
        let workflow = parse_workflow(
            r#"
name: retry-exhaustion
blocks:
  - label: fetch-report
    type: file_upload
    source: missing/report.json
    retry:
      max_attempts: 3
      delay_seconds: 0
"#,
        )
        .unwrap();

        let run = runner.execute(&workflow, Value::Null).await.unwrap();
        assert_eq!(run.status, RunStatus::Failed);

        let blocks = store.block_executions(&run.id).await.unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].attempt, 3);
        assert_eq!(blocks[0].status, BlockStatus::Failed);
    }

    #[tokio::test]
    async fn test_validation_failure_is_not_retried() {
        let (runner, store) = basic_runner();

        let workflow = parse_workflow(
            r#"
name: no-retry-validation
blocks:
  - label: check
    type: validation
    expression: "false"
    retry:
      max_attempts: 5
      delay_seconds: 0
"#,
        )
        .unwrap();

        let run = runner.execute(&workflow, Value::Null).await.unwrap();
        assert_eq!(run.status, RunStatus::Failed);

        let blocks = store.block_executions(&run.id).await.unwrap();
        assert_eq!(blocks[0].attempt, 1);
    }

    // ============================================================================
    // Task Block Tests
    // ============================================================================

    #[tokio::test]
    async fn test_task_block_extracts_and_completes() {
        let driver = NullDriver::with_extract_data(json!({"rows": [1, 2, 3]}));
        let planner = ScriptedPlanner::new(
            vec![vec![
                Action::Extract {
                    goal: "get rows".into(),
                },
                Action::Complete { data: None },
            ]],
            true,
        );
        let (runner, store) = runner_with(driver.clone(), planner);

        let workflow = parse_workflow(
            r#"
name: task-flow
blocks:
  - label: scrape
    type: extraction
    goal: Extract the rows
  - label: count
    type: code
    code: "scrape.rows.len()"
    variables: [scrape]
"#,
        )
        .unwrap();

        let run = runner.execute(&workflow, Value::Null).await.unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.output, Some(json!(3)));

        // Step and action records were written, and the session was released.
        assert!(!store.steps(&run.id).await.unwrap().is_empty());
        assert!(!store.actions(&run.id).await.unwrap().is_empty());
        assert_eq!(driver.open_sessions.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_task_step_budget_terminates_run() {
        // The planner never completes; the step budget ends the task.
        let planner = ScriptedPlanner::repeating(
            vec![Action::Scroll {
                target: None,
                direction: Default::default(),
            }],
            Duration::ZERO,
        );
        let (runner, _store) = runner_with(NullDriver::new(), planner);

        let workflow = parse_workflow(
            r#"
name: budgeted
settings:
  max_steps_per_task: 2
blocks:
  - label: wander
    type: task
    goal: Wander forever
"#,
        )
        .unwrap();

        let run = runner.execute(&workflow, Value::Null).await.unwrap();
        // Terminated, not failed: budget exhaustion is not an error.
        assert_eq!(run.status, RunStatus::Terminated);
    }

    // ============================================================================
    // Cancellation / Shutdown / Timeout Tests
    // ============================================================================

    #[tokio::test]
    async fn test_cancel_mid_run_releases_session() {
        let driver = NullDriver::new();
        let planner = ScriptedPlanner::repeating(
            vec![Action::Scroll {
                target: None,
                direction: Default::default(),
            }],
            Duration::from_millis(30),
        );
        let (runner, _store) = runner_with(driver.clone(), planner);

        let workflow = parse_workflow(
            r#"
name: cancelable
settings:
  max_steps_per_task: 1000
blocks:
  - label: wander
    type: task
    goal: Wander until canceled
"#,
        )
        .unwrap();

        let registry = runner.cancel_registry();
        let handle = tokio::spawn(async move { runner.execute(&workflow, Value::Null).await });

        // Let the run start, then cancel it.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let mut canceled = false;
        for _ in 0..50 {
            if registry.request_cancel_all().await {
                canceled = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(canceled, "run never registered a cancel signal");

        let run = handle.await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Canceled);
        assert!(run.finished_at.is_some());

        // The reserved browser session was returned.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(driver.open_sessions.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_shutdown_terminates_before_next_block() {
        let (runner, _store) = basic_runner();
        let shutdown = Arc::new(ShutdownCoordinator::new());
        shutdown.request_shutdown();
        let runner = runner.with_shutdown(shutdown);

        let workflow = parse_workflow(
            r#"
name: shutdown-flow
blocks:
  - label: never
    type: code
    code: "1"
"#,
        )
        .unwrap();

        let run = runner.execute(&workflow, Value::Null).await.unwrap();
        assert_eq!(run.status, RunStatus::Terminated);
    }

    #[tokio::test]
    async fn test_run_deadline_times_out() {
        let planner = ScriptedPlanner::repeating(
            vec![Action::Scroll {
                target: None,
                direction: Default::default(),
            }],
            Duration::from_millis(300),
        );
        let (runner, _store) = runner_with(NullDriver::new(), planner);

        let workflow = parse_workflow(
            r#"
name: deadline
settings:
  timeout_seconds: 1
  max_steps_per_task: 1000
blocks:
  - label: wander
    type: task
    goal: Wander past the deadline
"#,
        )
        .unwrap();

        let run = runner.execute(&workflow, Value::Null).await.unwrap();
        // Budget timeout stays distinct from failed/terminated.
        assert!(
            run.status == RunStatus::TimedOut || run.status == RunStatus::Terminated,
            "unexpected status {}",
            run.status
        );
        assert_ne!(run.status, RunStatus::Failed);
    }

    // ============================================================================
    // Secret / Mailer Tests
    // ============================================================================

    #[tokio::test]
    async fn test_secret_fetched_once_across_blocks() {
        let secrets = Arc::new(CountingSecretStore {
            fetches: AtomicUsize::new(0),
        });
        let (runner, _store) = basic_runner();
        let runner = runner.with_secrets(secrets.clone());

        let workflow = parse_workflow(
            r#"
name: secret-cache
parameters:
  - type: secret
    key: token
    reference: vault/token
blocks:
  - label: first
    type: code
    code: "token.len()"
    variables: [token]
  - label: second
    type: code
    code: "token.len()"
    variables: [token]
"#,
        )
        .unwrap();

        let run = runner.execute(&workflow, Value::Null).await.unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(secrets.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_email_block_uses_mailer() {
        let mailer = Arc::new(RecordingMailer::default());
        let (runner, _store) = basic_runner();
        let runner = runner.with_mailer(mailer.clone());

        let workflow = parse_workflow(
            r#"
name: notify
blocks:
  - label: total
    type: code
    code: "42"
  - label: send
    type: send_email
    to: ["ops@example.com"]
    subject: "Total: ${total.output}"
    body: "Computed ${total.output}."
"#,
        )
        .unwrap();

        let run = runner.execute(&workflow, Value::Null).await.unwrap();
        assert_eq!(run.status, RunStatus::Completed);

        let sent = mailer.sent.lock().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].subject, "Total: 42");
    }

    // ============================================================================
    // Unit Tests
    // ============================================================================

    #[test]
    fn retry_delay_backoff_curves() {
        let fixed = RetryPolicy {
            max_attempts: 3,
            delay_seconds: 2,
            backoff: BackoffType::Fixed,
        };
        assert_eq!(retry_delay(&fixed, 1), Duration::from_secs(2));
        assert_eq!(retry_delay(&fixed, 4), Duration::from_secs(2));

        let linear = RetryPolicy {
            backoff: BackoffType::Linear,
            ..fixed.clone()
        };
        assert_eq!(retry_delay(&linear, 3), Duration::from_secs(6));

        let exponential = RetryPolicy {
            backoff: BackoffType::Exponential,
            ..fixed
        };
        assert_eq!(retry_delay(&exponential, 1), Duration::from_secs(2));
        assert_eq!(retry_delay(&exponential, 4), Duration::from_secs(16));
    }

}
