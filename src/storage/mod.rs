//! Run persistence interface.
//!
//! The engine emits status transitions at fixed write points: run start/end,
//! block start/end, step retry, action completion. Durable storage lives
//! behind [`RunStore`]; [`MemoryStore`] is the in-process reference
//! implementation used by tests and embedded deployments.

mod models;

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::{Error, Result};

pub use models::{
    ActionRecord, BlockExecution, BlockStatus, RunRecord, RunStatus, StepRecord,
};

/// Persistence consumed by the engine. All state must be queryable mid-run.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Insert or update a run record.
    async fn save_run(&self, run: &RunRecord) -> Result<()>;

    async fn get_run(&self, run_id: &str) -> Result<Option<RunRecord>>;

    /// Insert or update a block execution record.
    async fn save_block_execution(&self, record: &BlockExecution) -> Result<()>;

    async fn block_executions(&self, run_id: &str) -> Result<Vec<BlockExecution>>;

    /// Insert or update a step record (written on start, retry, and finish).
    async fn save_step(&self, record: &StepRecord) -> Result<()>;

    async fn steps(&self, run_id: &str) -> Result<Vec<StepRecord>>;

    /// Append an action record on action completion.
    async fn save_action(&self, record: &ActionRecord) -> Result<()>;

    async fn actions(&self, run_id: &str) -> Result<Vec<ActionRecord>>;
}

#[derive(Default)]
struct MemoryState {
    runs: HashMap<String, RunRecord>,
    blocks: HashMap<String, Vec<BlockExecution>>,
    steps: HashMap<String, Vec<StepRecord>>,
    actions: HashMap<String, Vec<ActionRecord>>,
}

/// In-memory run store.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunStore for MemoryStore {
    async fn save_run(&self, run: &RunRecord) -> Result<()> {
        let mut state = self.state.write().await;
        state.runs.insert(run.id.clone(), run.clone());
        Ok(())
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<RunRecord>> {
        Ok(self.state.read().await.runs.get(run_id).cloned())
    }

    async fn save_block_execution(&self, record: &BlockExecution) -> Result<()> {
        let mut state = self.state.write().await;
        let records = state.blocks.entry(record.run_id.clone()).or_default();
        match records.iter_mut().find(|r| r.id == record.id) {
            Some(existing) => *existing = record.clone(),
            None => records.push(record.clone()),
        }
        Ok(())
    }

    async fn block_executions(&self, run_id: &str) -> Result<Vec<BlockExecution>> {
        Ok(self
            .state
            .read()
            .await
            .blocks
            .get(run_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn save_step(&self, record: &StepRecord) -> Result<()> {
        let mut state = self.state.write().await;
        let records = state.steps.entry(record.run_id.clone()).or_default();
        match records.iter_mut().find(|r| r.id == record.id) {
            Some(existing) => *existing = record.clone(),
            None => records.push(record.clone()),
        }
        Ok(())
    }

    async fn steps(&self, run_id: &str) -> Result<Vec<StepRecord>> {
        Ok(self
            .state
            .read()
            .await
            .steps
            .get(run_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn save_action(&self, record: &ActionRecord) -> Result<()> {
        let mut state = self.state.write().await;
        if record.id.is_empty() {
            return Err(Error::Storage("Action record requires an id".into()));
        }
        state
            .actions
            .entry(record.run_id.clone())
            .or_default()
            .push(record.clone());
        Ok(())
    }

    async fn actions(&self, run_id: &str) -> Result<Vec<ActionRecord>> {
        Ok(self
            .state
            .read()
            .await
            .actions
            .get(run_id)
            .cloned()
            .unwrap_or_default())
    }
}
