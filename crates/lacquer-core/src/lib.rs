// Copyright (c) 2025 Lacquer Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Core workflow execution engine for Lacquer agent-oriented workflows.
//!
//! [`Engine`] is the caller-facing entry point: it owns the provider/tool/
//! runtime registries and the state store, and turns a parsed [`Workflow`]
//! plus inputs into an [`ExecutionSummary`] by driving an [`Executor`].

mod cancellation;
mod context;
mod duration;
mod error;
mod executor;
mod expr;
mod output;
mod providers;
mod resolver;
mod schema;
mod state;
mod template;
mod value;
mod workflow;

pub use cancellation::CancellationToken;
pub use context::{ExecutionContext, StepResult, StepStatus};
pub use duration::parse_duration;
pub use error::{OrchestratorError, Result};
pub use executor::{Collaborators, ExecutionSummary, Executor, RunStatus};
pub use output::parse_output;
pub use providers::{
    ContentBlock, LLMProvider, Message, ModelRequest, ModelResponse, ProviderError, RuntimeProvider,
    SubWorkflowLoader, TokenUsage, ToolDefinition, ToolExecContext, ToolKind, ToolProvider, ToolResult,
    FsWorkflowLoader,
};
pub use schema::{generate_schema, prompt_instructions};
pub use state::{FileStateStore, MemoryStateStore, StateSnapshot, StateStore};
pub use template::{has_template, render_json, render_template, validate_template};
pub use value::{IndexOutcome, Value};
pub use workflow::{
    AgentConfig, ErrorHandler, OutputSpec, RetryPolicy, ScriptSpec, Step, StepKind, Workflow, WorkflowDef,
};

use std::collections::HashMap;
use std::sync::Arc;

/// Wiring the engine needs before it can run a workflow: the provider
/// registries the workflow's `agents`/actions resolve against, the state
/// backend, the sub-workflow loader for `uses:` steps, and the snapshot
/// policy. Built with the struct-literal-plus-builder-methods shape the rest
/// of the crate uses rather than a generic "options bag".
pub struct EngineConfig {
    pub llm_providers: HashMap<String, Arc<dyn LLMProvider>>,
    pub tool_providers: HashMap<String, Arc<dyn ToolProvider>>,
    pub runtime_providers: HashMap<String, Arc<dyn RuntimeProvider>>,
    pub workflow_loader: Arc<dyn SubWorkflowLoader>,
    pub state_store: Arc<dyn StateStore>,
    pub snapshot_interval: Option<usize>,
    pub max_snapshots: usize,
}

impl EngineConfig {
    /// A minimal config suitable for tests: no registered providers, an
    /// in-memory state store, filesystem sub-workflow loading rooted at the
    /// current directory, and no periodic snapshots.
    pub fn in_memory() -> Self {
        Self {
            llm_providers: HashMap::new(),
            tool_providers: HashMap::new(),
            runtime_providers: HashMap::new(),
            workflow_loader: Arc::new(FsWorkflowLoader { base_dir: std::path::PathBuf::from(".") }),
            state_store: Arc::new(MemoryStateStore::new(20)),
            snapshot_interval: None,
            max_snapshots: 20,
        }
    }

    pub fn with_llm_provider(mut self, name: impl Into<String>, provider: Arc<dyn LLMProvider>) -> Self {
        self.llm_providers.insert(name.into(), provider);
        self
    }

    pub fn with_tool_provider(mut self, provider: Arc<dyn ToolProvider>) -> Self {
        self.tool_providers.insert(provider.get_name().to_string(), provider);
        self
    }

    pub fn with_runtime_provider(mut self, name: impl Into<String>, provider: Arc<dyn RuntimeProvider>) -> Self {
        self.runtime_providers.insert(name.into(), provider);
        self
    }

    pub fn with_state_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.state_store = store;
        self
    }

    pub fn with_workflow_loader(mut self, loader: Arc<dyn SubWorkflowLoader>) -> Self {
        self.workflow_loader = loader;
        self
    }

    pub fn with_snapshot_interval(mut self, interval: Option<usize>) -> Self {
        self.snapshot_interval = interval;
        self
    }

    pub fn with_max_snapshots(mut self, max_snapshots: usize) -> Self {
        self.max_snapshots = max_snapshots;
        self
    }

}

/// The engine itself. Stateless beyond its config — every call builds a
/// fresh [`ExecutionContext`]/[`Executor`] pair, so a single `Engine` can
/// drive any number of concurrent runs.
pub struct Engine {
    config: EngineConfig,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    /// Parses nothing — `workflow` is already a validated AST. Builds a
    /// fresh run id (or reuses a caller-supplied one for resume), runs every
    /// step to completion or terminal failure, and returns the summary.
    pub async fn execute_workflow(
        &self,
        workflow: Workflow,
        inputs: HashMap<String, serde_json::Value>,
    ) -> Result<ExecutionSummary> {
        self.execute_workflow_with_run_id(workflow, inputs, None, None, CancellationToken::new()).await
    }

    /// `resume_snapshot_id`, when given, resumes the run from that snapshot's
    /// state AND step cursor instead of starting a fresh run (or, with no
    /// snapshot id, falling back to whatever raw state is latest for
    /// `run_id`, which carries no cursor).
    pub async fn execute_workflow_with_run_id(
        &self,
        workflow: Workflow,
        inputs: HashMap<String, serde_json::Value>,
        run_id: Option<String>,
        resume_snapshot_id: Option<String>,
        cancel: CancellationToken,
    ) -> Result<ExecutionSummary> {
        let context = ExecutionContext::new(workflow, inputs, run_id)?;
        let collaborators = self.config.collaborators_ref();
        let mut executor = Executor::new(context, collaborators, cancel);

        if let Some(snap_id) = resume_snapshot_id {
            let snapshot = self
                .config
                .state_store
                .load_snapshot(&executor.context.run_id, &snap_id)?
                .ok_or_else(|| {
                    OrchestratorError::PersistenceError(format!(
                        "no snapshot '{}' for run '{}'",
                        snap_id, executor.context.run_id
                    ))
                })?;
            executor = executor.with_resume_snapshot(snapshot);
        }

        executor.run().await
    }

    /// Loads the most recent persisted state for `run_id` and, if
    /// `snapshot_id` is given, overlays that snapshot's state and step cursor
    /// instead — rebuilding the [`ExecutionContext`] a caller can hand back
    /// into [`Engine::execute_workflow_with_run_id`] to resume.
    pub fn restore_run(&self, workflow: Workflow, run_id: &str, snapshot_id: Option<&str>) -> Result<ExecutionContext> {
        let context = ExecutionContext::new(workflow, HashMap::new(), Some(run_id.to_string()))?;

        match snapshot_id {
            Some(snap_id) => {
                let snapshot = self
                    .config
                    .state_store
                    .load_snapshot(run_id, snap_id)?
                    .ok_or_else(|| OrchestratorError::PersistenceError(format!("no snapshot '{}' for run '{}'", snap_id, run_id)))?;
                context.replace_state(snapshot.state);
                let resume_at = snapshot.step_index.min(context.steps.len());
                for step in context.steps[..resume_at].to_vec() {
                    context.set_step_result(
                        &step.id,
                        StepResult { status: StepStatus::Completed, ..StepResult::pending(&step.id) },
                    );
                }
                context.set_cursor(resume_at);
            }
            None => {
                let state = self
                    .config
                    .state_store
                    .get(run_id)?
                    .ok_or_else(|| OrchestratorError::PersistenceError(format!("no persisted state for run '{}'", run_id)))?;
                context.replace_state(state);
            }
        }

        Ok(context)
    }
}

impl EngineConfig {
    fn collaborators_ref(&self) -> Collaborators {
        Collaborators {
            llm_providers: self.llm_providers.clone(),
            tool_providers: self.tool_providers.clone(),
            runtime_providers: self.runtime_providers.clone(),
            workflow_loader: self.workflow_loader.clone(),
            state_store: self.state_store.clone(),
            snapshot_interval: self.snapshot_interval,
            max_snapshots: self.max_snapshots,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STATE_ONLY_WORKFLOW: &str = r#"
version: "1.0"
workflow:
  state:
    counter: 0
  steps:
    - id: step1
      action: update_state
      updates:
        counter: 1
    - id: step2
      action: update_state
      updates:
        counter: 2
  outputs:
    counter: "{{ state.counter }}"
"#;

    // Property 1 (deterministic ordering): two runs with no provider calls
    // and identical inputs reach the same state.
    #[tokio::test]
    async fn provider_free_runs_are_deterministic() {
        let workflow: Workflow = serde_yaml::from_str(STATE_ONLY_WORKFLOW).unwrap();
        let engine = Engine::new(EngineConfig::in_memory());

        let first = engine.execute_workflow(workflow.clone(), HashMap::new()).await.unwrap();
        let second = engine.execute_workflow(workflow, HashMap::new()).await.unwrap();

        assert_eq!(first.outputs, second.outputs);
        assert_eq!(first.status, RunStatus::Completed);
        assert_eq!(second.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn execute_workflow_with_run_id_persists_state_under_that_id() {
        let workflow: Workflow = serde_yaml::from_str(STATE_ONLY_WORKFLOW).unwrap();
        let store = Arc::new(MemoryStateStore::new(10));
        let engine = Engine::new(EngineConfig::in_memory().with_state_store(store.clone()));

        let summary = engine
            .execute_workflow_with_run_id(workflow, HashMap::new(), Some("fixed-run".to_string()), None, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.run_id, "fixed-run");
        assert!(store.get("fixed-run").unwrap().is_some());
    }

    #[tokio::test]
    async fn restore_run_rebuilds_context_from_persisted_state() {
        let workflow: Workflow = serde_yaml::from_str(STATE_ONLY_WORKFLOW).unwrap();
        let store = Arc::new(MemoryStateStore::new(10));
        let engine = Engine::new(EngineConfig::in_memory().with_state_store(store));

        engine
            .execute_workflow_with_run_id(workflow.clone(), HashMap::new(), Some("resume-run".to_string()), None, CancellationToken::new())
            .await
            .unwrap();

        let restored = engine.restore_run(workflow, "resume-run", None).unwrap();
        let Value::Map(state) = restored.get_state_map() else { panic!("expected map state") };
        assert_eq!(state.get("counter"), Some(&Value::Int(2)));
    }

    #[test]
    fn restore_run_errors_when_no_state_was_ever_persisted() {
        let workflow: Workflow = serde_yaml::from_str(STATE_ONLY_WORKFLOW).unwrap();
        let engine = Engine::new(EngineConfig::in_memory());
        assert!(engine.restore_run(workflow, "never-ran", None).is_err());
    }

    // Property 6 / scenario S7: `Engine::execute_workflow_with_run_id` with a
    // `resume_snapshot_id` must apply both the snapshot's state AND its step
    // cursor, so step1 (already completed at snapshot time) is restored as
    // `Completed` rather than re-executed as `Pending`. The lower-level
    // no-replay guarantee (a step's handler is never invoked twice) is
    // covered by `executor::tests::resuming_from_snapshot_skips_steps_before_the_cursor`.
    #[tokio::test]
    async fn resuming_from_a_snapshot_restores_cursor_and_completed_steps() {
        let workflow_yaml = r#"
version: "1.0"
workflow:
  state:
    counter: 0
  steps:
    - id: step1
      action: update_state
      updates:
        counter: 1
    - id: step2
      action: update_state
      updates:
        counter: 2
    - id: step3
      action: update_state
      updates:
        counter: 3
  outputs:
    counter: "{{ state.counter }}"
"#;
        let store = Arc::new(MemoryStateStore::new(10));
        let engine = Engine::new(EngineConfig::in_memory().with_state_store(store.clone()));
        let partial_workflow: Workflow = serde_yaml::from_str(workflow_yaml).unwrap();

        // Snapshot as if a crash happened right after step1 completed.
        let snapshot = StateSnapshot {
            id: StateSnapshot::new_id(),
            run_id: "resume-counter".to_string(),
            timestamp: chrono::Utc::now(),
            step_index: 1,
            step_id: "step1".to_string(),
            state: Value::Map(vec![("counter".to_string(), Value::Int(1))].into_iter().collect()),
            metadata: Value::Map(Default::default()),
        };
        store.save_snapshot(&snapshot).unwrap();

        let resumed = engine
            .execute_workflow_with_run_id(
                partial_workflow,
                HashMap::new(),
                Some("resume-counter".to_string()),
                Some(snapshot.id.clone()),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(resumed.step_results["step1"].status, StepStatus::Completed);
        assert_eq!(resumed.step_results["step2"].status, StepStatus::Completed);
        assert_eq!(resumed.step_results["step3"].status, StepStatus::Completed);
        assert_eq!(resumed.outputs["counter"], serde_json::json!("3"));
    }
}
