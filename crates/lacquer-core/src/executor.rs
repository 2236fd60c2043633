// Copyright (c) 2025 Lacquer Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The step scheduler: iterates a workflow's steps strictly in declared
//! order, evaluating `condition`/`skip_if`, dispatching by step kind,
//! applying retry/timeout, running `on_error` handlers on final failure, and
//! emitting snapshots at step boundaries.

use crate::cancellation::CancellationToken;
use crate::context::{ExecutionContext, StepResult, StepStatus};
use crate::error::{OrchestratorError, Result};
use crate::output::parse_output;
use crate::providers::{
    LLMProvider, Message, ModelRequest, RuntimeProvider, SubWorkflowLoader, ToolExecContext, ToolProvider, TokenUsage,
};
use crate::schema::prompt_instructions;
use crate::state::{StateSnapshot, StateStore};
use crate::value::Value;
use crate::workflow::{AgentConfig, ErrorHandler, ScriptSpec, Step, StepKind, Workflow};
use serde_json::Value as Json;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Overall run status, exposed on `ExecutionSummary`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// Result handed back to the caller once a run reaches a terminal state.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ExecutionSummary {
    pub run_id: String,
    pub status: RunStatus,
    pub step_results: HashMap<String, StepResult>,
    pub token_usage: TokenUsage,
    pub inputs: HashMap<String, Json>,
    pub outputs: HashMap<String, Json>,
    pub start_time: chrono::DateTime<chrono::Utc>,
    pub end_time: Option<chrono::DateTime<chrono::Utc>>,
}

/// Collaborators the executor consults but does not own the lifecycle of.
/// Constructed once by the engine entry point (`Engine::execute_workflow`)
/// and shared across an execution.
pub struct Collaborators {
    pub llm_providers: HashMap<String, Arc<dyn LLMProvider>>,
    pub tool_providers: HashMap<String, Arc<dyn ToolProvider>>,
    pub runtime_providers: HashMap<String, Arc<dyn RuntimeProvider>>,
    pub workflow_loader: Arc<dyn SubWorkflowLoader>,
    pub state_store: Arc<dyn StateStore>,
    pub snapshot_interval: Option<usize>,
    pub max_snapshots: usize,
}

/// Outcome of driving one step through condition-gating, dispatch, and
/// (on failure) `on_error` handling.
enum StepOutcome {
    Advance,
    JumpTo(String),
    Return(HashMap<String, Value>),
    Fatal(OrchestratorError),
    Cancelled,
}

/// What a kind handler returns before the parser and state-merge step.
struct HandlerOutput {
    response: Option<String>,
    raw_outputs: HashMap<String, Value>,
    token_usage: TokenUsage,
}

impl HandlerOutput {
    fn empty() -> Self {
        Self { response: None, raw_outputs: HashMap::new(), token_usage: TokenUsage::default() }
    }
}

pub struct Executor {
    pub context: ExecutionContext,
    collaborators: Collaborators,
    cancel: CancellationToken,
    resume_snapshot: Option<StateSnapshot>,
}

impl Executor {
    pub fn new(context: ExecutionContext, collaborators: Collaborators, cancel: CancellationToken) -> Self {
        Self { context, collaborators, cancel, resume_snapshot: None }
    }

    /// Resumes from a specific snapshot rather than whatever is latest in the
    /// state store: the snapshot's state AND step cursor are applied once
    /// `run` starts, and every step before the cursor is marked `Completed`
    /// so it is not re-executed.
    pub fn with_resume_snapshot(mut self, snapshot: StateSnapshot) -> Self {
        self.resume_snapshot = Some(snapshot);
        self
    }

    /// Runs every step in declared order. Termination: normal when the
    /// cursor reaches `total_steps`; early on cancellation or an unhandled
    /// fatal step failure.
    pub async fn run(mut self) -> Result<ExecutionSummary> {
        if let Some(snapshot) = self.resume_snapshot.take() {
            self.context.replace_state(snapshot.state);
            let resume_at = snapshot.step_index.min(self.context.steps.len());
            for step in self.context.steps[..resume_at].to_vec() {
                self.context.set_step_result(
                    &step.id,
                    StepResult { status: StepStatus::Completed, ..StepResult::pending(&step.id) },
                );
            }
            self.context.set_cursor(resume_at);
        } else if let Some(persisted) = self.collaborators.state_store.get(&self.context.run_id)? {
            self.context.replace_state(persisted);
        }

        info!(run_id = %self.context.run_id, total_steps = self.context.total_steps(), "starting workflow execution");

        let total = self.context.total_steps();
        let mut status = RunStatus::Running;
        let mut terminal_outputs: Option<HashMap<String, Value>> = None;

        loop {
            let idx = self.context.current_step_index();
            if idx >= total {
                break;
            }
            if self.cancel.is_cancelled() {
                status = RunStatus::Cancelled;
                break;
            }

            let step = self.context.steps[idx].clone();
            match self.execute_step(&step).await {
                StepOutcome::Advance => {
                    self.context.advance_cursor();
                }
                StepOutcome::JumpTo(target_id) => {
                    let Some(target_idx) = self.context.step_index_for(&target_id) else {
                        status = RunStatus::Failed;
                        break;
                    };
                    for skip_idx in (idx + 1)..target_idx {
                        let skipped = &self.context.steps[skip_idx];
                        self.context.set_step_result(&skipped.id, StepResult { status: StepStatus::Skipped, ..StepResult::pending(&skipped.id) });
                    }
                    self.context.set_cursor(target_idx);
                }
                StepOutcome::Return(outputs) => {
                    terminal_outputs = Some(outputs);
                    status = RunStatus::Failed;
                    break;
                }
                StepOutcome::Fatal(err) => {
                    warn!(run_id = %self.context.run_id, step_id = %step.id, error = %err, "step failed with no recovering handler");
                    status = RunStatus::Failed;
                    break;
                }
                StepOutcome::Cancelled => {
                    status = RunStatus::Cancelled;
                    break;
                }
            }

            self.maybe_snapshot(idx);
        }

        if status == RunStatus::Running {
            status = RunStatus::Completed;
        }
        self.context.mark_completed_now();

        self.persist_state(status)?;

        let outputs = terminal_outputs
            .map(|o| o.into_iter().map(|(k, v)| (k, v.to_json())).collect())
            .unwrap_or_else(|| self.evaluate_workflow_outputs());

        Ok(ExecutionSummary {
            run_id: self.context.run_id.clone(),
            status,
            step_results: self.context.all_step_results(),
            token_usage: self.context.total_token_usage(),
            inputs: self.context.get_input_map().to_json().as_object().cloned().unwrap_or_default().into_iter().collect(),
            outputs,
            start_time: self.context.start_time,
            end_time: self.context.completed_at(),
        })
    }

    fn evaluate_workflow_outputs(&self) -> HashMap<String, Json> {
        self.context
            .workflow
            .workflow
            .outputs
            .iter()
            .map(|(name, template)| {
                let rendered = self
                    .context
                    .render_template(template)
                    .unwrap_or_else(|e| format!("<error: {}>", e));
                (name.clone(), Json::String(rendered))
            })
            .collect()
    }

    fn persist_state(&self, status: RunStatus) -> Result<()> {
        match self.collaborators.state_store.set(&self.context.run_id, &self.context.get_state_map()) {
            Ok(()) => Ok(()),
            Err(e) if status != RunStatus::Completed => {
                warn!(run_id = %self.context.run_id, error = %e, "failed to persist final state");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn maybe_snapshot(&self, just_completed_idx: usize) {
        let Some(interval) = self.collaborators.snapshot_interval else { return };
        if interval == 0 || (just_completed_idx + 1) % interval != 0 {
            return;
        }
        let step_id = self.context.steps[just_completed_idx].id.clone();
        let snapshot = StateSnapshot {
            id: StateSnapshot::new_id(),
            run_id: self.context.run_id.clone(),
            timestamp: chrono::Utc::now(),
            step_index: just_completed_idx + 1,
            step_id,
            state: self.context.get_state_map(),
            metadata: self.context.get_metadata_map(),
        };
        if let Err(e) = self.collaborators.state_store.save_snapshot(&snapshot) {
            warn!(run_id = %self.context.run_id, error = %e, "failed to save snapshot");
        }
    }

    async fn execute_step(&self, step: &Step) -> StepOutcome {
        if let Some(skip_if) = &step.skip_if {
            match self.context.evaluate_condition(skip_if) {
                Ok(true) => {
                    self.record_skipped(step);
                    return StepOutcome::Advance;
                }
                Ok(false) => {}
                Err(e) => return self.handle_failure(step, e, 0).await,
            }
        }
        if let Some(condition) = &step.condition {
            match self.context.evaluate_condition(condition) {
                Ok(false) => {
                    self.record_skipped(step);
                    return StepOutcome::Advance;
                }
                Ok(true) => {}
                Err(e) => return self.handle_failure(step, e, 0).await,
            }
        }

        self.context.set_step_result(
            &step.id,
            StepResult { status: StepStatus::Running, start_time: Some(chrono::Utc::now()), ..StepResult::pending(&step.id) },
        );

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            if self.cancel.is_cancelled() {
                self.record_cancelled(step, attempt);
                return StepOutcome::Cancelled;
            }

            let started = Instant::now();
            let attempt_result = self.dispatch_attempt(step).await;

            match attempt_result {
                Ok(handler_output) => {
                    self.record_success(step, handler_output, attempt, started.elapsed());
                    return StepOutcome::Advance;
                }
                Err(err) => {
                    if attempt >= step.retry.max_attempts || !err.is_retryable() {
                        return self.handle_failure(step, err, attempt).await;
                    }
                    let delay = step.retry.delay_for_attempt(attempt);
                    debug!(step_id = %step.id, attempt, delay_ms = delay.as_millis(), error = %err, "retrying step after back-off");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.cancel.cancelled() => {
                            self.record_cancelled(step, attempt);
                            return StepOutcome::Cancelled;
                        }
                    }
                }
            }
        }
    }

    async fn dispatch_attempt(&self, step: &Step) -> Result<HandlerOutput> {
        let operation = self.dispatch_kind(step);
        match step.timeout {
            Some(duration) => match tokio::time::timeout(duration, operation).await {
                Ok(result) => result,
                Err(_) => Err(OrchestratorError::Timeout { duration }),
            },
            None => operation.await,
        }
    }

    async fn dispatch_kind(&self, step: &Step) -> Result<HandlerOutput> {
        match &step.kind {
            StepKind::Action { action } => self.execute_action(step, action).await,
            StepKind::Agent { agent } => self.execute_agent(step, agent).await,
            StepKind::Sub { workflow_path } => self.execute_sub_workflow(step, workflow_path).await,
            StepKind::Run { command } => self.execute_run(step, command).await,
            StepKind::Script { script } => self.execute_script(step, script).await,
            StepKind::Container { image } => Err(OrchestratorError::ToolExecutionError(format!(
                "container step '{}' requires an external container runtime provider (image '{}')",
                step.id, image
            ))),
        }
    }

    async fn execute_action(&self, step: &Step, action: &str) -> Result<HandlerOutput> {
        if action == "update_state" {
            let mut updates = serde_json::Map::new();
            for (key, template) in &step.updates {
                let rendered = self.render_json_value(template)?;
                updates.insert(key.clone(), rendered);
            }
            self.context.merge_state(&Value::from_json(&Json::Object(updates)));
            return Ok(HandlerOutput::empty());
        }

        let Some(tool) = self.collaborators.tool_providers.get(action) else {
            return Err(OrchestratorError::ToolExecutionError(format!(
                "no tool provider registered for action '{}'",
                action
            )));
        };

        let mut params = HashMap::new();
        for (key, template) in &step.with {
            params.insert(key.clone(), self.render_json_value(template)?);
        }

        let exec_ctx = ToolExecContext { run_id: self.context.run_id.clone(), step_id: step.id.clone() };
        let result = tool.execute_tool(action, params, &exec_ctx).await?;

        if !result.success {
            return Err(OrchestratorError::ToolExecutionError(
                result.error.unwrap_or_else(|| format!("tool '{}' reported failure", action)),
            ));
        }

        let raw_outputs = result.output.iter().map(|(k, v)| (k.clone(), Value::from_json(v))).collect();
        Ok(HandlerOutput { response: None, raw_outputs, token_usage: TokenUsage::default() })
    }

    async fn execute_agent(&self, step: &Step, agent_name: &str) -> Result<HandlerOutput> {
        let agent_config = self
            .context
            .workflow
            .agents
            .get(agent_name)
            .ok_or_else(|| OrchestratorError::InvalidStepConfig {
                step_id: step.id.clone(),
                reason: format!("no agent named '{}' declared", agent_name),
            })?
            .clone();

        let provider = self.collaborators.llm_providers.get(&agent_config.provider).ok_or_else(|| {
            OrchestratorError::ProviderError {
                message: format!("no provider registered for '{}'", agent_config.provider),
                retryable: false,
            }
        })?;

        let mut prompt = match &step.prompt {
            Some(p) => self.context.render_template(p)?,
            None => String::new(),
        };
        if !step.outputs.is_empty() {
            prompt = format!("{}\n\n{}", prompt, prompt_instructions(&step.outputs));
        }

        let request = build_model_request(&agent_config, prompt);
        let response = provider.generate(request).await?;

        let text = response.text();
        let parsed = parse_output(&step.outputs, &text);

        Ok(HandlerOutput { response: Some(text), raw_outputs: parsed, token_usage: response.usage })
    }

    async fn execute_sub_workflow(&self, step: &Step, workflow_path: &str) -> Result<HandlerOutput> {
        let sub_workflow: Workflow =
            self.collaborators.workflow_loader.load(workflow_path).map_err(OrchestratorError::from)?;

        let mut child_inputs = HashMap::new();
        for (key, template) in &step.with {
            child_inputs.insert(key.clone(), self.render_json_value(template)?);
        }

        let child_context = ExecutionContext::new(sub_workflow, child_inputs, None)?;
        let child_cancel = self.cancel.clone();
        let child_collaborators = Collaborators {
            llm_providers: self.collaborators.llm_providers.clone(),
            tool_providers: self.collaborators.tool_providers.clone(),
            runtime_providers: self.collaborators.runtime_providers.clone(),
            workflow_loader: self.collaborators.workflow_loader.clone(),
            state_store: self.collaborators.state_store.clone(),
            snapshot_interval: self.collaborators.snapshot_interval,
            max_snapshots: self.collaborators.max_snapshots,
        };
        let child_executor = Executor::new(child_context, child_collaborators, child_cancel);
        let summary = Box::pin(child_executor.run()).await?;

        let raw_outputs = summary.outputs.iter().map(|(k, v)| (k.clone(), Value::from_json(v))).collect();
        Ok(HandlerOutput { response: None, raw_outputs, token_usage: summary.token_usage })
    }

    async fn execute_run(&self, step: &Step, command: &str) -> Result<HandlerOutput> {
        let rendered = self.context.render_template(command)?;
        run_shell_command(&rendered).await
    }

    async fn execute_script(&self, step: &Step, script: &ScriptSpec) -> Result<HandlerOutput> {
        let (body, interpreter) = match script {
            ScriptSpec::Inline(code) => (self.context.render_template(code)?, None),
            ScriptSpec::File { file, interpreter } => {
                let text = std::fs::read_to_string(file).map_err(|e| {
                    OrchestratorError::InvalidStepConfig { step_id: step.id.clone(), reason: format!("reading script file '{}': {}", file, e) }
                })?;
                (self.context.render_template(&text)?, interpreter.clone())
            }
        };

        match interpreter {
            Some(interp) => run_interpreted_script(&interp, &body).await,
            None => run_shell_command(&body).await,
        }
    }

    fn render_json_value(&self, value: &Json) -> Result<Json> {
        crate::template::render_json(value, &self.context)
    }

    fn record_skipped(&self, step: &Step) {
        self.context.set_step_result(
            &step.id,
            StepResult {
                status: StepStatus::Skipped,
                start_time: Some(chrono::Utc::now()),
                end_time: Some(chrono::Utc::now()),
                ..StepResult::pending(&step.id)
            },
        );
    }

    fn record_cancelled(&self, step: &Step, attempt: u32) {
        let now = chrono::Utc::now();
        self.context.set_step_result(
            &step.id,
            StepResult {
                status: StepStatus::Failed,
                start_time: Some(now),
                end_time: Some(now),
                error: Some(OrchestratorError::Cancelled.to_string()),
                attempts: attempt,
                ..StepResult::pending(&step.id)
            },
        );
    }

    fn record_success(&self, step: &Step, handler_output: HandlerOutput, attempt: u32, elapsed: Duration) {
        let now = chrono::Utc::now();
        self.context.set_step_result(
            &step.id,
            StepResult {
                step_id: step.id.clone(),
                status: StepStatus::Completed,
                start_time: Some(now - chrono::Duration::from_std(elapsed).unwrap_or_else(|_| chrono::Duration::zero())),
                end_time: Some(now),
                duration: elapsed,
                response: handler_output.response,
                outputs: handler_output.raw_outputs,
                error: None,
                attempts: attempt,
                token_usage: handler_output.token_usage,
            },
        );
    }

    fn record_failed(&self, step: &Step, err: &OrchestratorError, attempt: u32) {
        let now = chrono::Utc::now();
        self.context.set_step_result(
            &step.id,
            StepResult {
                status: StepStatus::Failed,
                start_time: Some(now),
                end_time: Some(now),
                error: Some(err.to_string()),
                attempts: attempt,
                ..StepResult::pending(&step.id)
            },
        );
    }

    async fn handle_failure(&self, step: &Step, err: OrchestratorError, attempt: u32) -> StepOutcome {
        for handler in &step.on_error {
            match handler {
                ErrorHandler::Log(message) => {
                    let rendered = self.context.render_template(message).unwrap_or_else(|_| message.clone());
                    warn!(step_id = %step.id, "{}", rendered);
                }
                ErrorHandler::Fallback(target) => {
                    self.record_failed(step, &err, attempt);
                    return StepOutcome::JumpTo(target.clone());
                }
                ErrorHandler::Output(map) => {
                    let mut outputs = HashMap::new();
                    for (k, v) in map {
                        match self.render_json_value(v) {
                            Ok(rendered) => {
                                outputs.insert(k.clone(), Value::from_json(&rendered));
                            }
                            Err(e) => return StepOutcome::Fatal(e),
                        }
                    }
                    self.context.set_step_result(
                        &step.id,
                        StepResult {
                            step_id: step.id.clone(),
                            status: StepStatus::Completed,
                            start_time: Some(chrono::Utc::now()),
                            end_time: Some(chrono::Utc::now()),
                            duration: Duration::ZERO,
                            response: None,
                            outputs,
                            error: None,
                            attempts: attempt,
                            token_usage: TokenUsage::default(),
                        },
                    );
                    return StepOutcome::Advance;
                }
                ErrorHandler::Return(map) => {
                    let mut outputs = HashMap::new();
                    for (k, v) in map {
                        match self.render_json_value(v) {
                            Ok(rendered) => {
                                outputs.insert(k.clone(), Value::from_json(&rendered));
                            }
                            Err(e) => return StepOutcome::Fatal(e),
                        }
                    }
                    self.record_failed(step, &err, attempt);
                    return StepOutcome::Return(outputs);
                }
            }
        }
        self.record_failed(step, &err, attempt);
        StepOutcome::Fatal(err)
    }
}

fn build_model_request(agent_config: &AgentConfig, prompt: String) -> ModelRequest {
    ModelRequest {
        model: agent_config.model.clone(),
        messages: vec![Message { role: "user".to_string(), content: prompt }],
        system: agent_config.system_prompt.clone(),
        temperature: agent_config.temperature,
        top_p: agent_config.top_p,
        max_tokens: agent_config.max_tokens,
        stop: Vec::new(),
        request_id: Uuid::new_v4().to_string(),
    }
}

async fn run_shell_command(command: &str) -> Result<HandlerOutput> {
    run_interpreted_script("sh -c", command).await
}

async fn run_interpreted_script(interpreter: &str, body: &str) -> Result<HandlerOutput> {
    let mut parts = interpreter.split_whitespace();
    let program = parts.next().unwrap_or("sh");
    let mut cmd = Command::new(program);
    cmd.args(parts);
    cmd.arg(body);
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

    let output = cmd
        .output()
        .await
        .map_err(|e| OrchestratorError::ToolExecutionError(format!("failed to spawn '{}': {}", interpreter, e)))?;

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

    if !output.status.success() {
        return Err(OrchestratorError::ToolExecutionError(format!(
            "command exited with {}: {}",
            output.status, stderr
        )));
    }

    let mut raw_outputs = HashMap::new();
    raw_outputs.insert("stdout".to_string(), Value::string(stdout.clone()));
    raw_outputs.insert("stderr".to_string(), Value::string(stderr));

    Ok(HandlerOutput { response: Some(stdout), raw_outputs, token_usage: TokenUsage::default() })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{ModelResponse, ProviderError};
    use crate::state::MemoryStateStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Replies from a fixed, ordered script; panics if asked for more than
    /// were scripted. Counts calls so retry tests can assert invocation
    /// counts exactly.
    struct ScriptedProvider {
        replies: Mutex<std::collections::VecDeque<std::result::Result<&'static str, ProviderError>>>,
        calls: AtomicU32,
    }

    impl ScriptedProvider {
        fn new(replies: Vec<std::result::Result<&'static str, ProviderError>>) -> Self {
            Self { replies: Mutex::new(replies.into()), calls: AtomicU32::new(0) }
        }

        fn call_count(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl LLMProvider for ScriptedProvider {
        async fn generate(&self, _request: ModelRequest) -> std::result::Result<ModelResponse, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self.replies.lock().unwrap().pop_front().expect("scripted provider ran out of replies");
            next.map(|text| ModelResponse {
                blocks: vec![crate::providers::ContentBlock::Text { text: text.to_string() }],
                usage: TokenUsage { prompt_tokens: 10, completion_tokens: 5, total_tokens: 15, estimated_cost_usd: 0.0 },
            })
        }

        fn get_name(&self) -> &str {
            "scripted"
        }

        fn supported_models(&self) -> Vec<String> {
            vec!["scripted-model".to_string()]
        }
    }

    fn collaborators_with(provider: Arc<dyn LLMProvider>) -> Collaborators {
        let mut llm_providers = HashMap::new();
        llm_providers.insert("scripted".to_string(), provider);
        Collaborators {
            llm_providers,
            tool_providers: HashMap::new(),
            runtime_providers: HashMap::new(),
            workflow_loader: Arc::new(crate::providers::FsWorkflowLoader { base_dir: ".".into() }),
            state_store: Arc::new(MemoryStateStore::new(10)),
            snapshot_interval: None,
            max_snapshots: 10,
        }
    }

    fn build_executor(yaml: &str, collaborators: Collaborators) -> Executor {
        let workflow: Workflow = serde_yaml::from_str(yaml).unwrap();
        let context = ExecutionContext::new(workflow, HashMap::new(), None).unwrap();
        Executor::new(context, collaborators, CancellationToken::new())
    }

    // S1: a linear agent step feeding an update_state step via `steps.*.output`.
    #[tokio::test]
    async fn linear_agent_then_update_state_carries_output_into_state() {
        let yaml = r#"
version: "1.0"
agents:
  greeter:
    provider: scripted
    model: scripted-model
workflow:
  steps:
    - id: step1
      agent: greeter
      prompt: "Say hello"
    - id: step2
      action: update_state
      updates:
        greeted: "{{ steps.step1.output }}"
  outputs:
    greeted: "{{ state.greeted }}"
"#;
        let provider = Arc::new(ScriptedProvider::new(vec![Ok("Hello, world!")]));
        let executor = build_executor(yaml, collaborators_with(provider));
        let summary = executor.run().await.unwrap();

        assert_eq!(summary.status, RunStatus::Completed);
        assert_eq!(summary.outputs.get("greeted").and_then(|v| v.as_str()), Some("Hello, world!"));
        assert!(summary.token_usage.total_tokens > 0);
        assert_eq!(summary.step_results["step1"].status, StepStatus::Completed);
        assert_eq!(summary.step_results["step2"].status, StepStatus::Completed);
    }

    // S2: `skip_if` true skips without invoking the provider, and still counts
    // toward the cursor.
    #[tokio::test]
    async fn skip_if_true_skips_step_without_calling_provider() {
        let yaml = r#"
version: "1.0"
agents:
  greeter:
    provider: scripted
    model: scripted-model
workflow:
  inputs:
    skip: boolean
  steps:
    - id: step1
      agent: greeter
      prompt: "Say hello"
      skip_if: "inputs.skip == true"
"#;
        let provider = Arc::new(ScriptedProvider::new(vec![]));
        let workflow: Workflow = serde_yaml::from_str(yaml).unwrap();
        let mut inputs = HashMap::new();
        inputs.insert("skip".to_string(), Json::Bool(true));
        let context = ExecutionContext::new(workflow, inputs, None).unwrap();
        let executor = Executor::new(context, collaborators_with(provider.clone()), CancellationToken::new());
        let summary = executor.run().await.unwrap();

        assert_eq!(summary.status, RunStatus::Completed);
        assert_eq!(summary.step_results["step1"].status, StepStatus::Skipped);
        assert_eq!(provider.call_count(), 0);
    }

    // S3: retries on a retryable error, succeeding on the third attempt.
    #[tokio::test]
    async fn retries_retryable_error_until_success() {
        let yaml = r#"
version: "1.0"
agents:
  greeter:
    provider: scripted
    model: scripted-model
workflow:
  steps:
    - id: step1
      agent: greeter
      prompt: "go"
      retry:
        max_attempts: 3
        backoff: linear
        initial_delay: 10ms
"#;
        let provider = Arc::new(ScriptedProvider::new(vec![
            Err(ProviderError::HttpError("503".to_string())),
            Err(ProviderError::HttpError("503".to_string())),
            Ok("ok"),
        ]));
        let executor = build_executor(yaml, collaborators_with(provider.clone()));
        let started = Instant::now();
        let summary = executor.run().await.unwrap();

        assert_eq!(provider.call_count(), 3);
        assert_eq!(summary.step_results["step1"].status, StepStatus::Completed);
        assert_eq!(summary.step_results["step1"].response.as_deref(), Some("ok"));
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    // Retry monotonicity (property 4): max_attempts invocations exactly, for
    // a step that never succeeds.
    #[tokio::test]
    async fn exhausts_max_attempts_then_fails() {
        let yaml = r#"
version: "1.0"
agents:
  greeter:
    provider: scripted
    model: scripted-model
workflow:
  steps:
    - id: step1
      agent: greeter
      prompt: "go"
      retry:
        max_attempts: 3
        backoff: linear
        initial_delay: 5ms
"#;
        let provider = Arc::new(ScriptedProvider::new(vec![
            Err(ProviderError::HttpError("503".to_string())),
            Err(ProviderError::HttpError("503".to_string())),
            Err(ProviderError::HttpError("503".to_string())),
        ]));
        let executor = build_executor(yaml, collaborators_with(provider.clone()));
        let summary = executor.run().await.unwrap();

        assert_eq!(provider.call_count(), 3);
        assert_eq!(summary.status, RunStatus::Failed);
        assert_eq!(summary.step_results["step1"].status, StepStatus::Failed);
    }

    // A non-retryable provider error (auth failure, invalid request) must
    // not be retried even when `max_attempts` would otherwise allow it.
    #[tokio::test]
    async fn auth_error_is_not_retried_even_with_attempts_remaining() {
        let yaml = r#"
version: "1.0"
agents:
  greeter:
    provider: scripted
    model: scripted-model
workflow:
  steps:
    - id: step1
      agent: greeter
      prompt: "go"
      retry:
        max_attempts: 3
        backoff: linear
        initial_delay: 5ms
"#;
        let provider = Arc::new(ScriptedProvider::new(vec![Err(ProviderError::AuthError("nope".to_string()))]));
        let executor = build_executor(yaml, collaborators_with(provider.clone()));
        let summary = executor.run().await.unwrap();

        assert_eq!(provider.call_count(), 1);
        assert_eq!(summary.status, RunStatus::Failed);
        assert_eq!(summary.step_results["step1"].status, StepStatus::Failed);
    }

    // S7: resuming from a snapshot must not replay steps before the cursor.
    // The provider is scripted with exactly one reply — as many as the steps
    // *after* the resume point — so a re-invocation of the completed step1
    // would panic on "ran out of replies" rather than merely fail quietly.
    #[tokio::test]
    async fn resuming_from_snapshot_skips_steps_before_the_cursor() {
        let yaml = r#"
version: "1.0"
agents:
  greeter:
    provider: scripted
    model: scripted-model
workflow:
  steps:
    - id: step1
      agent: greeter
      prompt: "go"
    - id: step2
      agent: greeter
      prompt: "go again"
"#;
        let provider = Arc::new(ScriptedProvider::new(vec![Ok("second")]));
        let workflow: Workflow = serde_yaml::from_str(yaml).unwrap();
        let context = ExecutionContext::new(workflow, HashMap::new(), None).unwrap();
        let snapshot = StateSnapshot {
            id: StateSnapshot::new_id(),
            run_id: context.run_id.clone(),
            timestamp: chrono::Utc::now(),
            step_index: 1,
            step_id: "step1".to_string(),
            state: context.get_state_map(),
            metadata: context.get_metadata_map(),
        };
        let executor =
            Executor::new(context, collaborators_with(provider.clone()), CancellationToken::new())
                .with_resume_snapshot(snapshot);
        let summary = executor.run().await.unwrap();

        assert_eq!(provider.call_count(), 1);
        assert_eq!(summary.step_results["step1"].status, StepStatus::Completed);
        assert_eq!(summary.step_results["step2"].status, StepStatus::Completed);
    }

    // S6: a failing step with a `fallback` handler jumps past the next step,
    // which is recorded `Skipped`, never `Running`.
    #[tokio::test]
    async fn fallback_handler_jumps_and_skips_intervening_step() {
        let yaml = r#"
version: "1.0"
agents:
  greeter:
    provider: scripted
    model: scripted-model
workflow:
  steps:
    - id: step1
      agent: greeter
      prompt: "go"
      on_error:
        - fallback: step3
    - id: step2
      agent: greeter
      prompt: "never reached"
    - id: step3
      action: update_state
      updates:
        done: true
"#;
        let provider = Arc::new(ScriptedProvider::new(vec![Err(ProviderError::AuthError("nope".to_string()))]));
        let executor = build_executor(yaml, collaborators_with(provider.clone()));
        let summary = executor.run().await.unwrap();

        assert_eq!(provider.call_count(), 1);
        assert_eq!(summary.step_results["step1"].status, StepStatus::Failed);
        assert_eq!(summary.step_results["step2"].status, StepStatus::Skipped);
        assert_eq!(summary.step_results["step3"].status, StepStatus::Completed);
        assert_eq!(summary.status, RunStatus::Completed);
    }

    // Cancellation: cancelling between attempts stops the run within one
    // back-off interval, with no further handler invocations.
    #[tokio::test]
    async fn cancellation_between_attempts_stops_the_run() {
        let yaml = r#"
version: "1.0"
agents:
  greeter:
    provider: scripted
    model: scripted-model
workflow:
  steps:
    - id: step1
      agent: greeter
      prompt: "go"
      retry:
        max_attempts: 5
        backoff: linear
        initial_delay: 200ms
"#;
        let provider = Arc::new(ScriptedProvider::new(vec![
            Err(ProviderError::HttpError("503".to_string())),
            Err(ProviderError::HttpError("503".to_string())),
            Err(ProviderError::HttpError("503".to_string())),
            Err(ProviderError::HttpError("503".to_string())),
            Err(ProviderError::HttpError("503".to_string())),
        ]));
        let workflow: Workflow = serde_yaml::from_str(yaml).unwrap();
        let context = ExecutionContext::new(workflow, HashMap::new(), None).unwrap();
        let cancel = CancellationToken::new();
        let executor = Executor::new(context, collaborators_with(provider.clone()), cancel.clone());

        let handle = tokio::spawn(async move { executor.run().await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        let summary = handle.await.unwrap().unwrap();

        assert_eq!(summary.status, RunStatus::Cancelled);
        assert!(provider.call_count() <= 2, "expected cancellation to cut the retry loop short, got {} calls", provider.call_count());
    }
}
