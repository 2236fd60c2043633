// Copyright (c) 2025 Lacquer Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-run execution context: the aggregate of workflow AST, inputs, mutable
//! state, step-result table, metadata, environment, cursor, and run
//! identifier that every step handler reads and writes through.

use crate::error::{OrchestratorError, Result};
use crate::expr::evaluate_expr;
use crate::providers::TokenUsage;
use crate::template::render_template;
use crate::value::Value;
use crate::workflow::{Step, Workflow};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Lifecycle status of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, StepStatus::Completed | StepStatus::Skipped)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, StepStatus::Failed)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped)
    }
}

/// Outcome of executing (or skipping) a single step. Terminal statuses are
/// write-once: once a step lands on `Completed`/`Failed`/`Skipped` the
/// executor never mutates that entry again.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: String,
    pub status: StepStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    #[serde(with = "duration_millis")]
    pub duration: Duration,
    pub response: Option<String>,
    pub outputs: HashMap<String, Value>,
    pub error: Option<String>,
    pub attempts: u32,
    pub token_usage: TokenUsage,
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}

impl StepResult {
    pub fn pending(step_id: &str) -> Self {
        Self {
            step_id: step_id.to_string(),
            status: StepStatus::Pending,
            start_time: None,
            end_time: None,
            duration: Duration::ZERO,
            response: None,
            outputs: HashMap::new(),
            error: None,
            attempts: 0,
            token_usage: TokenUsage::default(),
        }
    }

    pub fn duration_human(&self) -> String {
        let ms = self.duration.as_millis();
        if ms >= 1000 {
            format!("{:.2}s", self.duration.as_secs_f64())
        } else {
            format!("{}ms", ms)
        }
    }
}

/// A pluggable environment-variable accessor, threaded through the engine
/// config instead of a package-level global, so callers (and tests) can swap
/// it without process-wide side effects.
pub type EnvLookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

fn default_env_lookup() -> EnvLookup {
    Arc::new(|name: &str| std::env::var(name).ok())
}

/// Per-run execution context. Exclusively owns its state map and
/// step-results table; step handlers receive a reference and must not retain
/// it past handler return.
pub struct ExecutionContext {
    pub run_id: String,
    pub workflow: Workflow,
    pub steps: Vec<Step>,
    inputs: RwLock<Value>,
    state: RwLock<Value>,
    metadata: RwLock<Value>,
    env_lookup: EnvLookup,
    step_results: DashMap<String, StepResult>,
    step_index_of: HashMap<String, usize>,
    current_step: AtomicUsize,
    pub start_time: DateTime<Utc>,
    end_time: RwLock<Option<DateTime<Utc>>>,
    total_usage: RwLock<TokenUsage>,
}

impl ExecutionContext {
    pub fn new(workflow: Workflow, inputs: HashMap<String, Json>, run_id: Option<String>) -> Result<Self> {
        workflow.validate()?;
        let steps = workflow.resolve_steps()?;

        let mut input_map = HashMap::new();
        for (name, decl) in &workflow.workflow.inputs {
            let provided = inputs.get(name).cloned();
            let value = match provided {
                Some(v) => v,
                None => match decl.default_value() {
                    Some(v) => v.clone(),
                    None => {
                        if decl.required() {
                            return Err(OrchestratorError::InvalidWorkflow(format!(
                                "missing required input '{}'",
                                name
                            )));
                        }
                        Json::Null
                    }
                },
            };
            input_map.insert(name.clone(), Value::from_json(&value));
        }
        // Inputs not declared in the workflow but supplied by the caller are
        // still made available — declarations constrain requiredness, not
        // visibility.
        for (name, value) in &inputs {
            input_map.entry(name.clone()).or_insert_with(|| Value::from_json(value));
        }

        let state_map: HashMap<String, Value> = workflow
            .workflow
            .state
            .iter()
            .map(|(k, v)| (k.clone(), Value::from_json(v)))
            .collect();

        let metadata_map: HashMap<String, Value> = workflow
            .metadata
            .as_ref()
            .map(|m| {
                let mut map = HashMap::new();
                if let Some(name) = &m.name {
                    map.insert("name".to_string(), Value::string(name.clone()));
                }
                if let Some(desc) = &m.description {
                    map.insert("description".to_string(), Value::string(desc.clone()));
                }
                if let Some(author) = &m.author {
                    map.insert("author".to_string(), Value::string(author.clone()));
                }
                map.insert(
                    "tags".to_string(),
                    Value::Sequence(m.tags.iter().map(|t| Value::string(t.clone())).collect()),
                );
                map
            })
            .unwrap_or_default();

        let step_index_of = steps.iter().enumerate().map(|(i, s)| (s.id.clone(), i)).collect();

        let step_results = DashMap::new();
        for step in &steps {
            step_results.insert(step.id.clone(), StepResult::pending(&step.id));
        }

        Ok(Self {
            run_id: run_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            workflow,
            steps,
            inputs: RwLock::new(Value::Map(input_map.into_iter().collect())),
            state: RwLock::new(Value::Map(state_map.into_iter().collect())),
            metadata: RwLock::new(Value::Map(metadata_map.into_iter().collect())),
            env_lookup: default_env_lookup(),
            step_results,
            step_index_of,
            current_step: AtomicUsize::new(0),
            start_time: Utc::now(),
            end_time: RwLock::new(None),
            total_usage: RwLock::new(TokenUsage::default()),
        })
    }

    pub fn with_env_lookup(mut self, lookup: EnvLookup) -> Self {
        self.env_lookup = lookup;
        self
    }

    // -- scope-isolated accessors: reads deep-copy so callers can't alias
    //    the context's stored value (property: "scope isolation"). --

    pub fn get_input(&self, name: &str) -> Option<Value> {
        let inputs = self.inputs.read();
        if let Value::Map(map) = &*inputs {
            map.get(name).map(Value::deep_copy)
        } else {
            None
        }
    }

    pub fn get_input_map(&self) -> Value {
        self.inputs.read().deep_copy()
    }

    pub fn get_state(&self, key: &str) -> Option<Value> {
        let state = self.state.read();
        if let Value::Map(map) = &*state {
            map.get(key).map(Value::deep_copy)
        } else {
            None
        }
    }

    pub fn get_state_map(&self) -> Value {
        self.state.read().deep_copy()
    }

    /// The context's sole state mutator. `update_state` action steps and
    /// snapshot restore both funnel through here so there's a single place
    /// that can never introduce a cycle or alias a caller's value.
    pub fn set_state(&self, key: &str, value: Value) {
        let mut state = self.state.write();
        if let Value::Map(map) = &mut *state {
            map.insert(key.to_string(), value);
        }
    }

    pub fn merge_state(&self, updates: &Value) {
        let mut state = self.state.write();
        *state = state.merge(updates);
    }

    pub fn replace_state(&self, new_state: Value) {
        *self.state.write() = new_state;
    }

    pub fn get_metadata_map(&self) -> Value {
        self.metadata.read().deep_copy()
    }

    pub fn env_lookup(&self, name: &str) -> Option<String> {
        (self.env_lookup)(name)
    }

    pub fn get_step_result(&self, step_id: &str) -> Option<StepResult> {
        self.step_results.get(step_id).map(|r| r.clone())
    }

    pub fn set_step_result(&self, step_id: &str, result: StepResult) {
        self.total_usage.write().clone_from(&self.total_usage.read().merge(&result.token_usage));
        self.step_results.insert(step_id.to_string(), result);
    }

    pub fn all_step_results(&self) -> HashMap<String, StepResult> {
        self.step_results.iter().map(|e| (e.key().clone(), e.value().clone())).collect()
    }

    pub fn current_step_index(&self) -> usize {
        self.current_step.load(Ordering::SeqCst)
    }

    pub fn advance_cursor(&self) {
        self.current_step.fetch_add(1, Ordering::SeqCst);
    }

    pub fn set_cursor(&self, index: usize) {
        self.current_step.store(index, Ordering::SeqCst);
    }

    pub fn step_index_for(&self, step_id: &str) -> Option<usize> {
        self.step_index_of.get(step_id).copied()
    }

    pub fn total_steps(&self) -> usize {
        self.steps.len()
    }

    pub fn mark_completed_now(&self) {
        *self.end_time.write() = Some(Utc::now());
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        *self.end_time.read()
    }

    pub fn total_token_usage(&self) -> TokenUsage {
        *self.total_usage.read()
    }

    pub fn render_template(&self, template: &str) -> Result<String> {
        render_template(template, self)
    }

    pub fn evaluate_expr(&self, expr: &str) -> Result<Value> {
        evaluate_expr(expr, self)
    }

    pub fn evaluate_condition(&self, expr: &str) -> Result<bool> {
        Ok(self.evaluate_expr(expr)?.to_bool())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::Workflow;

    fn build_ctx(yaml: &str, inputs: HashMap<String, Json>) -> ExecutionContext {
        let workflow: Workflow = serde_yaml::from_str(yaml).unwrap();
        ExecutionContext::new(workflow, inputs, None).unwrap()
    }

    const WF: &str = r#"
version: "1.0"
workflow:
  inputs:
    name: string
  state:
    greeted: false
  steps:
    - id: step1
      agent: greeter
      prompt: "hi"
"#;

    #[test]
    fn scope_isolation_mutating_returned_value_does_not_alias_context() {
        let mut inputs = HashMap::new();
        inputs.insert("name".to_string(), Json::String("Ada".to_string()));
        let ctx = build_ctx(WF, inputs);

        let mut value = ctx.get_input("name").unwrap();
        if let Value::String(s) = &mut value {
            s.push_str("-mutated");
        }
        assert_eq!(ctx.get_input("name").unwrap(), Value::String("Ada".to_string()));
    }

    #[test]
    fn missing_required_input_is_rejected() {
        let workflow: Workflow = serde_yaml::from_str(WF).unwrap();
        let err = ExecutionContext::new(workflow, HashMap::new(), None);
        assert!(err.is_err());
    }

    #[test]
    fn step_results_initialize_pending() {
        let mut inputs = HashMap::new();
        inputs.insert("name".to_string(), Json::String("Ada".to_string()));
        let ctx = build_ctx(WF, inputs);
        let result = ctx.get_step_result("step1").unwrap();
        assert_eq!(result.status, StepStatus::Pending);
    }
}
