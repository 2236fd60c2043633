// Copyright (c) 2025 Lacquer Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Workflow AST: the shape a parsed YAML document takes once deserialized,
//! plus the post-processing that turns loosely-typed step definitions into a
//! closed `StepKind` sum type (see design note on step-kind dispatch).

use crate::duration::parse_duration;
use crate::error::{OrchestratorError, Result};
use crate::template::validate_template;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::collections::HashMap;
use std::time::Duration;

/// Top-level workflow document (`version: "1.0"`).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Workflow {
    pub version: String,
    #[serde(default)]
    pub metadata: Option<WorkflowMetadata>,
    #[serde(default)]
    pub agents: HashMap<String, AgentConfig>,
    #[serde(default)]
    pub requirements: Option<Requirements>,
    pub workflow: WorkflowDef,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct WorkflowMetadata {
    pub name: Option<String>,
    pub description: Option<String>,
    pub author: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub version: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AgentConfig {
    pub provider: String,
    pub model: String,
    #[serde(default)]
    pub temperature: Option<f32>,
    pub system_prompt: Option<String>,
    pub max_tokens: Option<u32>,
    pub top_p: Option<f32>,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub policies: HashMap<String, Json>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Requirements {
    #[serde(default)]
    pub runtimes: Vec<RuntimeRequirement>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RuntimeRequirement {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkflowDef {
    #[serde(default)]
    pub inputs: HashMap<String, InputDeclaration>,
    #[serde(default)]
    pub state: HashMap<String, Json>,
    pub steps: Vec<StepDef>,
    #[serde(default)]
    pub outputs: HashMap<String, String>,
}

/// Input parameter declaration. `name: string` shorthand means
/// `type = string, required = true`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum InputDeclaration {
    Shorthand(String),
    Full(InputSpec),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InputSpec {
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default = "default_true")]
    pub required: bool,
    #[serde(default)]
    pub default: Option<Json>,
    pub description: Option<String>,
}

fn default_true() -> bool {
    true
}

impl InputDeclaration {
    pub fn type_name(&self) -> &str {
        match self {
            InputDeclaration::Shorthand(t) => t,
            InputDeclaration::Full(spec) => &spec.type_name,
        }
    }

    pub fn required(&self) -> bool {
        match self {
            InputDeclaration::Shorthand(_) => true,
            InputDeclaration::Full(spec) => spec.required,
        }
    }

    pub fn default_value(&self) -> Option<&Json> {
        match self {
            InputDeclaration::Shorthand(_) => None,
            InputDeclaration::Full(spec) => spec.default.as_ref(),
        }
    }
}

/// Declared output field: shorthand type name, or a full schema-bearing spec.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum OutputSpec {
    Shorthand(String),
    Full(Box<OutputSchemaField>),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OutputSchemaField {
    #[serde(rename = "type")]
    pub type_name: String,
    pub description: Option<String>,
    #[serde(default)]
    pub optional: bool,
    #[serde(rename = "enum", default)]
    pub enum_values: Vec<Json>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub min_length: Option<usize>,
    pub max_length: Option<usize>,
    pub pattern: Option<String>,
    #[serde(default)]
    pub properties: HashMap<String, OutputSpec>,
    pub items: Option<Box<OutputSpec>>,
}

impl OutputSpec {
    pub fn type_name(&self) -> &str {
        match self {
            OutputSpec::Shorthand(t) => t,
            OutputSpec::Full(field) => &field.type_name,
        }
    }

    pub fn is_optional(&self) -> bool {
        match self {
            OutputSpec::Shorthand(_) => false,
            OutputSpec::Full(field) => field.optional,
        }
    }
}

/// A script step's inline-vs-file source.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum ScriptSpec {
    Inline(String),
    File { file: String, #[serde(default)] interpreter: Option<String> },
}

/// Raw, loosely-typed step as deserialized from YAML. Every step-kind field
/// is optional here; `StepDef::classify` applies the precedence rule
/// (`action` > `uses` > `container` > `script` > `run` > `agent`) to produce
/// the closed `StepKind` the executor dispatches on.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StepDef {
    pub id: String,
    pub agent: Option<String>,
    pub prompt: Option<String>,
    pub uses: Option<String>,
    pub run: Option<String>,
    pub container: Option<String>,
    pub script: Option<ScriptSpec>,
    pub action: Option<String>,
    #[serde(default)]
    pub with: HashMap<String, Json>,
    #[serde(default)]
    pub updates: HashMap<String, Json>,
    pub condition: Option<String>,
    pub skip_if: Option<String>,
    #[serde(default)]
    pub outputs: HashMap<String, OutputSpec>,
    pub timeout: Option<String>,
    pub retry: Option<RetryPolicyDef>,
    #[serde(default)]
    pub on_error: Vec<ErrorHandlerDef>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    Linear,
    Exponential,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetryPolicyDef {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff")]
    pub backoff: BackoffStrategy,
    #[serde(default = "default_initial_delay")]
    pub initial_delay: String,
    #[serde(default = "default_max_delay")]
    pub max_delay: String,
}

fn default_max_attempts() -> u32 {
    1
}
fn default_backoff() -> BackoffStrategy {
    BackoffStrategy::Linear
}
fn default_initial_delay() -> String {
    "1s".to_string()
}
fn default_max_delay() -> String {
    "30s".to_string()
}

impl Default for RetryPolicyDef {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff: default_backoff(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
        }
    }
}

/// Resolved retry policy with durations already parsed.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: BackoffStrategy,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_def(def: &RetryPolicyDef) -> Result<Self> {
        Ok(Self {
            max_attempts: def.max_attempts.max(1),
            backoff: def.backoff.clone(),
            initial_delay: parse_duration(&def.initial_delay)?,
            max_delay: parse_duration(&def.max_delay)?,
        })
    }

    /// Delay before the given 1-based attempt's retry, per the configured
    /// backoff strategy, capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let computed = match self.backoff {
            BackoffStrategy::Linear => self.initial_delay,
            BackoffStrategy::Exponential => {
                let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
                self.initial_delay.saturating_mul(factor)
            }
        };
        computed.min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            backoff: BackoffStrategy::Linear,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

/// Raw `on_error` entry; exactly one of these fields is expected to be set.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ErrorHandlerDef {
    pub log: Option<String>,
    pub fallback: Option<String>,
    pub output: Option<HashMap<String, Json>>,
    #[serde(rename = "return")]
    pub return_values: Option<HashMap<String, Json>>,
}

/// Classified `on_error` handler, one case per handler kind.
#[derive(Debug, Clone)]
pub enum ErrorHandler {
    Log(String),
    Fallback(String),
    Output(HashMap<String, Json>),
    Return(HashMap<String, Json>),
}

impl ErrorHandlerDef {
    pub fn classify(&self, step_id: &str) -> Result<ErrorHandler> {
        if let Some(msg) = &self.log {
            Ok(ErrorHandler::Log(msg.clone()))
        } else if let Some(target) = &self.fallback {
            Ok(ErrorHandler::Fallback(target.clone()))
        } else if let Some(output) = &self.output {
            Ok(ErrorHandler::Output(output.clone()))
        } else if let Some(ret) = &self.return_values {
            Ok(ErrorHandler::Return(ret.clone()))
        } else {
            Err(OrchestratorError::InvalidWorkflow(format!(
                "on_error entry for step '{}' has no recognized handler field",
                step_id
            )))
        }
    }
}

/// Sum type for step-kind dispatch, populated during post-processing by
/// `StepDef::classify`. Eliminates the ambiguous multi-field precedence check
/// at dispatch time: once built, `kind` is the single source of truth.
#[derive(Debug, Clone)]
pub enum StepKind {
    Action { action: String },
    Sub { workflow_path: String },
    Container { image: String },
    Script { script: ScriptSpec },
    Run { command: String },
    Agent { agent: String },
}

impl StepKind {
    pub fn label(&self) -> &'static str {
        match self {
            StepKind::Action { .. } => "action",
            StepKind::Sub { .. } => "uses",
            StepKind::Container { .. } => "container",
            StepKind::Script { .. } => "script",
            StepKind::Run { .. } => "run",
            StepKind::Agent { .. } => "agent",
        }
    }
}

impl StepDef {
    /// Applies the step-kind precedence rule from the dispatch spec:
    /// `action` > `uses` > `container` > `script` > `run` > `agent`.
    pub fn classify(&self) -> Result<StepKind> {
        if let Some(action) = &self.action {
            Ok(StepKind::Action { action: action.clone() })
        } else if let Some(uses) = &self.uses {
            Ok(StepKind::Sub { workflow_path: uses.clone() })
        } else if let Some(container) = &self.container {
            Ok(StepKind::Container { image: container.clone() })
        } else if let Some(script) = &self.script {
            Ok(StepKind::Script { script: script.clone() })
        } else if let Some(run) = &self.run {
            Ok(StepKind::Run { command: run.clone() })
        } else if let Some(agent) = &self.agent {
            Ok(StepKind::Agent { agent: agent.clone() })
        } else {
            Err(OrchestratorError::InvalidWorkflow(format!(
                "step '{}' declares no kind (one of action/uses/container/script/run/agent required)",
                self.id
            )))
        }
    }
}

/// Fully post-processed step: the runtime form the executor consumes.
#[derive(Debug, Clone)]
pub struct Step {
    pub id: String,
    pub kind: StepKind,
    pub prompt: Option<String>,
    pub with: HashMap<String, Json>,
    pub updates: HashMap<String, Json>,
    pub condition: Option<String>,
    pub skip_if: Option<String>,
    pub outputs: HashMap<String, OutputSpec>,
    pub timeout: Option<Duration>,
    pub retry: RetryPolicy,
    pub on_error: Vec<ErrorHandler>,
}

impl Step {
    pub fn from_def(def: &StepDef) -> Result<Self> {
        let kind = def.classify()?;
        let timeout = def.timeout.as_deref().map(parse_duration).transpose()?;
        let retry = match &def.retry {
            Some(r) => RetryPolicy::from_def(r)?,
            None => RetryPolicy::default(),
        };
        let on_error = def
            .on_error
            .iter()
            .map(|h| h.classify(&def.id))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            id: def.id.clone(),
            kind,
            prompt: def.prompt.clone(),
            with: def.with.clone(),
            updates: def.updates.clone(),
            condition: def.condition.clone(),
            skip_if: def.skip_if.clone(),
            outputs: def.outputs.clone(),
            timeout,
            retry,
            on_error,
        })
    }
}

impl Workflow {
    /// Validates structural invariants: supported version, unique step ids,
    /// step kinds all resolvable, `fallback`/condition references to other
    /// steps or inputs are left for runtime (cheap to check, expensive to
    /// track at parse time since forward references are legal).
    pub fn validate(&self) -> Result<()> {
        if self.version != "1.0" {
            return Err(OrchestratorError::InvalidWorkflow(format!(
                "unsupported workflow version '{}'",
                self.version
            )));
        }

        if self.workflow.steps.is_empty() {
            return Err(OrchestratorError::InvalidWorkflow(
                "workflow must declare at least one step".to_string(),
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for step in &self.workflow.steps {
            if step.id.is_empty() {
                return Err(OrchestratorError::InvalidWorkflow(
                    "step id must not be empty".to_string(),
                ));
            }
            if !seen.insert(step.id.clone()) {
                return Err(OrchestratorError::InvalidWorkflow(format!(
                    "duplicate step id '{}'",
                    step.id
                )));
            }
            step.classify()?;

            if let Some(prompt) = &step.prompt {
                validate_template(prompt)?;
            }
            if let Some(condition) = &step.condition {
                validate_template(condition)?;
            }
            if let Some(skip_if) = &step.skip_if {
                validate_template(skip_if)?;
            }
        }

        for template in self.workflow.outputs.values() {
            validate_template(template)?;
        }

        Ok(())
    }

    /// Post-processes every `StepDef` into a runtime `Step`, in declared order.
    pub fn resolve_steps(&self) -> Result<Vec<Step>> {
        self.workflow.steps.iter().map(Step::from_def).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_yaml() -> &'static str {
        r#"
version: "1.0"
metadata:
  name: greet
workflow:
  inputs:
    name: string
  state: {}
  steps:
    - id: step1
      agent: greeter
      prompt: "Say hello to {{ inputs.name }}"
      outputs:
        greeting: string
    - id: step2
      action: update_state
      updates:
        greeted: "{{ steps.step1.output }}"
  outputs:
    greeted: "{{ state.greeted }}"
"#
    }

    #[test]
    fn parses_and_validates_minimal_workflow() {
        let workflow: Workflow = serde_yaml::from_str(sample_yaml()).unwrap();
        workflow.validate().unwrap();
        assert_eq!(workflow.workflow.steps.len(), 2);
    }

    #[test]
    fn step_kind_precedence_prefers_action_over_agent() {
        let def = StepDef {
            id: "s".into(),
            agent: Some("a".into()),
            prompt: None,
            uses: None,
            run: None,
            container: None,
            script: None,
            action: Some("update_state".into()),
            with: HashMap::new(),
            updates: HashMap::new(),
            condition: None,
            skip_if: None,
            outputs: HashMap::new(),
            timeout: None,
            retry: None,
            on_error: vec![],
        };
        match def.classify().unwrap() {
            StepKind::Action { action } => assert_eq!(action, "update_state"),
            _ => panic!("expected action kind to win"),
        }
    }

    #[test]
    fn rejects_unsupported_version() {
        let mut workflow: Workflow = serde_yaml::from_str(sample_yaml()).unwrap();
        workflow.version = "2.0".to_string();
        assert!(workflow.validate().is_err());
    }

    #[test]
    fn rejects_duplicate_step_ids() {
        let mut workflow: Workflow = serde_yaml::from_str(sample_yaml()).unwrap();
        let first = workflow.workflow.steps[0].clone();
        workflow.workflow.steps.push(first);
        assert!(workflow.validate().is_err());
    }

    #[test]
    fn exponential_backoff_caps_at_max_delay() {
        let policy = RetryPolicy {
            max_attempts: 5,
            backoff: BackoffStrategy::Exponential,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(300),
        };
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(300));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(300));
    }
}
