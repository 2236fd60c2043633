// Copyright (c) 2025 Lacquer Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error taxonomy for the workflow execution engine.

use std::time::Duration;
use thiserror::Error;

/// Result alias used throughout `lacquer-core`.
pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// All error kinds the engine can raise, grouped by the subsystem that raises
/// them. Variants map directly onto the taxonomy in the workflow execution
/// design: evaluator/resolver errors are fatal to the current step unless an
/// `on_error` handler covers them, provider/tool/timeout errors are retryable
/// per the step's retry policy, and `Cancelled`/`InvalidWorkflow` are always
/// terminal.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// The workflow AST failed pre-execution validation: missing required
    /// fields, unsupported version, unknown step kind, duplicate step id.
    #[error("invalid workflow: {0}")]
    InvalidWorkflow(String),

    /// Referenced step id does not exist in the workflow.
    #[error("step not found: {0}")]
    StepNotFound(String),

    /// A step declared a kind-specific config that didn't match its `step_type`.
    #[error("invalid step config for '{step_id}': {reason}")]
    InvalidStepConfig { step_id: String, reason: String },

    /// Template `{{ ... }}` resolution failed while rendering a string.
    #[error("failed to resolve template path '{path}': {cause}")]
    TemplateResolutionError { path: String, cause: String },

    /// An identifier in an expression was neither resolved by the variable
    /// pre-pass nor recognized as a registered function.
    #[error("undefined variable: {0}")]
    UndefinedVariable(String),

    /// A dotted path traversed into a field that does not exist on its parent
    /// map.
    #[error("field not found: {0}")]
    FieldNotFound(String),

    /// A path segment indexed into a value that isn't a container, or applied
    /// an operator to operand types it doesn't support.
    #[error("type error: {0}")]
    TypeError(String),

    /// A sequence index was out of `[0, len)`.
    #[error("index out of bounds: index {index} len {len}")]
    IndexOutOfBounds { index: i64, len: usize },

    /// A map index referenced a key that isn't present.
    #[error("key not found: {0}")]
    KeyNotFound(String),

    /// `/` or `%` with a zero divisor.
    #[error("division by zero")]
    DivisionByZero,

    /// Expression parsing failed (lexer or Pratt parser).
    #[error("expression parse error: {0}")]
    ExpressionParseError(String),

    /// Upstream provider (model API) returned a non-2xx status, or the
    /// transport failed outright. `retryable` carries the originating
    /// `ProviderError::is_retryable()` classification (or `true` for
    /// errors raised outside a concrete provider, e.g. "no provider
    /// registered") so the attempt loop doesn't have to re-derive it from
    /// the stringified message.
    #[error("provider error: {message}")]
    ProviderError { message: String, retryable: bool },

    /// Tool execution reported `success = false`, or raised a transport error.
    #[error("tool execution error: {0}")]
    ToolExecutionError(String),

    /// Per-attempt deadline exceeded.
    #[error("operation timed out after {duration:?}")]
    Timeout { duration: Duration },

    /// The run's root cancellation token fired. Terminal, never retried.
    #[error("run cancelled")]
    Cancelled,

    /// State-store write failed. Logged by default; only fatal to the step
    /// when persistence is marked required.
    #[error("persistence error: {0}")]
    PersistenceError(String),

    /// Catch-all for errors surfaced by external collaborators (providers,
    /// tool servers, runtimes) that don't fit a more specific variant.
    #[error("{0}")]
    Other(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl OrchestratorError {
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Whether the attempt loop should retry after this error, independent of
    /// the step's configured `max_attempts` (which bounds *how many* retries,
    /// not whether retrying ever makes sense for this error kind).
    pub fn is_retryable(&self) -> bool {
        match self {
            OrchestratorError::ProviderError { retryable, .. } => *retryable,
            OrchestratorError::ToolExecutionError(_) => true,
            OrchestratorError::Timeout { .. } => true,
            OrchestratorError::PersistenceError(_) => true,
            OrchestratorError::Cancelled => false,
            OrchestratorError::InvalidWorkflow(_) => false,
            OrchestratorError::InvalidStepConfig { .. } => false,
            OrchestratorError::StepNotFound(_) => false,
            _ => false,
        }
    }

    /// Whether this error kind is fatal to the whole run when no `on_error`
    /// handler claims it (as opposed to merely failing the current step).
    pub fn is_run_fatal(&self) -> bool {
        matches!(self, OrchestratorError::Cancelled | OrchestratorError::InvalidWorkflow(_))
    }
}
