// Copyright (c) 2025 Lacquer Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Narrow interfaces the executor consumes for model, tool, and runtime
//! providers. Concrete implementations (HTTP clients, subprocess runners,
//! MCP transports) are external collaborators — this module defines only
//! the trait surface and the request/response types that cross it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::collections::HashMap;
use std::time::Duration;

/// Token/cost accounting for a single provider call, aggregated upward by the
/// executor into a run-level total.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub estimated_cost_usd: f64,
}

impl TokenUsage {
    pub fn merge(&self, other: &TokenUsage) -> TokenUsage {
        TokenUsage {
            prompt_tokens: self.prompt_tokens + other.prompt_tokens,
            completion_tokens: self.completion_tokens + other.completion_tokens,
            total_tokens: self.total_tokens + other.total_tokens,
            estimated_cost_usd: self.estimated_cost_usd + other.estimated_cost_usd,
        }
    }
}

/// A single message in a model conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

/// Request sent to an `LLMProvider::generate` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub system: Option<String>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub stop: Vec<String>,
    pub request_id: String,
}

/// A single block of a model response: plain text, or a tool-use request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    ToolUse { name: String, input: Json },
}

/// Ordered response blocks plus usage accounting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelResponse {
    pub blocks: Vec<ContentBlock>,
    pub usage: TokenUsage,
}

impl ModelResponse {
    /// Concatenates all text blocks, in order — the form the output parser
    /// consumes.
    pub fn text(&self) -> String {
        self.blocks
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }
}

/// Narrow interface to a language-model API.
#[async_trait]
pub trait LLMProvider: Send + Sync {
    async fn generate(&self, request: ModelRequest) -> Result<ModelResponse, ProviderError>;
    fn get_name(&self) -> &str;
    fn supported_models(&self) -> Vec<String>;
    fn is_model_supported(&self, model: &str) -> bool {
        self.supported_models().iter().any(|m| m == model)
    }
    async fn close(&self) -> Result<(), ProviderError> {
        Ok(())
    }
}

/// What kind of transport a tool provider speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    Mcp,
    Http,
    Local,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,
    pub output: HashMap<String, Json>,
    pub duration: Duration,
    #[serde(default)]
    pub metadata: HashMap<String, Json>,
    pub error: Option<String>,
}

/// Execution context passed down to a tool invocation — deliberately narrow,
/// a tool provider never gets a handle to the full `ExecutionContext`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolExecContext {
    pub run_id: String,
    pub step_id: String,
}

#[async_trait]
pub trait ToolProvider: Send + Sync {
    fn get_name(&self) -> &str;
    fn get_type(&self) -> ToolKind;
    async fn discover_tools(&self) -> Result<Vec<ToolDefinition>, ProviderError>;
    async fn execute_tool(
        &self,
        name: &str,
        params: HashMap<String, Json>,
        exec_ctx: &ToolExecContext,
    ) -> Result<ToolResult, ProviderError>;
    fn validate_tool(&self, def: &ToolDefinition) -> Result<(), ProviderError> {
        if def.name.is_empty() {
            Err(ProviderError::InvalidRequest("tool name must not be empty".to_string()))
        } else {
            Ok(())
        }
    }
    async fn close(&self) -> Result<(), ProviderError> {
        Ok(())
    }
}

/// Version/toolchain resolution for `script`/`container` steps — the runtime
/// downloader itself is an external collaborator; the executor only needs
/// "give me a usable path for this runtime version".
#[async_trait]
pub trait RuntimeProvider: Send + Sync {
    async fn get(&self, runtime_name: &str, version: &str) -> Result<String, ProviderError>;
    async fn list(&self, runtime_name: &str) -> Result<Vec<String>, ProviderError>;
}

/// Error surface shared by all three provider kinds. Classified into
/// retryable/non-retryable by the executor's retry loop (`is_retryable`).
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize)]
pub enum ProviderError {
    #[error("HTTP request failed: {0}")]
    HttpError(String),
    #[error("authentication failed: {0}")]
    AuthError(String),
    #[error("rate limit exceeded")]
    RateLimitExceeded,
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("provider error: {0}")]
    ProviderSpecific(String),
    #[error("serialization error: {0}")]
    SerializationError(String),
    #[error("request timed out")]
    Timeout,
    #[error("unknown error: {0}")]
    Unknown(String),
}

impl ProviderError {
    /// 5xx/network/429 are retryable; other 4xx and auth failures are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::HttpError(_) | ProviderError::RateLimitExceeded | ProviderError::Timeout
        )
    }
}

/// Loads a sub-workflow AST for a `uses: <path>` step. The default
/// filesystem implementation resolves `path` relative to a base directory
/// and parses it with the same YAML layer the engine's entry point uses;
/// callers may swap in a registry-backed loader for packaged workflows.
pub trait SubWorkflowLoader: Send + Sync {
    fn load(&self, path: &str) -> Result<crate::workflow::Workflow, ProviderError>;
}

pub struct FsWorkflowLoader {
    pub base_dir: std::path::PathBuf,
}

impl SubWorkflowLoader for FsWorkflowLoader {
    fn load(&self, path: &str) -> Result<crate::workflow::Workflow, ProviderError> {
        let full_path = self.base_dir.join(path);
        let text = std::fs::read_to_string(&full_path)
            .map_err(|e| ProviderError::ProviderSpecific(format!("reading sub-workflow '{}': {}", path, e)))?;
        serde_yaml::from_str(&text)
            .map_err(|e| ProviderError::ProviderSpecific(format!("parsing sub-workflow '{}': {}", path, e)))
    }
}

impl From<ProviderError> for crate::error::OrchestratorError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Timeout => crate::error::OrchestratorError::Timeout {
                duration: Duration::default(),
            },
            other => {
                let retryable = other.is_retryable();
                crate::error::OrchestratorError::ProviderError { message: other.to_string(), retryable }
            }
        }
    }
}
