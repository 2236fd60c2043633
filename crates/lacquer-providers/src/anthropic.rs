// Copyright (c) 2025 Lacquer Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Anthropic (Claude) provider implementation.

use async_trait::async_trait;
use lacquer_core::{ContentBlock, LLMProvider, ModelRequest, ModelResponse, ProviderError, TokenUsage};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

const SUPPORTED_MODELS: &[&str] = &[
    "claude-opus-4-1",
    "claude-sonnet-4-5",
    "claude-3-5-haiku-latest",
];

/// Anthropic API provider.
pub struct AnthropicProvider {
    client: Client,
    api_key: String,
    base_url: String,
    api_version: String,
}

#[derive(Debug, Serialize)]
struct MessagesRequest {
    model: String,
    messages: Vec<WireMessage>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    stop_sequences: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<WireContentBlock>,
    usage: Usage,
}

#[derive(Debug, Deserialize)]
struct WireContentBlock {
    #[serde(rename = "type")]
    content_type: String,
    text: Option<String>,
    name: Option<String>,
    input: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    input_tokens: u64,
    output_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct AnthropicErrorResponse {
    error: AnthropicError,
}

#[derive(Debug, Deserialize)]
struct AnthropicError {
    #[serde(rename = "type")]
    error_type: String,
    message: String,
}

impl AnthropicProvider {
    fn convert_reqwest_error(err: reqwest::Error) -> ProviderError {
        if err.is_timeout() {
            ProviderError::Timeout
        } else if let Some(status) = err.status() {
            if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                ProviderError::AuthError(err.to_string())
            } else if status == StatusCode::TOO_MANY_REQUESTS {
                ProviderError::RateLimitExceeded
            } else {
                ProviderError::HttpError(err.to_string())
            }
        } else {
            ProviderError::HttpError(err.to_string())
        }
    }

    pub fn new(api_key: String) -> Self {
        Self::with_base_url(api_key, "https://api.anthropic.com/v1".to_string(), "2023-06-01".to_string())
    }

    pub fn with_base_url(api_key: String, base_url: String, api_version: String) -> Self {
        let client = Client::builder().timeout(Duration::from_secs(120)).build().expect("failed to build HTTP client");
        Self { client, api_key, base_url, api_version }
    }

    /// Reads the key from `ANTHROPIC_API_KEY`, falling back to `CLAUDE_API_KEY`.
    pub fn from_env() -> Result<Self, ProviderError> {
        let api_key = std::env::var("ANTHROPIC_API_KEY")
            .or_else(|_| std::env::var("CLAUDE_API_KEY"))
            .map_err(|_| ProviderError::InvalidRequest("ANTHROPIC_API_KEY/CLAUDE_API_KEY not set".to_string()))?;
        Ok(Self::new(api_key))
    }

    fn to_anthropic_request(&self, request: &ModelRequest) -> MessagesRequest {
        let messages = request
            .messages
            .iter()
            .map(|m| WireMessage { role: m.role.clone(), content: m.content.clone() })
            .collect();

        MessagesRequest {
            model: request.model.clone(),
            messages,
            max_tokens: request.max_tokens.unwrap_or(4096),
            system: request.system.clone(),
            temperature: request.temperature,
            top_p: request.top_p,
            stop_sequences: request.stop.clone(),
        }
    }

    fn parse_error(&self, status: StatusCode, body: &str) -> ProviderError {
        if let Ok(error_response) = serde_json::from_str::<AnthropicErrorResponse>(body) {
            let error = error_response.error;
            if status == StatusCode::TOO_MANY_REQUESTS || error.error_type == "rate_limit_error" {
                return ProviderError::RateLimitExceeded;
            }
            if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN || error.error_type == "authentication_error" {
                return ProviderError::AuthError(error.message);
            }
            if error.error_type == "invalid_request_error" {
                return ProviderError::InvalidRequest(error.message);
            }
            return ProviderError::ProviderSpecific(format!("[{}] {}: {}", status.as_u16(), error.error_type, error.message));
        }
        ProviderError::HttpError(format!("[{}] {}", status.as_u16(), body))
    }
}

#[async_trait]
impl LLMProvider for AnthropicProvider {
    async fn generate(&self, request: ModelRequest) -> Result<ModelResponse, ProviderError> {
        let anthropic_request = self.to_anthropic_request(&request);
        debug!(request_id = %request.request_id, model = %request.model, "dispatching anthropic request");

        let response = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", &self.api_version)
            .header("content-type", "application/json")
            .json(&anthropic_request)
            .send()
            .await
            .map_err(Self::convert_reqwest_error)?;

        let status = response.status();
        let body = response.text().await.unwrap_or_else(|_| String::from("failed to read response body"));

        if !status.is_success() {
            warn!(request_id = %request.request_id, status = status.as_u16(), "anthropic request failed");
            return Err(self.parse_error(status, &body));
        }

        let parsed: MessagesResponse =
            serde_json::from_str(&body).map_err(|e| ProviderError::SerializationError(e.to_string()))?;

        let blocks = parsed
            .content
            .into_iter()
            .map(|block| match block.content_type.as_str() {
                "tool_use" => ContentBlock::ToolUse {
                    name: block.name.unwrap_or_default(),
                    input: block.input.unwrap_or(serde_json::Value::Null),
                },
                _ => ContentBlock::Text { text: block.text.unwrap_or_default() },
            })
            .collect();

        Ok(ModelResponse {
            blocks,
            usage: TokenUsage {
                prompt_tokens: parsed.usage.input_tokens,
                completion_tokens: parsed.usage.output_tokens,
                total_tokens: parsed.usage.input_tokens + parsed.usage.output_tokens,
                estimated_cost_usd: 0.0,
            },
        })
    }

    fn get_name(&self) -> &str {
        "anthropic"
    }

    fn supported_models(&self) -> Vec<String> {
        SUPPORTED_MODELS.iter().map(|s| s.to_string()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lacquer_core::Message;

    #[test]
    fn provider_creation_uses_the_default_base_url() {
        let provider = AnthropicProvider::new("test-key".to_string());
        assert_eq!(provider.base_url, "https://api.anthropic.com/v1");
    }

    #[test]
    fn to_anthropic_request_carries_sampling_params_and_stop_sequences() {
        let provider = AnthropicProvider::new("test-key".to_string());
        let request = ModelRequest {
            model: "claude-sonnet-4-5".to_string(),
            messages: vec![Message { role: "user".to_string(), content: "hello".to_string() }],
            system: Some("be terse".to_string()),
            temperature: Some(0.2),
            top_p: None,
            max_tokens: Some(256),
            stop: vec!["STOP".to_string()],
            request_id: "req-1".to_string(),
        };
        let wire = provider.to_anthropic_request(&request);
        assert_eq!(wire.messages.len(), 1);
        assert_eq!(wire.max_tokens, 256);
        assert_eq!(wire.stop_sequences, vec!["STOP".to_string()]);
    }

    #[test]
    fn parse_error_recognizes_rate_limit() {
        let provider = AnthropicProvider::new("test-key".to_string());
        let body = r#"{"error":{"type":"rate_limit_error","message":"slow down"}}"#;
        let error = provider.parse_error(StatusCode::TOO_MANY_REQUESTS, body);
        assert!(matches!(error, ProviderError::RateLimitExceeded));
    }

    #[tokio::test]
    async fn generate_parses_a_successful_messages_response() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/messages")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"content":[{"type":"text","text":"hi there"}],"usage":{"input_tokens":12,"output_tokens":4}}"#,
            )
            .create_async()
            .await;

        let provider = AnthropicProvider::with_base_url("test-key".to_string(), server.url(), "2023-06-01".to_string());
        let request = ModelRequest {
            model: "claude-sonnet-4-5".to_string(),
            messages: vec![Message { role: "user".to_string(), content: "hello".to_string() }],
            system: None,
            temperature: None,
            top_p: None,
            max_tokens: Some(64),
            stop: vec![],
            request_id: "req-1".to_string(),
        };

        let response = provider.generate(request).await.unwrap();
        assert_eq!(response.text(), "hi there");
        assert_eq!(response.usage.prompt_tokens, 12);
        assert_eq!(response.usage.completion_tokens, 4);
    }

    #[tokio::test]
    async fn generate_maps_rate_limit_status_to_provider_error() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/messages")
            .with_status(429)
            .with_body(r#"{"error":{"type":"rate_limit_error","message":"slow down"}}"#)
            .create_async()
            .await;

        let provider = AnthropicProvider::with_base_url("test-key".to_string(), server.url(), "2023-06-01".to_string());
        let request = ModelRequest {
            model: "claude-sonnet-4-5".to_string(),
            messages: vec![Message { role: "user".to_string(), content: "hello".to_string() }],
            system: None,
            temperature: None,
            top_p: None,
            max_tokens: Some(64),
            stop: vec![],
            request_id: "req-1".to_string(),
        };

        let error = provider.generate(request).await.unwrap_err();
        assert!(matches!(error, ProviderError::RateLimitExceeded));
    }
}
