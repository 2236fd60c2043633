// Copyright (c) 2025 Lacquer Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! OpenAI provider implementation.

use async_trait::async_trait;
use lacquer_core::{ContentBlock, LLMProvider, ModelRequest, ModelResponse, ProviderError, TokenUsage};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

const SUPPORTED_MODELS: &[&str] = &["gpt-4o", "gpt-4o-mini", "gpt-4.1", "o3-mini"];

/// OpenAI API provider.
pub struct OpenAIProvider {
    client: Client,
    api_key: String,
    base_url: String,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    stop: Vec<String>,
    #[serde(default)]
    stream: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
    usage: Usage,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct Usage {
    prompt_tokens: u64,
    completion_tokens: u64,
    total_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct OpenAIErrorResponse {
    error: OpenAIError,
}

#[derive(Debug, Deserialize)]
struct OpenAIError {
    message: String,
    #[serde(rename = "type")]
    error_type: String,
}

impl OpenAIProvider {
    fn convert_reqwest_error(err: reqwest::Error) -> ProviderError {
        if err.is_timeout() {
            ProviderError::Timeout
        } else if let Some(status) = err.status() {
            if status == StatusCode::UNAUTHORIZED {
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
        Self::with_base_url(api_key, "https://api.openai.com/v1".to_string())
    }

    pub fn with_base_url(api_key: String, base_url: String) -> Self {
        let client = Client::builder().timeout(Duration::from_secs(120)).build().expect("failed to build HTTP client");
        Self { client, api_key, base_url }
    }

    /// Reads the key from `OPENAI_API_KEY`, falling back to `OPENAI_KEY`/`OPENAI_TOKEN`.
    pub fn from_env() -> Result<Self, ProviderError> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .or_else(|_| std::env::var("OPENAI_KEY"))
            .or_else(|_| std::env::var("OPENAI_TOKEN"))
            .map_err(|_| ProviderError::InvalidRequest("OPENAI_API_KEY/OPENAI_KEY/OPENAI_TOKEN not set".to_string()))?;
        Ok(Self::new(api_key))
    }

    fn to_openai_request(&self, request: &ModelRequest) -> ChatCompletionRequest {
        let mut messages = Vec::new();
        if let Some(system) = &request.system {
            messages.push(ChatMessage { role: "system".to_string(), content: system.clone() });
        }
        for m in &request.messages {
            messages.push(ChatMessage { role: m.role.clone(), content: m.content.clone() });
        }

        ChatCompletionRequest {
            model: request.model.clone(),
            messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            top_p: request.top_p,
            stop: request.stop.clone(),
            stream: false,
        }
    }

    fn parse_error(&self, status: StatusCode, body: &str) -> ProviderError {
        if let Ok(error_response) = serde_json::from_str::<OpenAIErrorResponse>(body) {
            let error = error_response.error;
            if status == StatusCode::TOO_MANY_REQUESTS || error.error_type == "rate_limit_exceeded" {
                return ProviderError::RateLimitExceeded;
            }
            if status == StatusCode::UNAUTHORIZED || error.error_type == "invalid_api_key" {
                return ProviderError::AuthError(error.message);
            }
            return ProviderError::ProviderSpecific(format!("[{}] {}: {}", status.as_u16(), error.error_type, error.message));
        }
        ProviderError::HttpError(format!("[{}] {}", status.as_u16(), body))
    }
}

#[async_trait]
impl LLMProvider for OpenAIProvider {
    async fn generate(&self, request: ModelRequest) -> Result<ModelResponse, ProviderError> {
        let openai_request = self.to_openai_request(&request);
        debug!(request_id = %request.request_id, model = %request.model, "dispatching openai request");

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("content-type", "application/json")
            .json(&openai_request)
            .send()
            .await
            .map_err(Self::convert_reqwest_error)?;

        let status = response.status();
        let body = response.text().await.unwrap_or_else(|_| String::from("failed to read response body"));

        if !status.is_success() {
            warn!(request_id = %request.request_id, status = status.as_u16(), "openai request failed");
            return Err(self.parse_error(status, &body));
        }

        let parsed: ChatCompletionResponse =
            serde_json::from_str(&body).map_err(|e| ProviderError::SerializationError(e.to_string()))?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::SerializationError("no choices in response".to_string()))?;

        Ok(ModelResponse {
            blocks: vec![ContentBlock::Text { text: choice.message.content }],
            usage: TokenUsage {
                prompt_tokens: parsed.usage.prompt_tokens,
                completion_tokens: parsed.usage.completion_tokens,
                total_tokens: parsed.usage.total_tokens,
                estimated_cost_usd: 0.0,
            },
        })
    }

    fn get_name(&self) -> &str {
        "openai"
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
        let provider = OpenAIProvider::new("test-key".to_string());
        assert_eq!(provider.base_url, "https://api.openai.com/v1");
    }

    #[test]
    fn to_openai_request_prepends_system_message() {
        let provider = OpenAIProvider::new("test-key".to_string());
        let request = ModelRequest {
            model: "gpt-4o".to_string(),
            messages: vec![Message { role: "user".to_string(), content: "hi".to_string() }],
            system: Some("be terse".to_string()),
            temperature: Some(0.5),
            top_p: None,
            max_tokens: Some(64),
            stop: vec![],
            request_id: "req-1".to_string(),
        };
        let wire = provider.to_openai_request(&request);
        assert_eq!(wire.messages.len(), 2);
        assert_eq!(wire.messages[0].role, "system");
        assert_eq!(wire.messages[1].role, "user");
    }

    #[test]
    fn parse_error_recognizes_auth_failure() {
        let provider = OpenAIProvider::new("test-key".to_string());
        let body = r#"{"error":{"message":"bad key","type":"invalid_api_key"}}"#;
        let error = provider.parse_error(StatusCode::UNAUTHORIZED, body);
        assert!(matches!(error, ProviderError::AuthError(_)));
    }

    #[tokio::test]
    async fn generate_parses_a_successful_chat_completion() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/chat/completions")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"choices":[{"message":{"role":"assistant","content":"hi there"}}],"usage":{"prompt_tokens":12,"completion_tokens":4,"total_tokens":16}}"#,
            )
            .create_async()
            .await;

        let provider = OpenAIProvider::with_base_url("test-key".to_string(), server.url());
        let request = ModelRequest {
            model: "gpt-4o".to_string(),
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
        assert_eq!(response.usage.total_tokens, 16);
    }

    #[tokio::test]
    async fn generate_maps_unauthorized_status_to_auth_error() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/chat/completions")
            .with_status(401)
            .with_body(r#"{"error":{"message":"bad key","type":"invalid_api_key"}}"#)
            .create_async()
            .await;

        let provider = OpenAIProvider::with_base_url("test-key".to_string(), server.url());
        let request = ModelRequest {
            model: "gpt-4o".to_string(),
            messages: vec![Message { role: "user".to_string(), content: "hello".to_string() }],
            system: None,
            temperature: None,
            top_p: None,
            max_tokens: Some(64),
            stop: vec![],
            request_id: "req-1".to_string(),
        };

        let error = provider.generate(request).await.unwrap_err();
        assert!(matches!(error, ProviderError::AuthError(_)));
    }
}
