// Copyright (c) 2025 Lacquer Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! LLM provider integrations for the Lacquer workflow engine: concrete
//! [`lacquer_core::LLMProvider`] implementations for Anthropic and OpenAI's
//! HTTP APIs.

pub mod anthropic;
pub mod openai;

pub use anthropic::AnthropicProvider;
pub use openai::OpenAIProvider;

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
