//! Inference drivers: single-turn and multi-turn LLM calls.
//!
//! Three backends: Ollama (`/api/chat`), Anthropic (`/v1/messages`), and
//! OpenAI (`/v1/chat/completions`). Context-budget truncation is the
//! caller's responsibility, not the driver's.

use crate::embedding::{status_error, transport_error};
use async_trait::async_trait;
use quorum_types::{QuorumConfig, QuorumError, QuorumResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Fixed timeout ceiling for inference calls.
const INFER_TIMEOUT_SECS: u64 = 120;

/// Max tokens requested from backends that require an explicit ceiling.
const MAX_OUTPUT_TOKENS: u32 = 4096;

/// One message in a multi-turn inference context.
#[derive(Debug, Clone, Serialize)]
pub struct ChatTurn {
    pub role: &'static str,
    pub content: String,
}

impl ChatTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user",
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant",
            content: content.into(),
        }
    }
}

/// Trait for calling the configured inference backend.
#[async_trait]
pub trait LlmDriver: Send + Sync {
    /// Multi-turn variant: the system prompt plus an ordered turn list.
    async fn complete_turns(
        &self,
        system_prompt: &str,
        turns: &[ChatTurn],
    ) -> QuorumResult<String>;

    /// Single-turn variant.
    async fn complete(&self, system_prompt: &str, user_message: &str) -> QuorumResult<String> {
        self.complete_turns(system_prompt, &[ChatTurn::user(user_message)])
            .await
    }

    /// The model this driver calls.
    fn model_name(&self) -> &str;
}

/// Inference driver for a local Ollama server.
pub struct OllamaLlmDriver {
    host: String,
    model: String,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct OllamaChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatTurn>,
    stream: bool,
}

#[derive(Deserialize)]
struct OllamaChatResponse {
    message: OllamaChatMessage,
}

#[derive(Deserialize)]
struct OllamaChatMessage {
    content: String,
}

impl OllamaLlmDriver {
    pub fn new(host: &str, model: &str) -> QuorumResult<Self> {
        Ok(Self {
            host: host.trim_end_matches('/').to_string(),
            model: model.to_string(),
            client: infer_client()?,
        })
    }
}

#[async_trait]
impl LlmDriver for OllamaLlmDriver {
    async fn complete_turns(
        &self,
        system_prompt: &str,
        turns: &[ChatTurn],
    ) -> QuorumResult<String> {
        let mut messages = Vec::with_capacity(turns.len() + 1);
        messages.push(ChatTurn {
            role: "system",
            content: system_prompt.to_string(),
        });
        messages.extend(turns.iter().cloned());

        let body = OllamaChatRequest {
            model: &self.model,
            messages,
            stream: false,
        };

        let resp = self
            .client
            .post(format!("{}/api/chat", self.host))
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error("ollama", INFER_TIMEOUT_SECS, e))?;

        if !resp.status().is_success() {
            return Err(status_error("ollama", resp).await);
        }

        let data: OllamaChatResponse = resp.json().await.map_err(|e| QuorumError::Provider {
            provider: "ollama".to_string(),
            status: 200,
            message: format!("invalid chat response body: {e}"),
        })?;
        debug!(model = %self.model, "Inference call via ollama");
        Ok(data.message.content)
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

/// Inference driver for the Anthropic messages API.
pub struct AnthropicLlmDriver {
    api_key: String,
    model: String,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    system: &'a str,
    messages: &'a [ChatTurn],
}

#[derive(Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContent>,
}

#[derive(Deserialize)]
struct AnthropicContent {
    text: String,
}

impl AnthropicLlmDriver {
    pub fn new(api_key: &str, model: &str) -> QuorumResult<Self> {
        Ok(Self {
            api_key: api_key.to_string(),
            model: model.to_string(),
            client: infer_client()?,
        })
    }
}

#[async_trait]
impl LlmDriver for AnthropicLlmDriver {
    async fn complete_turns(
        &self,
        system_prompt: &str,
        turns: &[ChatTurn],
    ) -> QuorumResult<String> {
        let body = AnthropicRequest {
            model: &self.model,
            max_tokens: MAX_OUTPUT_TOKENS,
            system: system_prompt,
            messages: turns,
        };

        let resp = self
            .client
            .post("https://api.anthropic.com/v1/messages")
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error("anthropic", INFER_TIMEOUT_SECS, e))?;

        if !resp.status().is_success() {
            return Err(status_error("anthropic", resp).await);
        }

        let data: AnthropicResponse = resp.json().await.map_err(|e| QuorumError::Provider {
            provider: "anthropic".to_string(),
            status: 200,
            message: format!("invalid messages response body: {e}"),
        })?;

        data.content
            .into_iter()
            .next()
            .map(|c| c.text)
            .ok_or_else(|| QuorumError::Provider {
                provider: "anthropic".to_string(),
                status: 200,
                message: "empty content array".to_string(),
            })
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

/// Inference driver for the OpenAI chat completions API.
pub struct OpenAiLlmDriver {
    api_key: String,
    model: String,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct OpenAiChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatTurn>,
}

#[derive(Deserialize)]
struct OpenAiChatResponse {
    choices: Vec<OpenAiChoice>,
}

#[derive(Deserialize)]
struct OpenAiChoice {
    message: OpenAiChatMessage,
}

#[derive(Deserialize)]
struct OpenAiChatMessage {
    content: String,
}

impl OpenAiLlmDriver {
    pub fn new(api_key: &str, model: &str) -> QuorumResult<Self> {
        Ok(Self {
            api_key: api_key.to_string(),
            model: model.to_string(),
            client: infer_client()?,
        })
    }
}

#[async_trait]
impl LlmDriver for OpenAiLlmDriver {
    async fn complete_turns(
        &self,
        system_prompt: &str,
        turns: &[ChatTurn],
    ) -> QuorumResult<String> {
        let mut messages = Vec::with_capacity(turns.len() + 1);
        messages.push(ChatTurn {
            role: "system",
            content: system_prompt.to_string(),
        });
        messages.extend(turns.iter().cloned());

        let body = OpenAiChatRequest {
            model: &self.model,
            messages,
        };

        let resp = self
            .client
            .post("https://api.openai.com/v1/chat/completions")
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error("openai", INFER_TIMEOUT_SECS, e))?;

        if !resp.status().is_success() {
            return Err(status_error("openai", resp).await);
        }

        let data: OpenAiChatResponse = resp.json().await.map_err(|e| QuorumError::Provider {
            provider: "openai".to_string(),
            status: 200,
            message: format!("invalid completions response body: {e}"),
        })?;

        data.choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| QuorumError::Provider {
                provider: "openai".to_string(),
                status: 200,
                message: "empty choices array".to_string(),
            })
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

fn infer_client() -> QuorumResult<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(INFER_TIMEOUT_SECS))
        .build()
        .map_err(|e| QuorumError::Config(format!("failed to build HTTP client: {e}")))
}

/// Create an inference driver from config. Selection happens once here;
/// an unknown backend name aborts the run.
pub fn create_llm_driver(config: &QuorumConfig) -> QuorumResult<Box<dyn LlmDriver + Send + Sync>> {
    match config.llm_provider.as_str() {
        "ollama" => Ok(Box::new(OllamaLlmDriver::new(
            &config.ollama_host,
            &config.llm_model,
        )?)),
        "anthropic" => Ok(Box::new(AnthropicLlmDriver::new(
            &config.anthropic_api_key,
            &config.llm_model,
        )?)),
        "openai" => Ok(Box::new(OpenAiLlmDriver::new(
            &config.openai_api_key,
            &config.llm_model,
        )?)),
        other => Err(QuorumError::Config(format!("Unknown LLM provider: {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_turn_helpers() {
        let turn = ChatTurn::user("hello");
        assert_eq!(turn.role, "user");
        assert_eq!(turn.content, "hello");
        assert_eq!(ChatTurn::assistant("hi").role, "assistant");
    }

    #[test]
    fn test_create_llm_driver_known_backends() {
        let mut config = QuorumConfig::default();
        for provider in ["ollama", "anthropic", "openai"] {
            config.llm_provider = provider.to_string();
            let driver = create_llm_driver(&config).unwrap();
            assert_eq!(driver.model_name(), "llama3.2");
        }
    }

    #[test]
    fn test_create_llm_driver_unknown() {
        let config = QuorumConfig {
            llm_provider: "mystery".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            create_llm_driver(&config),
            Err(QuorumError::Config(_))
        ));
    }
}
