//! Generic HTTP JSON provider for OpenAI-compatible chat completion APIs.
//!
//! Most self-hosted and third-party model backends (vLLM, Ollama, OpenRouter,
//! and OpenAI itself) speak a near-identical `/chat/completions` JSON shape.
//! Rather than one bespoke client per vendor, [`HttpJsonProvider`] is configured
//! with a base URL, an API key, and a model id, and adapts our internal
//! [`ChatMessage`] representation to and from that wire format.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::AgentError;
use crate::message::{ChatMessage, MessageContent, MessageRole};

use super::common::{GenerateOptions, Model, ModelResponse, TokenUsage, ToolDefinition};

/// Configuration for a single OpenAI-compatible backend.
#[derive(Debug, Clone)]
pub struct HttpJsonProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model_id: String,
}

impl HttpJsonProvider {
    /// Builds a provider pointed at `base_url` (e.g. `https://api.openai.com/v1`),
    /// authenticating with `api_key` if present.
    #[must_use]
    pub fn new(base_url: impl Into<String>, api_key: Option<String>, model_id: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key,
            model_id: model_id.into(),
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

#[derive(Serialize)]
struct WireMessage {
    role: &'static str,
    content: String,
}

#[derive(Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<&'a [String]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<&'a [ToolDefinition]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_completion_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct WireResponse {
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Deserialize)]
struct WireChoice {
    message: WireResponseMessage,
}

#[derive(Deserialize)]
struct WireResponseMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct WireUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

fn wire_role(role: MessageRole) -> &'static str {
    match role {
        MessageRole::System => "system",
        MessageRole::User => "user",
        MessageRole::Assistant => "assistant",
        MessageRole::ToolCall => "assistant",
        MessageRole::ToolResponse => "tool",
    }
}

#[async_trait]
impl Model for HttpJsonProvider {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    async fn generate(
        &self,
        messages: Vec<ChatMessage>,
        options: GenerateOptions,
    ) -> Result<ModelResponse, AgentError> {
        let wire_messages = messages
            .into_iter()
            .map(|m| WireMessage {
                role: wire_role(m.role),
                content: m.text_content().unwrap_or_default(),
            })
            .collect();

        let requires_completion_tokens =
            super::common::model_requires_max_completion_tokens(&self.model_id);
        let request = WireRequest {
            model: &self.model_id,
            messages: wire_messages,
            stop: options.stop_sequences.as_deref(),
            temperature: options.temperature,
            tools: options.tools.as_deref(),
            max_tokens: (!requires_completion_tokens).then_some(options.max_tokens).flatten(),
            max_completion_tokens: requires_completion_tokens.then_some(options.max_tokens).flatten(),
        };

        let mut builder = self.client.post(self.endpoint()).json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AgentError::Http {
                message: format!("provider returned {status}: {body}"),
            });
        }

        let parsed: WireResponse = response.json().await?;
        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| AgentError::model("provider returned no choices"))?;
        let text = choice.message.content.unwrap_or_default();
        let mut result = ModelResponse::new(ChatMessage::with_contents(
            MessageRole::Assistant,
            vec![MessageContent::Text { text }],
        ));
        if let Some(usage) = parsed.usage {
            result = result.with_token_usage(TokenUsage::new(
                usage.prompt_tokens,
                usage.completion_tokens,
            ));
        }
        Ok(result)
    }

    fn supports_stop_parameter(&self) -> bool {
        super::common::model_supports_stop_parameter(&self.model_id)
    }

    fn supports_streaming(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_strips_trailing_slash() {
        let provider = HttpJsonProvider::new("https://api.example.com/v1/", None, "gpt-4o");
        assert_eq!(provider.endpoint(), "https://api.example.com/v1/chat/completions");
    }

    #[test]
    fn wire_role_maps_tool_roles_to_openai_shape() {
        assert_eq!(wire_role(MessageRole::ToolCall), "assistant");
        assert_eq!(wire_role(MessageRole::ToolResponse), "tool");
    }
}
