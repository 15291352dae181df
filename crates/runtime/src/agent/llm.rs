//! Model client: the opaque driver behind the conversation loop.
//!
//! The production implementation speaks the Anthropic Messages API via
//! reqwest. The trait keeps the agent and analyser testable with
//! scripted clients; nothing outside this module knows the wire format.

use std::time::Duration;

use async_trait::async_trait;

use super::conversation::{Conversation, ToolCall};
use crate::config;
use crate::types::{ConfigError, ModelError};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Options for one completion request.
#[derive(Debug, Clone)]
pub struct ModelOptions {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    /// Tool definitions in wire shape (`name`, `description`,
    /// `input_schema`).
    pub tools: Vec<serde_json::Value>,
}

impl ModelOptions {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            max_tokens: 2048,
            temperature: 0.0,
            tools: Vec::new(),
        }
    }
}

/// Why the model stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
}

/// One parsed completion.
#[derive(Debug, Clone)]
pub struct ModelResponse {
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
    pub stop_reason: StopReason,
}

/// Opaque conversation driver.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn complete(
        &self,
        conversation: &Conversation,
        options: &ModelOptions,
    ) -> Result<ModelResponse, ModelError>;
}

/// Anthropic Messages API client.
pub struct AnthropicClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl AnthropicClient {
    /// Build from `ANTHROPIC_API_KEY` (required) and
    /// `ANTHROPIC_BASE_URL` (optional).
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_key = config::require_api_key()?;
        let base_url = std::env::var("ANTHROPIC_BASE_URL")
            .unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ConfigError::Invalid(format!("http client: {e}")))?;
        Ok(Self {
            http,
            api_key,
            base_url,
        })
    }

    fn build_body(
        &self,
        conversation: &Conversation,
        options: &ModelOptions,
    ) -> serde_json::Value {
        let (system, messages) = conversation.to_wire();
        // Temperature is always explicit: the analyser's determinism
        // contract depends on 0 actually reaching the API.
        let mut body = serde_json::json!({
            "model": options.model,
            "messages": messages,
            "max_tokens": options.max_tokens,
            "temperature": options.temperature,
        });
        if let Some(system) = system {
            body["system"] = serde_json::Value::String(system);
        }
        if !options.tools.is_empty() {
            body["tools"] = serde_json::Value::Array(options.tools.clone());
        }
        body
    }
}

/// Parse a Messages API response body into a [`ModelResponse`].
pub(crate) fn parse_response(body: &serde_json::Value) -> Result<ModelResponse, ModelError> {
    let blocks = body
        .get("content")
        .and_then(|c| c.as_array())
        .ok_or_else(|| ModelError::Protocol("no content array in response".into()))?;

    let mut text = String::new();
    let mut tool_calls = Vec::new();
    for block in blocks {
        match block.get("type").and_then(|t| t.as_str()) {
            Some("text") => {
                if let Some(chunk) = block.get("text").and_then(|t| t.as_str()) {
                    if !text.is_empty() {
                        text.push('\n');
                    }
                    text.push_str(chunk);
                }
            }
            Some("tool_use") => {
                let id = block
                    .get("id")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| ModelError::Protocol("tool_use without id".into()))?;
                let name = block
                    .get("name")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| ModelError::Protocol("tool_use without name".into()))?;
                let arguments = block
                    .get("input")
                    .cloned()
                    .unwrap_or_else(|| serde_json::json!({}));
                tool_calls.push(ToolCall {
                    id: id.to_string(),
                    name: name.to_string(),
                    arguments,
                });
            }
            _ => {}
        }
    }

    let stop_reason = match body.get("stop_reason").and_then(|s| s.as_str()) {
        Some("tool_use") => StopReason::ToolUse,
        Some("max_tokens") => StopReason::MaxTokens,
        _ => {
            if tool_calls.is_empty() {
                StopReason::EndTurn
            } else {
                StopReason::ToolUse
            }
        }
    };

    Ok(ModelResponse {
        text,
        tool_calls,
        stop_reason,
    })
}

#[async_trait]
impl ModelClient for AnthropicClient {
    async fn complete(
        &self,
        conversation: &Conversation,
        options: &ModelOptions,
    ) -> Result<ModelResponse, ModelError> {
        let body = self.build_body(conversation, options);
        let url = format!("{}/messages", self.base_url);

        tracing::debug!(model = %options.model, messages = conversation.len(), "model request");
        let start = std::time::Instant::now();

        let response = self
            .http
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ModelError::Timeout
                } else {
                    ModelError::Provider(format!("request failed: {e}"))
                }
            })?;

        let status = response.status();
        if status.as_u16() == 429 {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(1);
            return Err(ModelError::RateLimited {
                retry_after_ms: retry_after * 1000,
            });
        }
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_else(|_| "unknown".into());
            return Err(ModelError::Provider(format!(
                "API error ({status}): {error_text}"
            )));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ModelError::Protocol(format!("invalid JSON: {e}")))?;

        tracing::debug!(elapsed_ms = start.elapsed().as_millis() as u64, "model response");
        parse_response(&body)
    }
}
