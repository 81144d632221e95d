use async_trait::async_trait;
use serde_json::json;

use crate::orchestrator::clients::common::{call_timeout, classify_http_status, resolve_api_key, shared_provider_http_client};
use crate::orchestrator::clients::ProviderAdapter;
use crate::orchestrator::error::OrchestratorError;
use crate::orchestrator::event::TokenUsage;
use crate::orchestrator::llm::{AdaptedResponse, Message, ModelConfig, NativeToolCall, Role, StopReason, ToolDefinition};

const ANTHROPIC_DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";

/// Speaks the anthropic-style wire format: system prompt as a
/// top-level field, tool-use as `content` blocks, tool results as user
/// turns carrying a `tool_result` block, `stop_reason` of `"end_turn"`
/// or `"tool_use"`.
pub struct AnthropicAdapter {
    http: reqwest::Client,
}

impl AnthropicAdapter {
    pub fn new() -> Self {
        AnthropicAdapter { http: shared_provider_http_client() }
    }

    fn encode_messages(transcript: &[Message]) -> Vec<serde_json::Value> {
        transcript
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|m| match &m.role {
                Role::User => json!({ "role": "user", "content": m.content.to_string() }),
                Role::Assistant if m.tool_calls.is_empty() => {
                    json!({ "role": "assistant", "content": m.content.to_string() })
                }
                Role::Assistant => {
                    let blocks: Vec<serde_json::Value> = m
                        .tool_calls
                        .iter()
                        .map(|tc| json!({ "type": "tool_use", "id": tc.id, "name": tc.name, "input": tc.arguments }))
                        .collect();
                    json!({ "role": "assistant", "content": blocks })
                }
                Role::Tool { call_id } => json!({
                    "role": "user",
                    "content": [{ "type": "tool_result", "tool_use_id": call_id, "content": m.content.to_string() }]
                }),
                Role::System => unreachable!("filtered above"),
            })
            .collect()
    }

    fn encode_tools(tools: &[ToolDefinition]) -> Vec<serde_json::Value> {
        tools
            .iter()
            .map(|t| json!({ "name": t.name, "description": t.description, "input_schema": t.parameters_schema }))
            .collect()
    }
}

impl Default for AnthropicAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    async fn send(
        &self,
        system_prompt: &str,
        transcript: &[Message],
        tools: &[ToolDefinition],
        model: &ModelConfig,
    ) -> Result<AdaptedResponse, OrchestratorError> {
        let api_key = resolve_api_key(model)?;
        let base_url = model.base_url.clone().unwrap_or_else(|| ANTHROPIC_DEFAULT_BASE_URL.to_string());

        let body = json!({
            "model": model.model_name,
            "system": system_prompt,
            "messages": Self::encode_messages(transcript),
            "tools": Self::encode_tools(tools),
            "max_tokens": 4096,
        });

        let resp = self
            .http
            .post(format!("{}/messages", base_url.trim_end_matches('/')))
            .header("x-api-key", api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .timeout(call_timeout(model))
            .send()
            .await
            .map_err(|e| OrchestratorError::LlmTimeout(e.to_string()))?;

        let status = resp.status();
        let text = resp.text().await.map_err(|e| OrchestratorError::LlmTimeout(e.to_string()))?;
        if !status.is_success() {
            return Err(classify_http_status(status, &text));
        }

        let parsed: serde_json::Value =
            serde_json::from_str(&text).map_err(|e| OrchestratorError::Serialization(e.to_string()))?;

        let stop_reason = match parsed["stop_reason"].as_str() {
            Some("tool_use") => StopReason::ToolUse,
            _ => StopReason::Terminal,
        };

        let mut content_text = String::new();
        let mut tool_calls = Vec::new();
        if let Some(blocks) = parsed["content"].as_array() {
            for block in blocks {
                match block["type"].as_str() {
                    Some("text") => content_text.push_str(block["text"].as_str().unwrap_or("")),
                    Some("tool_use") => tool_calls.push(NativeToolCall {
                        id: block["id"].as_str().unwrap_or_default().to_string(),
                        name: block["name"].as_str().unwrap_or_default().to_string(),
                        arguments: block["input"].clone(),
                    }),
                    _ => {}
                }
            }
        }

        let message = if tool_calls.is_empty() {
            Message::assistant(content_text)
        } else {
            Message::assistant_with_tool_calls(tool_calls)
        };

        let usage = TokenUsage {
            input_tokens: parsed["usage"]["input_tokens"].as_u64().unwrap_or(0) as u32,
            output_tokens: parsed["usage"]["output_tokens"].as_u64().unwrap_or(0) as u32,
        };

        Ok(AdaptedResponse { message, stop_reason, usage })
    }
}
