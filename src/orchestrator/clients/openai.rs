use async_trait::async_trait;
use serde_json::json;

use crate::orchestrator::clients::common::{call_timeout, classify_http_status, resolve_api_key, shared_provider_http_client};
use crate::orchestrator::clients::ProviderAdapter;
use crate::orchestrator::error::OrchestratorError;
use crate::orchestrator::event::TokenUsage;
use crate::orchestrator::llm::{AdaptedResponse, Message, ModelConfig, NativeToolCall, Role, StopReason, ToolDefinition};

const OPENAI_DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Speaks the openai-style wire format: system prompt as the first
/// message with `role: "system"`, tool definitions wrapped in
/// `{type: "function", function: {...}}`, tool-use requests in
/// `message.tool_calls[]`, tool results as a turn with `role: "tool"`
/// and `tool_call_id`, finish reason of `"stop"` or `"tool_calls"`.
pub struct OpenAiAdapter {
    http: reqwest::Client,
}

impl OpenAiAdapter {
    pub fn new() -> Self {
        OpenAiAdapter { http: shared_provider_http_client() }
    }

    fn encode_messages(system_prompt: &str, transcript: &[Message]) -> Vec<serde_json::Value> {
        let mut out = vec![json!({ "role": "system", "content": system_prompt })];
        for m in transcript {
            match &m.role {
                Role::System => continue,
                Role::User => out.push(json!({ "role": "user", "content": m.content.to_string() })),
                Role::Assistant if m.tool_calls.is_empty() => {
                    out.push(json!({ "role": "assistant", "content": m.content.to_string() }))
                }
                Role::Assistant => {
                    let tool_calls: Vec<serde_json::Value> = m
                        .tool_calls
                        .iter()
                        .map(|tc| {
                            json!({
                                "id": tc.id,
                                "type": "function",
                                "function": { "name": tc.name, "arguments": tc.arguments.to_string() }
                            })
                        })
                        .collect();
                    out.push(json!({ "role": "assistant", "content": null, "tool_calls": tool_calls }));
                }
                Role::Tool { call_id } => out.push(json!({
                    "role": "tool",
                    "tool_call_id": call_id,
                    "content": m.content.to_string(),
                })),
            }
        }
        out
    }

    fn encode_tools(tools: &[ToolDefinition]) -> Vec<serde_json::Value> {
        tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": { "name": t.name, "description": t.description, "parameters": t.parameters_schema }
                })
            })
            .collect()
    }
}

impl Default for OpenAiAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProviderAdapter for OpenAiAdapter {
    async fn send(
        &self,
        system_prompt: &str,
        transcript: &[Message],
        tools: &[ToolDefinition],
        model: &ModelConfig,
    ) -> Result<AdaptedResponse, OrchestratorError> {
        let api_key = resolve_api_key(model)?;
        let base_url = model.base_url.clone().unwrap_or_else(|| OPENAI_DEFAULT_BASE_URL.to_string());

        let mut body = json!({
            "model": model.model_name,
            "messages": Self::encode_messages(system_prompt, transcript),
        });
        if !tools.is_empty() {
            body["tools"] = json!(Self::encode_tools(tools));
        }

        let resp = self
            .http
            .post(format!("{}/chat/completions", base_url.trim_end_matches('/')))
            .bearer_auth(api_key)
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

        let choice = &parsed["choices"][0];
        let finish_reason = choice["finish_reason"].as_str().unwrap_or("stop");
        let stop_reason = if finish_reason == "tool_calls" { StopReason::ToolUse } else { StopReason::Terminal };

        let msg = &choice["message"];
        let content = msg["content"].as_str().unwrap_or("").to_string();

        let tool_calls: Vec<NativeToolCall> = msg["tool_calls"]
            .as_array()
            .map(|calls| {
                calls
                    .iter()
                    .map(|c| {
                        let args_str = c["function"]["arguments"].as_str().unwrap_or("{}");
                        let arguments = serde_json::from_str(args_str).unwrap_or(serde_json::json!({}));
                        NativeToolCall {
                            id: c["id"].as_str().unwrap_or_default().to_string(),
                            name: c["function"]["name"].as_str().unwrap_or_default().to_string(),
                            arguments,
                        }
                    })
                    .collect()
            })
            .unwrap_or_default();

        let message =
            if tool_calls.is_empty() { Message::assistant(content) } else { Message::assistant_with_tool_calls(tool_calls) };

        let usage = TokenUsage {
            input_tokens: parsed["usage"]["prompt_tokens"].as_u64().unwrap_or(0) as u32,
            output_tokens: parsed["usage"]["completion_tokens"].as_u64().unwrap_or(0) as u32,
        };

        Ok(AdaptedResponse { message, stop_reason, usage })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_prompt_becomes_leading_system_message() {
        let encoded = OpenAiAdapter::encode_messages("be helpful", &[Message::user("hi")]);
        assert_eq!(encoded[0]["role"], "system");
        assert_eq!(encoded[0]["content"], "be helpful");
        assert_eq!(encoded[1]["role"], "user");
    }

    #[test]
    fn tool_use_assistant_turn_has_null_content_and_tool_calls_array() {
        let msg = Message::assistant_with_tool_calls(vec![NativeToolCall {
            id: "call_1".to_string(),
            name: "scan__nmap".to_string(),
            arguments: serde_json::json!({"host": "10.0.0.1"}),
        }]);
        let encoded = OpenAiAdapter::encode_messages("sys", &[msg]);
        assert!(encoded[1]["content"].is_null());
        assert_eq!(encoded[1]["tool_calls"][0]["function"]["name"], "scan__nmap");
    }

    #[test]
    fn tool_result_uses_tool_role_and_tool_call_id() {
        let encoded = OpenAiAdapter::encode_messages("sys", &[Message::tool_result("call_1", "5")]);
        assert_eq!(encoded[1]["role"], "tool");
        assert_eq!(encoded[1]["tool_call_id"], "call_1");
        assert_eq!(encoded[1]["content"], "5");
    }

    #[test]
    fn tool_definition_wrapped_in_function_envelope() {
        let tools = vec![ToolDefinition {
            name: "scan__nmap".to_string(),
            description: "scans a host".to_string(),
            parameters_schema: serde_json::json!({"type": "object"}),
        }];
        let encoded = OpenAiAdapter::encode_tools(&tools);
        assert_eq!(encoded[0]["type"], "function");
        assert_eq!(encoded[0]["function"]["name"], "scan__nmap");
    }
}
