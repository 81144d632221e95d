use serde::{Deserialize, Serialize};

use crate::orchestrator::clients::adapter_for;
use crate::orchestrator::error::OrchestratorError;
use crate::orchestrator::event::{StreamEvent, ToolUseSummary};
use crate::orchestrator::llm::{
    split_tool_name, synthesize_tool_name, Message, ModelConfig, ModelDriver, StopReason, ToolDefinition,
};
use crate::orchestrator::workflow::ExecutionContext;
use crate::orchestrator::worker::{WorkerClient, WorkerRegistry};

const DEFAULT_MAX_ITERATIONS: u32 = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDefinition {
    pub id: String,
    pub system_prompt: String,
    pub model_id: String,
    #[serde(default = "default_model_driver")]
    pub model_driver: ModelDriver,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    pub tool_scope: Vec<String>,
}

fn default_max_iterations() -> u32 {
    DEFAULT_MAX_ITERATIONS
}

/// Agent definitions predating `model_driver` assume anthropic-style,
/// the original and still most common wire format in this package.
fn default_model_driver() -> ModelDriver {
    ModelDriver::AnthropicStyle
}

/// Drives the LLM tool-use loop for one agent: offers the flattened
/// tool catalog of every in-scope worker, round-trips through the
/// provider adapter, dispatches any requested tool calls back to the
/// worker that owns them, and repeats until a terminal stop reason or
/// the iteration budget is exhausted.
pub struct AgentRuntime<'a> {
    registry: &'a WorkerRegistry,
}

pub struct AgentOutcome {
    pub final_text: String,
    pub transcript: Vec<Message>,
    pub hit_iteration_limit: bool,
}

impl<'a> AgentRuntime<'a> {
    pub fn new(registry: &'a WorkerRegistry) -> Self {
        AgentRuntime { registry }
    }

    async fn build_tool_catalog(&self, tool_scope: &[String]) -> Vec<(String, ToolDefinition)> {
        let mut catalog = Vec::new();
        for worker_name in tool_scope {
            let worker = match self.registry.get(worker_name).await {
                Ok(w) => w,
                Err(e) => {
                    log::warn!("agent tool_scope references unavailable worker '{}': {}", worker_name, e);
                    continue;
                }
            };
            for tool in &worker.tools {
                catalog.push((
                    worker_name.clone(),
                    ToolDefinition {
                        name: synthesize_tool_name(worker_name, &tool.name),
                        description: tool.description.clone(),
                        parameters_schema: tool.input_schema.clone(),
                    },
                ));
            }
        }
        catalog
    }

    pub async fn run(
        &self,
        agent: &AgentDefinition,
        model: &ModelConfig,
        user_message: &str,
        mut history: Vec<Message>,
        ctx: &ExecutionContext,
    ) -> Result<AgentOutcome, OrchestratorError> {
        if !agent.model_driver.matches(model.provider) {
            return Err(OrchestratorError::InvalidWorkflow(format!(
                "agent '{}' declares model_driver {:?} but model '{}' speaks {:?}",
                agent.id, agent.model_driver, model.id, model.provider
            )));
        }
        let adapter = adapter_for(model);
        let catalog = self.build_tool_catalog(&agent.tool_scope).await;
        let tool_definitions: Vec<ToolDefinition> = catalog.iter().map(|(_, t)| t.clone()).collect();

        history.push(Message::user(user_message.to_string()));

        let mut iteration: u32 = 1;
        loop {
            if ctx.is_cancelled() {
                return Err(OrchestratorError::ExecutionCancelled);
            }

            let response = adapter
                .send(&agent.system_prompt, &history, &tool_definitions, model)
                .await?;

            let tools_used: Vec<ToolUseSummary> = response
                .message
                .tool_calls
                .iter()
                .map(|tc| ToolUseSummary { name: tc.name.clone(), summary: tc.arguments.to_string() })
                .collect();

            let stop_reason_str = match response.stop_reason {
                StopReason::Terminal => "terminal",
                StopReason::ToolUse => "tool_use",
            };

            ctx.emit(StreamEvent::AgentIteration {
                iteration,
                max_iterations: agent.max_iterations,
                stop_reason: stop_reason_str.to_string(),
                token_usage: response.usage,
                model: model.id.clone(),
                tools_used,
            })
            .await;

            match response.stop_reason {
                StopReason::Terminal => {
                    let final_text = response.message.content.to_string();
                    history.push(response.message);
                    ctx.emit(StreamEvent::AgentComplete { final_text: final_text.clone(), flag: None }).await;
                    return Ok(AgentOutcome { final_text, transcript: history, hit_iteration_limit: false });
                }
                StopReason::ToolUse => {
                    let tool_calls = response.message.tool_calls.clone();
                    history.push(response.message);

                    for call in &tool_calls {
                        let (worker_name, tool_name) = match split_tool_name(&call.name) {
                            Some(parts) => parts,
                            None => {
                                history.push(Message::tool_result(
                                    call.id.clone(),
                                    format!("error: malformed tool name '{}'", call.name),
                                ));
                                continue;
                            }
                        };

                        let worker = match self.registry.get(worker_name).await {
                            Ok(w) => w,
                            Err(e) => {
                                history.push(Message::tool_result(call.id.clone(), format!("error: {}", e)));
                                continue;
                            }
                        };

                        let client = WorkerClient::new(&worker.name, &worker.endpoint);
                        let result = client.call_tool(tool_name, call.arguments.clone()).await;

                        let summary_text = match &result {
                            Ok(v) => v.to_string(),
                            Err(e) => format!("error: {}", e),
                        };
                        ctx.emit(StreamEvent::ToolExecution {
                            worker: worker_name.to_string(),
                            tool: tool_name.to_string(),
                            summary: summary_text.clone(),
                        })
                        .await;

                        history.push(Message::tool_result(call.id.clone(), summary_text));
                    }

                    if iteration >= agent.max_iterations {
                        let final_text = history
                            .iter()
                            .rev()
                            .find(|m| matches!(m.role, crate::orchestrator::llm::Role::Assistant))
                            .map(|m| m.content.to_string())
                            .unwrap_or_default();
                        ctx.emit(StreamEvent::AgentComplete {
                            final_text: final_text.clone(),
                            flag: Some("max_iterations_exceeded".to_string()),
                        })
                        .await;
                        return Ok(AgentOutcome { final_text, transcript: history, hit_iteration_limit: true });
                    }

                    iteration += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_definition_defaults_max_iterations() {
        let json = serde_json::json!({
            "id": "a1",
            "system_prompt": "be helpful",
            "model_id": "gpt",
            "tool_scope": []
        });
        let def: AgentDefinition = serde_json::from_value(json).unwrap();
        assert_eq!(def.max_iterations, DEFAULT_MAX_ITERATIONS);
        assert_eq!(def.model_driver, crate::orchestrator::llm::ModelDriver::AnthropicStyle);
    }
}
