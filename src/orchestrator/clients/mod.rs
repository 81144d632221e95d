pub mod anthropic;
pub mod common;
pub mod openai;

use async_trait::async_trait;

use crate::orchestrator::error::OrchestratorError;
use crate::orchestrator::llm::{AdaptedResponse, Message, ModelConfig, ToolDefinition};

/// One HTTP round trip to an LLM provider, in the provider's own wire
/// format. Everything upstream of this trait (AgentRuntime, TeamRuntime)
/// deals only in the common `Message`/`ToolDefinition` shapes; only the
/// concrete adapter knows the bit-exact table that separates the two
/// supported providers.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    async fn send(
        &self,
        system_prompt: &str,
        transcript: &[Message],
        tools: &[ToolDefinition],
        model: &ModelConfig,
    ) -> Result<AdaptedResponse, OrchestratorError>;
}

pub fn adapter_for(model: &ModelConfig) -> Box<dyn ProviderAdapter> {
    use crate::orchestrator::llm::ProviderKind;
    match model.provider {
        ProviderKind::Anthropic => Box::new(anthropic::AnthropicAdapter::new()),
        ProviderKind::OpenAi | ProviderKind::Compatible => Box::new(openai::OpenAiAdapter::new()),
    }
}
