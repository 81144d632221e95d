use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::orchestrator::error::OrchestratorError;
use crate::orchestrator::event::TokenUsage;

/// One tool call the model asked to perform, in a provider-neutral
/// shape. `id` round-trips back as the tool-result's correlation id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NativeToolCall {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool { call_id: String },
}

/// The common internal conversational turn. Provider adapters convert
/// a transcript of these to and from their own wire format; nothing
/// downstream of the adapter layer is provider-aware.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Arc<str>,
    #[serde(default)]
    pub tool_calls: Vec<NativeToolCall>,
}

impl Message {
    pub fn system(content: impl Into<Arc<str>>) -> Self {
        Message { role: Role::System, content: content.into(), tool_calls: Vec::new() }
    }

    pub fn user(content: impl Into<Arc<str>>) -> Self {
        Message { role: Role::User, content: content.into(), tool_calls: Vec::new() }
    }

    pub fn assistant(content: impl Into<Arc<str>>) -> Self {
        Message { role: Role::Assistant, content: content.into(), tool_calls: Vec::new() }
    }

    pub fn assistant_with_tool_calls(tool_calls: Vec<NativeToolCall>) -> Self {
        Message { role: Role::Assistant, content: Arc::from(""), tool_calls }
    }

    pub fn tool_result(call_id: impl Into<String>, content: impl Into<Arc<str>>) -> Self {
        Message { role: Role::Tool { call_id: call_id.into() }, content: content.into(), tool_calls: Vec::new() }
    }
}

/// A tool offered to the model, named `<worker>__<tool>` per the
/// synthetic separator convention so tool-use responses can be routed
/// back to (worker, tool) unambiguously.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters_schema: serde_json::Value,
}

pub const TOOL_NAME_SEPARATOR: &str = "__";

pub fn synthesize_tool_name(worker: &str, tool: &str) -> String {
    format!("{}{}{}", worker, TOOL_NAME_SEPARATOR, tool)
}

/// Splits a synthetic `<worker>__<tool>` name back into its parts.
pub fn split_tool_name(synthetic: &str) -> Option<(&str, &str)> {
    synthetic.split_once(TOOL_NAME_SEPARATOR)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    Terminal,
    ToolUse,
}

/// What a provider adapter returns after one round trip: the raw
/// assistant message plus a classification of why it stopped and its
/// token usage, already normalized out of whichever wire shape the
/// provider used (`"end_turn"`/`"stop"` vs `"tool_use"`/`"tool_calls"`,
/// `usage.input_tokens` vs `usage.prompt_tokens`, etc).
#[derive(Debug, Clone)]
pub struct AdaptedResponse {
    pub message: Message,
    pub stop_reason: StopReason,
    pub usage: TokenUsage,
}

/// One configured model: which provider wire format it speaks, which
/// environment variable holds its credential, and its defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub id: String,
    pub provider: ProviderKind,
    pub model_name: String,
    pub api_key_env: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,
    #[serde(default)]
    pub is_default: bool,
}

fn default_timeout_secs() -> u64 {
    120
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Anthropic,
    OpenAi,
    Compatible,
}

/// The wire format an `AgentDefinition` declares it expects its model
/// to speak. Kept distinct from `ModelConfig::provider`: the agent
/// definition is authored independently of (and may be installed
/// before) the model it names, so the two are cross-checked at run
/// time rather than one being derived from the other.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ModelDriver {
    AnthropicStyle,
    OpenaiStyle,
}

impl ModelDriver {
    /// Whether a configured model's provider actually speaks the wire
    /// format this driver declares. `Compatible` models are OpenAI
    /// chat-completions-shaped by construction, so they satisfy
    /// `OpenaiStyle`.
    pub fn matches(&self, provider: ProviderKind) -> bool {
        matches!(
            (self, provider),
            (ModelDriver::AnthropicStyle, ProviderKind::Anthropic)
                | (ModelDriver::OpenaiStyle, ProviderKind::OpenAi)
                | (ModelDriver::OpenaiStyle, ProviderKind::Compatible)
        )
    }
}

/// Read-copy-update singleton over the set of configured models,
/// persisted as `configs/models.yaml`. Writers swap the whole list
/// under the lock so readers never observe a partial update and the
/// "at most one default" invariant never transiently breaks.
pub struct ModelRegistry {
    path: std::path::PathBuf,
    models: RwLock<Vec<ModelConfig>>,
}

impl ModelRegistry {
    pub fn empty(path: impl Into<std::path::PathBuf>) -> Self {
        ModelRegistry { path: path.into(), models: RwLock::new(Vec::new()) }
    }

    pub async fn load(path: impl Into<std::path::PathBuf>) -> Result<Self, OrchestratorError> {
        let path = path.into();
        let models = if path.exists() {
            let raw = tokio::fs::read_to_string(&path).await?;
            serde_yaml::from_str(&raw)
                .map_err(|e| OrchestratorError::Serialization(format!("invalid models.yaml: {}", e)))?
        } else {
            Vec::new()
        };
        Ok(ModelRegistry { path, models: RwLock::new(models) })
    }

    async fn persist(&self, models: &[ModelConfig]) -> Result<(), OrchestratorError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let yaml = serde_yaml::to_string(models)
            .map_err(|e| OrchestratorError::Serialization(format!("failed to encode models.yaml: {}", e)))?;
        tokio::fs::write(&self.path, yaml).await?;
        Ok(())
    }

    pub async fn list(&self) -> Vec<ModelConfig> {
        self.models.read().await.clone()
    }

    pub async fn get(&self, id: &str) -> Result<ModelConfig, OrchestratorError> {
        self.models
            .read()
            .await
            .iter()
            .find(|m| m.id == id)
            .cloned()
            .ok_or_else(|| OrchestratorError::NotFound(format!("model '{}'", id)))
    }

    pub async fn default_model(&self) -> Result<ModelConfig, OrchestratorError> {
        self.models
            .read()
            .await
            .iter()
            .find(|m| m.is_default)
            .cloned()
            .ok_or_else(|| OrchestratorError::NotFound("default model".to_string()))
    }

    pub async fn upsert(&self, model: ModelConfig) -> Result<(), OrchestratorError> {
        let mut guard = self.models.write().await;
        if model.is_default {
            for m in guard.iter_mut() {
                m.is_default = false;
            }
        }
        if let Some(existing) = guard.iter_mut().find(|m| m.id == model.id) {
            *existing = model;
        } else {
            guard.push(model);
        }
        self.persist(&guard).await
    }

    pub async fn delete(&self, id: &str) -> Result<(), OrchestratorError> {
        let mut guard = self.models.write().await;
        let target = guard.iter().find(|m| m.id == id).ok_or_else(|| OrchestratorError::NotFound(format!("model '{}'", id)))?;
        if target.is_default {
            return Err(OrchestratorError::InvalidWorkflow(
                "cannot delete the default model; set a different default first".to_string(),
            ));
        }
        guard.retain(|m| m.id != id);
        self.persist(&guard).await
    }

    /// Transactionally clears `is_default` on every model and sets it
    /// on `id`, so no observer ever sees two defaults at once.
    pub async fn set_default(&self, id: &str) -> Result<(), OrchestratorError> {
        let mut guard = self.models.write().await;
        if !guard.iter().any(|m| m.id == id) {
            return Err(OrchestratorError::NotFound(format!("model '{}'", id)));
        }
        for m in guard.iter_mut() {
            m.is_default = m.id == id;
        }
        self.persist(&guard).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(id: &str, is_default: bool) -> ModelConfig {
        ModelConfig {
            id: id.to_string(),
            provider: ProviderKind::OpenAi,
            model_name: "gpt-test".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            base_url: None,
            default_timeout_secs: 120,
            is_default,
        }
    }

    #[tokio::test]
    async fn at_most_one_default_after_concurrent_upserts() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ModelRegistry::empty(dir.path().join("models.yaml"));
        registry.upsert(sample("a", true)).await.unwrap();
        registry.upsert(sample("b", true)).await.unwrap();
        let models = registry.list().await;
        assert_eq!(models.iter().filter(|m| m.is_default).count(), 1);
        assert_eq!(registry.default_model().await.unwrap().id, "b");
    }

    #[tokio::test]
    async fn deleting_default_model_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ModelRegistry::empty(dir.path().join("models.yaml"));
        registry.upsert(sample("a", true)).await.unwrap();
        assert!(registry.delete("a").await.is_err());
    }

    #[tokio::test]
    async fn set_default_swaps_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ModelRegistry::empty(dir.path().join("models.yaml"));
        registry.upsert(sample("a", true)).await.unwrap();
        registry.upsert(sample("b", false)).await.unwrap();
        registry.set_default("b").await.unwrap();
        let models = registry.list().await;
        assert!(!models.iter().find(|m| m.id == "a").unwrap().is_default);
        assert!(models.iter().find(|m| m.id == "b").unwrap().is_default);
    }

    #[tokio::test]
    async fn load_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("models.yaml");
        let registry = ModelRegistry::empty(path.clone());
        registry.upsert(sample("a", true)).await.unwrap();
        let reloaded = ModelRegistry::load(path).await.unwrap();
        assert_eq!(reloaded.list().await.len(), 1);
    }

    #[test]
    fn tool_name_round_trips() {
        let synthetic = synthesize_tool_name("scan", "nmap");
        assert_eq!(synthetic, "scan__nmap");
        assert_eq!(split_tool_name(&synthetic), Some(("scan", "nmap")));
    }

    #[test]
    fn model_driver_matches_its_wire_compatible_providers() {
        assert!(ModelDriver::AnthropicStyle.matches(ProviderKind::Anthropic));
        assert!(!ModelDriver::AnthropicStyle.matches(ProviderKind::OpenAi));
        assert!(ModelDriver::OpenaiStyle.matches(ProviderKind::OpenAi));
        assert!(ModelDriver::OpenaiStyle.matches(ProviderKind::Compatible));
        assert!(!ModelDriver::OpenaiStyle.matches(ProviderKind::Anthropic));
    }

    #[test]
    fn model_driver_serializes_with_spec_literal_names() {
        assert_eq!(serde_json::to_string(&ModelDriver::AnthropicStyle).unwrap(), "\"anthropic-style\"");
        assert_eq!(serde_json::to_string(&ModelDriver::OpenaiStyle).unwrap(), "\"openai-style\"");
    }
}
