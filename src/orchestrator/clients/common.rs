use std::time::Duration;

use lazy_static::lazy_static;

use crate::orchestrator::error::OrchestratorError;
use crate::orchestrator::llm::ModelConfig;

lazy_static! {
    /// Shared pooled client for every provider adapter, tuned the same
    /// way the worker- and catalog-facing clients are: long idle
    /// timeout, generous per-host pool, keepalive on, so repeated LLM
    /// calls in one agent loop reuse the same TLS session.
    static ref SHARED_PROVIDER_HTTP_CLIENT: reqwest::Client = reqwest::Client::builder()
        .pool_idle_timeout(Duration::from_secs(90))
        .pool_max_idle_per_host(32)
        .tcp_keepalive(Duration::from_secs(60))
        .build()
        .expect("failed to build shared provider HTTP client");
}

pub fn shared_provider_http_client() -> reqwest::Client {
    SHARED_PROVIDER_HTTP_CLIENT.clone()
}

pub fn resolve_api_key(model: &ModelConfig) -> Result<String, OrchestratorError> {
    std::env::var(&model.api_key_env).map_err(|_| {
        OrchestratorError::LlmAuthError(format!(
            "environment variable '{}' is not set for model '{}'",
            model.api_key_env, model.id
        ))
    })
}

pub fn call_timeout(model: &ModelConfig) -> Duration {
    Duration::from_secs(model.default_timeout_secs)
}

/// Maps an HTTP status from a provider into the taxonomy AgentRuntime
/// expects to see, so both adapters classify failures identically.
pub fn classify_http_status(status: reqwest::StatusCode, body: &str) -> OrchestratorError {
    match status.as_u16() {
        401 | 403 => OrchestratorError::LlmAuthError(body.to_string()),
        429 => OrchestratorError::LlmQuota(body.to_string()),
        400 if body.to_lowercase().contains("content") => OrchestratorError::LlmBlocked(body.to_string()),
        _ => OrchestratorError::LlmAuthError(format!("status {}: {}", status, body)),
    }
}
