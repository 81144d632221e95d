use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::orchestrator::error::OrchestratorError;

lazy_static! {
    /// One pooled HTTP client shared by every `WorkerClient`, so TLS and
    /// DNS state stay warm across many workers instead of being
    /// re-negotiated per call.
    static ref SHARED_WORKER_HTTP_CLIENT: reqwest::Client = reqwest::Client::builder()
        .pool_idle_timeout(Duration::from_secs(90))
        .pool_max_idle_per_host(32)
        .tcp_keepalive(Duration::from_secs(60))
        .build()
        .expect("failed to build shared worker HTTP client");
}

pub fn shared_worker_http_client() -> reqwest::Client {
    SHARED_WORKER_HTTP_CLIENT.clone()
}

const WORKER_CALL_TIMEOUT_SECS: u64 = 600;

/// A callable operation advertised by a worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// One registered MCP worker: a name, an endpoint, and its last-known
/// tool catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub name: String,
    pub endpoint: String,
    pub description: String,
    pub tools: Vec<ToolSchema>,
    pub last_healthy_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl Worker {
    pub fn new(name: impl Into<String>, endpoint: impl Into<String>, description: impl Into<String>) -> Self {
        Worker {
            name: name.into(),
            endpoint: endpoint.into(),
            description: description.into(),
            tools: Vec::new(),
            last_healthy_at: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ListToolsResponse {
    tools: Vec<ToolSchema>,
}

#[derive(Debug, Deserialize)]
struct CatalogEntry {
    name: String,
    endpoint: String,
    #[serde(default)]
    description: String,
}

/// Typed HTTP client to a single worker. A pure forward: arguments and
/// results pass through as opaque JSON, never interpreted.
pub struct WorkerClient {
    worker_name: String,
    endpoint: String,
    http: reqwest::Client,
}

impl WorkerClient {
    pub fn new(worker_name: impl Into<String>, endpoint: impl Into<String>) -> Self {
        WorkerClient {
            worker_name: worker_name.into(),
            endpoint: endpoint.into(),
            http: shared_worker_http_client(),
        }
    }

    pub async fn list_tools(&self) -> Result<Vec<ToolSchema>, OrchestratorError> {
        let url = format!("{}/tools/list", self.endpoint.trim_end_matches('/'));
        let resp = self
            .http
            .post(&url)
            .json(&serde_json::json!({}))
            .timeout(Duration::from_secs(WORKER_CALL_TIMEOUT_SECS))
            .send()
            .await
            .map_err(|e| OrchestratorError::WorkerUnreachable {
                worker: self.worker_name.clone(),
                detail: e.to_string(),
            })?;

        if !resp.status().is_success() {
            return Err(OrchestratorError::WorkerProtocolError {
                worker: self.worker_name.clone(),
                detail: format!("list_tools returned status {}", resp.status()),
            });
        }

        let parsed: ListToolsResponse = resp.json().await.map_err(|e| OrchestratorError::WorkerProtocolError {
            worker: self.worker_name.clone(),
            detail: e.to_string(),
        })?;
        Ok(parsed.tools)
    }

    pub async fn call_tool(
        &self,
        tool_name: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, OrchestratorError> {
        let url = format!("{}/tools/execute", self.endpoint.trim_end_matches('/'));
        let body = serde_json::json!({ "tool": tool_name, "arguments": arguments });

        let resp = self
            .http
            .post(&url)
            .json(&body)
            .timeout(Duration::from_secs(WORKER_CALL_TIMEOUT_SECS))
            .send()
            .await
            .map_err(|e| OrchestratorError::WorkerUnreachable {
                worker: self.worker_name.clone(),
                detail: e.to_string(),
            })?;

        let status = resp.status();
        let text = resp.text().await.map_err(|e| OrchestratorError::WorkerProtocolError {
            worker: self.worker_name.clone(),
            detail: e.to_string(),
        })?;

        if status.as_u16() >= 400 {
            return Err(OrchestratorError::ToolError {
                worker: self.worker_name.clone(),
                tool: tool_name.to_string(),
                body: text,
            });
        }

        serde_json::from_str(&text).map_err(|e| OrchestratorError::WorkerProtocolError {
            worker: self.worker_name.clone(),
            detail: format!("invalid JSON from call_tool: {}", e),
        })
    }

    /// Lightweight liveness probe. A failure here does not propagate as
    /// `worker_unreachable` — the caller (WorkerRegistry refresh) just
    /// leaves the worker registered with an empty tool list.
    pub async fn health(&self) -> bool {
        let url = format!("{}/health", self.endpoint.trim_end_matches('/'));
        match self.http.get(&url).timeout(Duration::from_secs(5)).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }
}

/// Single-writer in-memory set of registered workers. Reads never
/// block behind other reads; mutation (register/unregister/refresh)
/// is serialized by the inner `RwLock`.
pub struct WorkerRegistry {
    workers: RwLock<HashMap<String, Worker>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        WorkerRegistry { workers: RwLock::new(HashMap::new()) }
    }

    pub async fn register(&self, worker: Worker) {
        log::info!("registering worker '{}' at {}", worker.name, worker.endpoint);
        self.workers.write().await.insert(worker.name.clone(), worker);
    }

    /// Loads the on-disk worker catalog (a JSON array of `{name,
    /// endpoint, description}` entries) and registers each one with an
    /// empty tool list. Missing catalog files are treated as an empty
    /// catalog, not an error — a freshly installed orchestrator has none.
    pub async fn load_catalog(&self, path: &std::path::Path) -> Result<usize, OrchestratorError> {
        if !path.exists() {
            return Ok(0);
        }
        let raw = tokio::fs::read_to_string(path).await?;
        let entries: Vec<CatalogEntry> = serde_json::from_str(&raw)
            .map_err(|e| OrchestratorError::Serialization(format!("invalid worker catalog: {}", e)))?;
        let count = entries.len();
        for entry in entries {
            self.register(Worker::new(entry.name, entry.endpoint, entry.description)).await;
        }
        Ok(count)
    }

    pub async fn unregister(&self, name: &str) {
        log::info!("unregistering worker '{}'", name);
        self.workers.write().await.remove(name);
    }

    pub async fn get(&self, name: &str) -> Result<Worker, OrchestratorError> {
        self.workers
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| OrchestratorError::NotFound(format!("worker '{}'", name)))
    }

    pub async fn list(&self) -> Vec<Worker> {
        self.workers.read().await.values().cloned().collect()
    }

    /// Calls the worker's `list_tools` and replaces its cached tool
    /// list. Failure is logged and the worker is left registered with
    /// whatever tools it last reported (possibly empty).
    pub async fn refresh_tools(&self, name: &str) {
        let endpoint = match self.workers.read().await.get(name) {
            Some(w) => w.endpoint.clone(),
            None => return,
        };
        let client = WorkerClient::new(name, endpoint);
        let healthy = client.health().await;
        match client.list_tools().await {
            Ok(tools) => {
                let mut guard = self.workers.write().await;
                if let Some(w) = guard.get_mut(name) {
                    w.tools = tools;
                    if healthy {
                        w.last_healthy_at = Some(chrono::Utc::now());
                    }
                }
            }
            Err(e) => {
                log::warn!("refresh_tools for '{}' failed: {}", name, e);
                if healthy {
                    let mut guard = self.workers.write().await;
                    if let Some(w) = guard.get_mut(name) {
                        w.last_healthy_at = Some(chrono::Utc::now());
                    }
                }
            }
        }
    }

    /// Concurrently refreshes every registered worker; used at
    /// startup after loading the on-disk catalog.
    pub async fn refresh_all(self: &Arc<Self>) {
        let names: Vec<String> = self.workers.read().await.keys().cloned().collect();
        let mut handles = Vec::with_capacity(names.len());
        for name in names {
            let registry = Arc::clone(self);
            handles.push(tokio::spawn(async move {
                registry.refresh_tools(&name).await;
            }));
        }
        for h in handles {
            let _ = h.await;
        }
    }
}

impl Default for WorkerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_and_get_roundtrip() {
        let registry = WorkerRegistry::new();
        registry.register(Worker::new("scan", "http://localhost:9001", "scanner")).await;
        let w = registry.get("scan").await.unwrap();
        assert_eq!(w.name, "scan");
        assert!(registry.get("missing").await.is_err());
    }

    #[tokio::test]
    async fn unregister_removes_worker() {
        let registry = WorkerRegistry::new();
        registry.register(Worker::new("scan", "http://localhost:9001", "scanner")).await;
        registry.unregister("scan").await;
        assert!(registry.get("scan").await.is_err());
    }

    #[tokio::test]
    async fn list_returns_all_registered() {
        let registry = WorkerRegistry::new();
        registry.register(Worker::new("a", "http://localhost:1", "")).await;
        registry.register(Worker::new("b", "http://localhost:2", "")).await;
        assert_eq!(registry.list().await.len(), 2);
    }

    #[tokio::test]
    async fn load_catalog_registers_every_entry_with_empty_tools() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("workers.json");
        tokio::fs::write(
            &path,
            r#"[{"name":"scan","endpoint":"http://scan:9000","description":"scanner"}]"#,
        )
        .await
        .unwrap();

        let registry = WorkerRegistry::new();
        let count = registry.load_catalog(&path).await.unwrap();
        assert_eq!(count, 1);
        let w = registry.get("scan").await.unwrap();
        assert!(w.tools.is_empty());
    }

    #[tokio::test]
    async fn missing_catalog_file_is_not_an_error() {
        let registry = WorkerRegistry::new();
        let count = registry.load_catalog(std::path::Path::new("/nonexistent/workers.json")).await.unwrap();
        assert_eq!(count, 0);
    }
}
