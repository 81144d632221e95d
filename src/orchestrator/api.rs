//! HTTP + streaming surface. Routes only validate request bodies and
//! dispatch to the engines in `agent`, `team`, `workflow`, `package`,
//! and `container` — no business logic lives here, matching the "thin
//! API layer" discipline already used by the package's own MCP HTTP
//! adapter.

use std::path::PathBuf;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::orchestrator::agent::{AgentDefinition, AgentRuntime};
use crate::orchestrator::container::{ContainerManager, ResourceKind};
use crate::orchestrator::error::OrchestratorError;
use crate::orchestrator::event::{ControlMessage, EventObserver, StreamEvent};
use crate::orchestrator::llm::ModelConfig;
use crate::orchestrator::package::{Keyring, PackageInstaller};
use crate::orchestrator::session::SessionBroker;
use crate::orchestrator::team::{TeamDefinition, TeamRuntime};
use crate::orchestrator::worker::WorkerRegistry;
use crate::orchestrator::workflow::Workflow;

/// Construction-time dependencies of the API — every route takes these
/// from `State`, never from a global singleton (see Design Note
/// "Replacing global mutable state").
pub struct AppState {
    pub workers: Arc<WorkerRegistry>,
    pub models: Arc<crate::orchestrator::llm::ModelRegistry>,
    pub containers: Arc<ContainerManager>,
    pub keyring: Arc<Keyring>,
    pub catalog_base_url: String,
    pub install_root: PathBuf,
    pub workflows_dir: PathBuf,
    pub agent_defs_dir: PathBuf,
    pub team_defs_dir: PathBuf,
    pub observer: Arc<dyn EventObserver>,
}

impl AppState {
    fn broker(&self, session_id: impl Into<String>) -> SessionBroker {
        SessionBroker::new(session_id).with_observer(self.observer.clone())
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/mcp/servers", get(list_workers))
        .route("/mcp/servers/{name}/tools", post(worker_tools))
        .route("/workflows/execute", post(execute_workflow))
        .route("/workflows", get(list_workflows))
        .route("/agents/run", post(run_agent))
        .route("/teams/run", post(run_team))
        .route("/chat", post(chat))
        .route("/registries/install/{kind}/{package_id}", post(install_package))
        .route("/registries/catalog", get(catalog))
        .route("/models", get(list_models).post(create_model))
        .route("/models/{id}", put(update_model).delete(delete_model))
        .route("/models/{id}/set-default", post(set_default_model))
        .route("/sessions/{session_id}/stream", get(stream_session))
        .with_state(state)
}

fn error_status(err: &OrchestratorError) -> StatusCode {
    match err {
        OrchestratorError::NotFound(_) => StatusCode::NOT_FOUND,
        OrchestratorError::InvalidWorkflow(_) | OrchestratorError::UnresolvedReference { .. } => StatusCode::BAD_REQUEST,
        OrchestratorError::UntrustedPublisher { .. }
        | OrchestratorError::InvalidSignature { .. }
        | OrchestratorError::ChecksumMismatch { .. } => StatusCode::FORBIDDEN,
        OrchestratorError::LlmAuthError(_) => StatusCode::UNAUTHORIZED,
        OrchestratorError::LlmQuota(_) => StatusCode::TOO_MANY_REQUESTS,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(err: OrchestratorError) -> axum::response::Response {
    let status = error_status(&err);
    (status, Json(json!({ "error": err.sanitized_message(), "kind": err.kind() }))).into_response()
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "healthy" }))
}

async fn list_workers(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let workers: Vec<Value> = state
        .workers
        .list()
        .await
        .into_iter()
        .map(|w| json!({ "name": w.name, "endpoint": w.endpoint, "description": w.description }))
        .collect();
    Json(json!({ "workers": workers }))
}

async fn worker_tools(State(state): State<Arc<AppState>>, Path(name): Path<String>) -> axum::response::Response {
    match state.workers.get(&name).await {
        Ok(worker) => Json(json!({ "tools": worker.tools })).into_response(),
        Err(e) => error_response(e),
    }
}

async fn execute_workflow(State(state): State<Arc<AppState>>, Json(workflow): Json<Workflow>) -> axum::response::Response {
    let broker = state.broker(uuid::Uuid::new_v4().to_string());
    let handle = broker.start_execution();
    tokio::spawn(drain_events(handle.events));

    let engine = crate::orchestrator::workflow::WorkflowEngine::new(&state.workers);
    match engine.execute(&workflow, &handle.ctx).await {
        Ok(results) => Json(json!({ "status": "completed", "results": results })).into_response(),
        Err(e) => error_response(e),
    }
}

async fn list_workflows(State(state): State<Arc<AppState>>) -> axum::response::Response {
    match read_dir_json(&state.workflows_dir).await {
        Ok(workflows) => Json(json!({ "workflows": workflows })).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
struct RunAgentRequest {
    agent: AgentDefinition,
    message: String,
    #[serde(default)]
    history: Vec<ChatTurn>,
}

async fn run_agent(State(state): State<Arc<AppState>>, Json(req): Json<RunAgentRequest>) -> axum::response::Response {
    let model = match state.models.get(&req.agent.model_id).await {
        Ok(m) => m,
        Err(e) => return error_response(e),
    };

    let broker = state.broker(uuid::Uuid::new_v4().to_string());
    let handle = broker.start_execution();
    tokio::spawn(drain_events(handle.events));

    let runtime = AgentRuntime::new(&state.workers);
    let history = req.history.into_iter().map(ChatTurn::into_message).collect();
    match runtime.run(&req.agent, &model, &req.message, history, &handle.ctx).await {
        Ok(outcome) => Json(json!({ "final_text": outcome.final_text, "hit_iteration_limit": outcome.hit_iteration_limit }))
            .into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
struct RunTeamRequest {
    team: TeamDefinition,
    message: String,
}

async fn run_team(State(state): State<Arc<AppState>>, Json(req): Json<RunTeamRequest>) -> axum::response::Response {
    let broker = state.broker(uuid::Uuid::new_v4().to_string());
    let handle = broker.start_execution();
    tokio::spawn(drain_events(handle.events));

    let runtime = TeamRuntime::new(&state.workers, &state.models);
    match runtime.run(&req.team, &req.message, &handle.ctx).await {
        Ok(reply) => Json(json!({ "reply": reply })).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
struct ChatTurn {
    role: String,
    content: String,
}

impl ChatTurn {
    fn into_message(self) -> crate::orchestrator::llm::Message {
        match self.role.as_str() {
            "assistant" => crate::orchestrator::llm::Message::assistant(self.content),
            _ => crate::orchestrator::llm::Message::user(self.content),
        }
    }
}

const CHAT_HISTORY_LIMIT: usize = 10;

#[derive(Debug, Deserialize)]
struct ChatRequest {
    team_id: String,
    message: String,
    #[serde(default)]
    history: Vec<ChatTurn>,
}

/// Loads the named team definition from disk and runs it, forwarding
/// only the last ten history turns to the LLM per the chat contract.
async fn chat(State(state): State<Arc<AppState>>, Json(req): Json<ChatRequest>) -> axum::response::Response {
    let path = state.team_defs_dir.join(format!("{}.json", req.team_id));
    let team: TeamDefinition = match read_json_file(&path).await {
        Ok(t) => t,
        Err(e) => return error_response(e),
    };

    let mut history = req.history;
    if history.len() > CHAT_HISTORY_LIMIT {
        history = history.split_off(history.len() - CHAT_HISTORY_LIMIT);
    }

    let broker = state.broker(uuid::Uuid::new_v4().to_string());
    let handle = broker.start_execution();
    tokio::spawn(drain_events(handle.events));

    let runtime = TeamRuntime::new(&state.workers, &state.models);
    let history_messages = history.into_iter().map(ChatTurn::into_message).collect();
    match runtime.run_with_history(&team, &req.message, history_messages, &handle.ctx).await {
        Ok(reply) => Json(json!({ "reply": reply })).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize, Default)]
struct InstallRequest {
    #[serde(default)]
    workflow_id: Option<String>,
    #[serde(default)]
    team_id: Option<String>,
}

async fn install_package(
    State(state): State<Arc<AppState>>,
    Path((kind, package_id)): Path<(String, String)>,
    body: Bytes,
) -> axum::response::Response {
    let kind = match kind.as_str() {
        "agent" => ResourceKind::Agent,
        "mcp" => ResourceKind::Mcp,
        "team" => ResourceKind::Team,
        "trigger" => ResourceKind::Trigger,
        other => {
            return error_response(OrchestratorError::InvalidWorkflow(format!("unknown package kind '{}'", other)))
        }
    };

    let (name, version) = match package_id.rsplit_once('-') {
        Some(parts) => parts,
        None => {
            return error_response(OrchestratorError::InvalidWorkflow(format!(
                "package id '{}' must be '<name>-<version>'",
                package_id
            )))
        }
    };

    let req: InstallRequest =
        if body.is_empty() { InstallRequest::default() } else { serde_json::from_slice(&body).unwrap_or_default() };
    if kind == ResourceKind::Trigger {
        match (&req.workflow_id, &req.team_id) {
            (Some(_), None) | (None, Some(_)) => {}
            _ => {
                return error_response(OrchestratorError::InvalidWorkflow(
                    "trigger install requires exactly one of workflow_id or team_id".to_string(),
                ))
            }
        }
    }

    let trigger_target = match (&req.workflow_id, &req.team_id) {
        (Some(id), None) => Some(("WORKFLOW_ID".to_string(), id.clone())),
        (None, Some(id)) => Some(("TEAM_ID".to_string(), id.clone())),
        _ => None,
    };
    let trigger_target_ref = trigger_target.as_ref().map(|(k, v)| (k.as_str(), v.as_str()));

    let installer =
        PackageInstaller::new(state.catalog_base_url.clone(), state.install_root.clone(), &state.keyring, &state.containers);
    match installer.install(kind, name, version, trigger_target_ref).await {
        Ok(()) => Json(json!({ "installed": format!("{:?}/{}@{}", kind, name, version) })).into_response(),
        Err(e) => error_response(e),
    }
}

async fn catalog(State(state): State<Arc<AppState>>) -> axum::response::Response {
    let mut entries = Vec::new();
    for kind_label in ["agents", "mcps", "teams", "triggers"] {
        let kind_dir = state.install_root.join(kind_label);
        let Ok(mut names) = tokio::fs::read_dir(&kind_dir).await else { continue };
        while let Ok(Some(name_entry)) = names.next_entry().await {
            let Ok(mut versions) = tokio::fs::read_dir(name_entry.path()).await else { continue };
            while let Ok(Some(version_entry)) = versions.next_entry().await {
                let metadata_path = version_entry.path().join("metadata.json");
                if let Ok(raw) = tokio::fs::read_to_string(&metadata_path).await {
                    if let Ok(metadata) = serde_json::from_str::<Value>(&raw) {
                        entries.push(json!({
                            "kind": kind_label,
                            "name": name_entry.file_name().to_string_lossy(),
                            "version": version_entry.file_name().to_string_lossy(),
                            "metadata": metadata,
                        }));
                    }
                }
            }
        }
    }
    Json(json!({ "packages": entries }))
}

async fn list_models(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({ "models": state.models.list().await }))
}

async fn create_model(State(state): State<Arc<AppState>>, Json(model): Json<ModelConfig>) -> axum::response::Response {
    match state.models.upsert(model).await {
        Ok(()) => StatusCode::CREATED.into_response(),
        Err(e) => error_response(e),
    }
}

async fn update_model(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(mut model): Json<ModelConfig>,
) -> axum::response::Response {
    model.id = id;
    match state.models.upsert(model).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e),
    }
}

async fn delete_model(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> axum::response::Response {
    match state.models.delete(&id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e),
    }
}

async fn set_default_model(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> axum::response::Response {
    match state.models.set_default(&id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e),
    }
}

async fn read_dir_json(dir: &std::path::Path) -> Result<Vec<Value>, OrchestratorError> {
    let mut out = Vec::new();
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else { return Ok(out) };
    while let Some(entry) = entries.next_entry().await? {
        if entry.path().extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let raw = tokio::fs::read_to_string(entry.path()).await?;
        out.push(serde_json::from_str(&raw).map_err(OrchestratorError::from)?);
    }
    Ok(out)
}

async fn read_json_file<T: serde::de::DeserializeOwned>(path: &std::path::Path) -> Result<T, OrchestratorError> {
    if !path.exists() {
        return Err(OrchestratorError::NotFound(format!("{}", path.display())));
    }
    let raw = tokio::fs::read_to_string(path).await?;
    serde_json::from_str(&raw).map_err(OrchestratorError::from)
}

/// Consumes the event stream of a one-shot (non-streaming) HTTP run so
/// that the bounded channel never fills and blocks the engine. Events
/// are simply logged at debug; the HTTP handler already returns the
/// terminal result directly.
async fn drain_events(mut events: tokio::sync::mpsc::Receiver<StreamEvent>) {
    while let Some(event) = events.recv().await {
        log::debug!("event dropped on synchronous run: {:?}", event);
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum SessionRequest {
    RunWorkflow { workflow: Workflow },
    RunAgent { agent: AgentDefinition, message: String },
    RunTeam { team: TeamDefinition, message: String },
}

async fn stream_session(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_session_socket(socket, state, session_id))
}

/// One streaming session: the first client message selects which
/// engine to drive (workflow/agent/team); subsequent messages are
/// treated as control messages (currently only `cancel_execution`).
/// Events are relayed to the client in emission order; see
/// SessionBroker's ordering guarantee.
async fn handle_session_socket(mut socket: WebSocket, state: Arc<AppState>, session_id: String) {
    let broker = state.broker(session_id.clone());
    let handle = broker.start_execution();
    let execution_id = handle.ctx.execution_id.clone();

    let started = serde_json::to_string(&StreamEvent::ExecutionStarted { execution_id: execution_id.clone() })
        .unwrap_or_default();
    if socket.send(WsMessage::Text(started.into())).await.is_err() {
        return;
    }

    let first = match socket.recv().await {
        Some(Ok(WsMessage::Text(text))) => text,
        _ => return,
    };
    let request: SessionRequest = match serde_json::from_str(&first) {
        Ok(r) => r,
        Err(e) => {
            let _ = send_event(&mut socket, &StreamEvent::Error { message: e.to_string(), kind: None }).await;
            return;
        }
    };

    let cancel_flag = handle.ctx.cancel_handle();
    let mut events = handle.events;
    let ctx = handle.ctx;

    let run = async move {
        match request {
            SessionRequest::RunWorkflow { workflow } => {
                let engine = crate::orchestrator::workflow::WorkflowEngine::new(&state.workers);
                engine.execute(&workflow, &ctx).await.map(|r| json!(r))
            }
            SessionRequest::RunAgent { agent, message } => {
                let model = state.models.get(&agent.model_id).await?;
                let runtime = AgentRuntime::new(&state.workers);
                runtime.run(&agent, &model, &message, Vec::new(), &ctx).await.map(|o| json!({ "final_text": o.final_text }))
            }
            SessionRequest::RunTeam { team, message } => {
                let runtime = TeamRuntime::new(&state.workers, &state.models);
                runtime.run(&team, &message, &ctx).await.map(|reply| json!({ "reply": reply }))
            }
        }
    };

    let run_handle = tokio::spawn(run);

    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Some(event) => {
                        if send_event(&mut socket, &event).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(WsMessage::Text(text))) => {
                        if let Ok(ControlMessage::CancelExecution { execution_id: target }) = serde_json::from_str(&text) {
                            if target == execution_id {
                                cancel_flag.store(true, std::sync::atomic::Ordering::SeqCst);
                            }
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    _ => {}
                }
            }
        }
    }

    let result = run_handle.await.unwrap_or_else(|_| Err(OrchestratorError::ExecutionCancelled));
    let terminal = SessionBroker::terminal_event(&result);
    let _ = send_event(&mut socket, &terminal).await;
}

async fn send_event(socket: &mut WebSocket, event: &StreamEvent) -> Result<(), axum::Error> {
    let text = serde_json::to_string(event).unwrap_or_default();
    socket.send(WsMessage::Text(text.into())).await
}
