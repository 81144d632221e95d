//! Shared stub worker used by the cross-component scenario tests
//! (S1-S6). A minimal in-process axum server bound to an ephemeral
//! port, standing in for a real MCP worker container.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};

#[derive(Clone)]
pub enum StubTool {
    Ok(Value),
    /// Echoes back whatever `arguments` it was called with.
    Echo,
    Fail(u16, String),
    /// Sleeps before responding, for cancel-mid-run tests.
    Delay(Duration, Value),
}

struct StubState {
    tools: Vec<Value>,
    behavior: HashMap<String, StubTool>,
}

#[derive(serde::Deserialize)]
struct ExecuteRequest {
    tool: String,
    arguments: Value,
}

/// Starts a stub worker exposing `/health`, `/tools/list`, and
/// `/tools/execute`, returning its `http://127.0.0.1:<port>` endpoint
/// and the background task serving it.
pub async fn spawn_stub_worker(
    tool_schemas: Vec<Value>,
    behavior: HashMap<String, StubTool>,
) -> (String, tokio::task::JoinHandle<()>) {
    let state = Arc::new(StubState { tools: tool_schemas, behavior });
    let app = Router::new()
        .route("/health", get(|| async { StatusCode::OK }))
        .route("/tools/list", post(list_tools))
        .route("/tools/execute", post(execute_tool))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        axum::serve(listener, app.into_make_service()).await.unwrap();
    });
    (format!("http://{}", addr), handle)
}

async fn list_tools(State(state): State<Arc<StubState>>) -> impl IntoResponse {
    Json(json!({ "tools": state.tools }))
}

async fn execute_tool(State(state): State<Arc<StubState>>, Json(req): Json<ExecuteRequest>) -> axum::response::Response {
    match state.behavior.get(&req.tool) {
        Some(StubTool::Ok(value)) => Json(value.clone()).into_response(),
        Some(StubTool::Echo) => Json(req.arguments.clone()).into_response(),
        Some(StubTool::Fail(status, body)) => {
            (StatusCode::from_u16(*status).unwrap(), body.clone()).into_response()
        }
        Some(StubTool::Delay(duration, value)) => {
            tokio::time::sleep(*duration).await;
            Json(value.clone()).into_response()
        }
        None => (StatusCode::NOT_FOUND, format!("no such tool '{}'", req.tool)).into_response(),
    }
}

/// A stub LLM provider endpoint: every request (regardless of path)
/// pops the next canned response off a fixed queue, so a test can drive
/// a multi-turn tool-use loop deterministically.
pub async fn spawn_stub_llm(responses: Vec<Value>) -> (String, tokio::task::JoinHandle<()>) {
    let state = Arc::new(tokio::sync::Mutex::new(std::collections::VecDeque::from(responses)));
    let app = Router::new().fallback(next_llm_response).with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        axum::serve(listener, app.into_make_service()).await.unwrap();
    });
    (format!("http://{}", addr), handle)
}

async fn next_llm_response(State(state): State<Arc<tokio::sync::Mutex<std::collections::VecDeque<Value>>>>) -> axum::response::Response {
    let mut queue = state.lock().await;
    match queue.pop_front() {
        Some(value) => Json(value).into_response(),
        None => (StatusCode::INTERNAL_SERVER_ERROR, "stub LLM queue exhausted").into_response(),
    }
}

struct RecordingLlmState {
    responses: tokio::sync::Mutex<std::collections::VecDeque<Value>>,
    requests: std::sync::Arc<tokio::sync::Mutex<Vec<Value>>>,
}

/// Like `spawn_stub_llm`, but also keeps every request body it
/// received, so a test can inspect the transcript a caller actually
/// sent (e.g. to assert a message wasn't duplicated across rounds).
pub async fn spawn_recording_stub_llm(
    responses: Vec<Value>,
) -> (String, std::sync::Arc<tokio::sync::Mutex<Vec<Value>>>, tokio::task::JoinHandle<()>) {
    let requests = Arc::new(tokio::sync::Mutex::new(Vec::new()));
    let state = Arc::new(RecordingLlmState {
        responses: tokio::sync::Mutex::new(std::collections::VecDeque::from(responses)),
        requests: requests.clone(),
    });
    let app = Router::new().fallback(next_recorded_llm_response).with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        axum::serve(listener, app.into_make_service()).await.unwrap();
    });

    (format!("http://{}", addr), requests, handle)
}

async fn next_recorded_llm_response(
    State(state): State<Arc<RecordingLlmState>>,
    Json(body): Json<Value>,
) -> axum::response::Response {
    state.requests.lock().await.push(body);
    let mut queue = state.responses.lock().await;
    match queue.pop_front() {
        Some(value) => Json(value).into_response(),
        None => (StatusCode::INTERNAL_SERVER_ERROR, "stub LLM queue exhausted").into_response(),
    }
}
