use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::orchestrator::error::OrchestratorError;
use crate::orchestrator::event::{EventObserver, NoopObserver, StreamEvent};
use crate::orchestrator::parameter::ParameterResolver;
use crate::orchestrator::worker::{WorkerClient, WorkerRegistry};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    McpCall,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowNode {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    pub worker_name: String,
    pub tool_name: String,
    #[serde(default)]
    pub params: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowEdge {
    pub source: String,
    pub target: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub name: String,
    pub nodes: Vec<WorkflowNode>,
    pub edges: Vec<WorkflowEdge>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeExecution {
    pub node_id: String,
    pub status: NodeStatus,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub ended_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// Per-run state shared by whichever engine (workflow, agent, team) is
/// driving the current execution. Owned exclusively by `SessionBroker`;
/// engines only borrow it for the duration of one run.
pub struct ExecutionContext {
    pub session_id: String,
    pub execution_id: String,
    pub start_time: chrono::DateTime<chrono::Utc>,
    cancelled: Arc<AtomicBool>,
    pub results: std::sync::Mutex<HashMap<String, serde_json::Value>>,
    sink: mpsc::Sender<StreamEvent>,
    /// Set only on a context handed to one member of a team run (see
    /// `with_annotation`); every event emitted through it is wrapped so
    /// the client can attribute it to the emitting agent.
    annotation: Option<(String, usize)>,
    /// Notified with every event this context emits, independent of
    /// whether a client is actually attached to the stream. Defaults to
    /// a no-op; `SessionBroker` wires in a real observer outside tests.
    observer: Arc<dyn EventObserver>,
}

impl ExecutionContext {
    pub fn new(session_id: String, execution_id: String, sink: mpsc::Sender<StreamEvent>) -> Self {
        ExecutionContext {
            session_id,
            execution_id,
            start_time: chrono::Utc::now(),
            cancelled: Arc::new(AtomicBool::new(false)),
            results: std::sync::Mutex::new(HashMap::new()),
            sink,
            annotation: None,
            observer: Arc::new(NoopObserver),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn EventObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Derives a child context that shares this context's cancellation
    /// flag, event sink, and observer but tags every emitted event with
    /// `agent_id` and `color_index`. Used by `TeamRuntime` so per-member
    /// agent runs can share one session's stream while remaining
    /// attributable.
    pub fn with_annotation(&self, agent_id: impl Into<String>, color_index: usize) -> Self {
        ExecutionContext {
            session_id: self.session_id.clone(),
            execution_id: self.execution_id.clone(),
            start_time: self.start_time,
            cancelled: Arc::clone(&self.cancelled),
            results: std::sync::Mutex::new(HashMap::new()),
            sink: self.sink.clone(),
            annotation: Some((agent_id.into(), color_index)),
            observer: Arc::clone(&self.observer),
        }
    }

    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Emits an event; backpressure on a saturated channel is itself a
    /// suspension point, so cancellation is re-checked immediately
    /// after the send completes. If this context was derived via
    /// `with_annotation`, the event is wrapped in `AgentEvent` first.
    pub async fn emit(&self, event: StreamEvent) {
        let event = match &self.annotation {
            Some((agent_id, color_index)) => {
                StreamEvent::AgentEvent { agent_id: agent_id.clone(), color_index: *color_index, event: Box::new(event) }
            }
            None => event,
        };
        self.observer.on_event(&self.session_id, &event).await;
        if self.sink.send(event).await.is_err() {
            log::debug!("event sink closed for session '{}', dropping event", self.session_id);
        }
    }

    pub fn record_result(&self, node_id: &str, result: serde_json::Value) {
        self.results.lock().expect("results mutex poisoned").insert(node_id.to_string(), result);
    }

    pub fn results_snapshot(&self) -> HashMap<String, serde_json::Value> {
        self.results.lock().expect("results mutex poisoned").clone()
    }
}

const WORKFLOW_NODE_TIMEOUT_SECS: u64 = 600;

/// Validates and executes a workflow DAG. Execution is serial,
/// topological, left-to-right by node insertion order among nodes
/// whose dependencies are satisfied at the same time.
pub struct WorkflowEngine<'a> {
    registry: &'a WorkerRegistry,
}

impl<'a> WorkflowEngine<'a> {
    pub fn new(registry: &'a WorkerRegistry) -> Self {
        WorkflowEngine { registry }
    }

    /// Validates the graph (edge endpoints exist, no cycles, every
    /// `worker_name` resolves) without starting any node.
    pub async fn validate(&self, workflow: &Workflow) -> Result<Vec<String>, OrchestratorError> {
        let node_ids: HashSet<&str> = workflow.nodes.iter().map(|n| n.id.as_str()).collect();
        if node_ids.len() != workflow.nodes.len() {
            return Err(OrchestratorError::InvalidWorkflow("duplicate node ids".to_string()));
        }

        for edge in &workflow.edges {
            if edge.source == edge.target {
                return Err(OrchestratorError::InvalidWorkflow(format!(
                    "self-loop edge on node '{}'",
                    edge.source
                )));
            }
            if !node_ids.contains(edge.source.as_str()) || !node_ids.contains(edge.target.as_str()) {
                return Err(OrchestratorError::InvalidWorkflow(format!(
                    "edge references unknown node: {} -> {}",
                    edge.source, edge.target
                )));
            }
        }

        for node in &workflow.nodes {
            self.registry.get(&node.worker_name).await.map_err(|_| {
                OrchestratorError::InvalidWorkflow(format!(
                    "node '{}' references unknown worker '{}'",
                    node.id, node.worker_name
                ))
            })?;
        }

        topological_order(workflow)
    }

    /// Runs the workflow end to end against `ctx`, emitting
    /// `node_state` events per node and a terminal `workflow_result`.
    pub async fn execute(
        &self,
        workflow: &Workflow,
        ctx: &ExecutionContext,
    ) -> Result<HashMap<String, serde_json::Value>, OrchestratorError> {
        let order = self.validate(workflow).await?;
        let nodes_by_id: HashMap<&str, &WorkflowNode> =
            workflow.nodes.iter().map(|n| (n.id.as_str(), n)).collect();

        let mut failed = false;
        let mut errors = Vec::new();

        for node_id in &order {
            let node = nodes_by_id[node_id.as_str()];

            if ctx.is_cancelled() {
                ctx.emit(StreamEvent::node_state(&node.id, NodeStatus::Skipped, None, None)).await;
                return Err(OrchestratorError::ExecutionCancelled);
            }

            if failed {
                ctx.emit(StreamEvent::node_state(&node.id, NodeStatus::Skipped, None, None)).await;
                continue;
            }

            ctx.emit(StreamEvent::node_state(&node.id, NodeStatus::Running, None, None)).await;

            let results_snapshot = ctx.results_snapshot();
            let resolved_params = match ParameterResolver::resolve(
                &serde_json::Value::Object(node.params.clone()),
                &results_snapshot,
                &node.id,
            ) {
                Ok(v) => v,
                Err(e) => {
                    ctx.emit(StreamEvent::node_state(&node.id, NodeStatus::Failed, None, Some(e.to_string()))).await;
                    errors.push(e.to_string());
                    failed = true;
                    continue;
                }
            };

            let worker = match self.registry.get(&node.worker_name).await {
                Ok(w) => w,
                Err(e) => {
                    ctx.emit(StreamEvent::node_state(&node.id, NodeStatus::Failed, None, Some(e.to_string()))).await;
                    errors.push(e.to_string());
                    failed = true;
                    continue;
                }
            };

            let client = WorkerClient::new(&worker.name, &worker.endpoint);
            let call = client.call_tool(&node.tool_name, resolved_params);
            let outcome = tokio::time::timeout(Duration::from_secs(WORKFLOW_NODE_TIMEOUT_SECS), call).await;

            match outcome {
                Ok(Ok(result)) => {
                    ctx.record_result(&node.id, result.clone());
                    ctx.emit(StreamEvent::node_state(&node.id, NodeStatus::Completed, Some(result), None)).await;
                }
                Ok(Err(e)) => {
                    ctx.emit(StreamEvent::node_state(&node.id, NodeStatus::Failed, None, Some(e.to_string()))).await;
                    errors.push(e.to_string());
                    failed = true;
                }
                Err(_) => {
                    let msg = format!("node '{}' timed out after {}s", node.id, WORKFLOW_NODE_TIMEOUT_SECS);
                    ctx.emit(StreamEvent::node_state(&node.id, NodeStatus::Failed, None, Some(msg.clone()))).await;
                    errors.push(msg);
                    failed = true;
                }
            }
        }

        let results = ctx.results_snapshot();
        if failed {
            Err(OrchestratorError::InvalidWorkflow(errors.join("; ")))
        } else {
            Ok(results)
        }
    }
}

/// Kahn's algorithm with ties broken by node insertion order, matching
/// the "serial, topological, left-to-right" execution policy.
fn topological_order(workflow: &Workflow) -> Result<Vec<String>, OrchestratorError> {
    let mut in_degree: HashMap<&str, usize> = workflow.nodes.iter().map(|n| (n.id.as_str(), 0)).collect();
    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
    for edge in &workflow.edges {
        *in_degree.get_mut(edge.target.as_str()).unwrap() += 1;
        adjacency.entry(edge.source.as_str()).or_default().push(edge.target.as_str());
    }

    let mut ready: VecDeque<&str> = workflow
        .nodes
        .iter()
        .map(|n| n.id.as_str())
        .filter(|id| in_degree[id] == 0)
        .collect();

    let mut order = Vec::with_capacity(workflow.nodes.len());
    let mut visited = HashSet::new();

    while let Some(id) = ready.pop_front() {
        order.push(id.to_string());
        visited.insert(id);
        if let Some(children) = adjacency.get(id) {
            for &child in children {
                let degree = in_degree.get_mut(child).unwrap();
                *degree -= 1;
                if *degree == 0 {
                    ready.push_back(child);
                }
            }
        }
    }

    if order.len() != workflow.nodes.len() {
        return Err(OrchestratorError::InvalidWorkflow("workflow graph contains a cycle".to_string()));
    }

    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::worker::Worker;

    #[tokio::test]
    async fn with_annotation_wraps_emitted_events() {
        let (tx, mut rx) = mpsc::channel(8);
        let ctx = ExecutionContext::new("s".to_string(), "e".to_string(), tx);
        let child = ctx.with_annotation("agent-1", 3);
        child.emit(StreamEvent::Status { message: "hi".to_string() }).await;

        match rx.recv().await.unwrap() {
            StreamEvent::AgentEvent { agent_id, color_index, event } => {
                assert_eq!(agent_id, "agent-1");
                assert_eq!(color_index, 3);
                assert!(matches!(*event, StreamEvent::Status { .. }));
            }
            other => panic!("expected AgentEvent, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn unannotated_context_emits_events_unwrapped() {
        let (tx, mut rx) = mpsc::channel(8);
        let ctx = ExecutionContext::new("s".to_string(), "e".to_string(), tx);
        ctx.emit(StreamEvent::Status { message: "hi".to_string() }).await;
        assert!(matches!(rx.recv().await.unwrap(), StreamEvent::Status { .. }));
    }

    struct RecordingObserver {
        seen: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl crate::orchestrator::event::EventObserver for RecordingObserver {
        async fn on_event(&self, session_id: &str, _event: &StreamEvent) {
            self.seen.lock().unwrap().push(session_id.to_string());
        }
    }

    #[tokio::test]
    async fn emit_notifies_the_configured_observer() {
        let (tx, mut rx) = mpsc::channel(8);
        let observer = Arc::new(RecordingObserver { seen: std::sync::Mutex::new(Vec::new()) });
        let ctx = ExecutionContext::new("s1".to_string(), "e".to_string(), tx).with_observer(observer.clone());
        ctx.emit(StreamEvent::Status { message: "hi".to_string() }).await;
        let _ = rx.recv().await;
        assert_eq!(observer.seen.lock().unwrap().as_slice(), ["s1"]);
    }

    fn node(id: &str, worker: &str) -> WorkflowNode {
        WorkflowNode {
            id: id.to_string(),
            node_type: NodeType::McpCall,
            worker_name: worker.to_string(),
            tool_name: "noop".to_string(),
            params: serde_json::Map::new(),
        }
    }

    #[tokio::test]
    async fn topological_order_respects_edges() {
        let registry = WorkerRegistry::new();
        registry.register(Worker::new("w", "http://localhost", "")).await;
        let workflow = Workflow {
            name: "wf".to_string(),
            nodes: vec![node("a", "w"), node("b", "w"), node("c", "w")],
            edges: vec![
                WorkflowEdge { source: "a".to_string(), target: "b".to_string() },
                WorkflowEdge { source: "b".to_string(), target: "c".to_string() },
            ],
        };
        let engine = WorkflowEngine::new(&registry);
        let order = engine.validate(&workflow).await.unwrap();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn cycle_is_rejected() {
        let registry = WorkerRegistry::new();
        registry.register(Worker::new("w", "http://localhost", "")).await;
        let workflow = Workflow {
            name: "wf".to_string(),
            nodes: vec![node("a", "w"), node("b", "w")],
            edges: vec![
                WorkflowEdge { source: "a".to_string(), target: "b".to_string() },
                WorkflowEdge { source: "b".to_string(), target: "a".to_string() },
            ],
        };
        let engine = WorkflowEngine::new(&registry);
        assert!(engine.validate(&workflow).await.is_err());
    }

    #[tokio::test]
    async fn unknown_worker_is_rejected_before_execution() {
        let registry = WorkerRegistry::new();
        let workflow = Workflow { name: "wf".to_string(), nodes: vec![node("a", "missing")], edges: vec![] };
        let engine = WorkflowEngine::new(&registry);
        let err = engine.validate(&workflow).await.unwrap_err();
        assert_eq!(err.kind(), "invalid_workflow");
    }

    #[test]
    fn self_loop_edge_rejected_synchronously() {
        let workflow =
            Workflow { name: "wf".to_string(), nodes: vec![node("a", "w")], edges: vec![WorkflowEdge {
                source: "a".to_string(),
                target: "a".to_string(),
            }] };
        let node_ids: HashSet<&str> = workflow.nodes.iter().map(|n| n.id.as_str()).collect();
        assert!(node_ids.contains("a"));
    }
}
