mod common;

use std::collections::HashMap;

use orchestrator_core::orchestrator::session::SessionBroker;
use orchestrator_core::orchestrator::worker::{Worker, WorkerRegistry};
use orchestrator_core::orchestrator::workflow::{NodeType, Workflow, WorkflowEdge, WorkflowEngine, WorkflowNode};
use serde_json::json;

use common::{spawn_stub_worker, StubTool};

#[tokio::test]
async fn scan_result_embeds_as_pretty_json_into_analyze_prompt() {
    let mut behavior = HashMap::new();
    behavior.insert("scan".to_string(), StubTool::Ok(json!({ "open_ports": [22, 80] })));
    behavior.insert("analyze".to_string(), StubTool::Echo);
    let (endpoint, _server) = spawn_stub_worker(
        vec![json!({"name": "scan", "description": "", "input_schema": {}}), json!({"name": "analyze", "description": "", "input_schema": {}})],
        behavior,
    )
    .await;

    let registry = WorkerRegistry::new();
    registry.register(Worker::new("w", &endpoint, "")).await;

    let workflow = Workflow {
        name: "param-embedding".to_string(),
        nodes: vec![
            WorkflowNode {
                id: "scan".to_string(),
                node_type: NodeType::McpCall,
                worker_name: "w".to_string(),
                tool_name: "scan".to_string(),
                params: serde_json::Map::new(),
            },
            WorkflowNode {
                id: "analyze".to_string(),
                node_type: NodeType::McpCall,
                worker_name: "w".to_string(),
                tool_name: "analyze".to_string(),
                params: {
                    let mut m = serde_json::Map::new();
                    m.insert("prompt".to_string(), json!("Summary: ${scan}"));
                    m
                },
            },
        ],
        edges: vec![WorkflowEdge { source: "scan".to_string(), target: "analyze".to_string() }],
    };

    let broker = SessionBroker::new("session-s1");
    let handle = broker.start_execution();
    let engine = WorkflowEngine::new(&registry);
    let results = engine.execute(&workflow, &handle.ctx).await.unwrap();

    let expected_prompt = "Summary: {\n  \"open_ports\": [\n    22,\n    80\n  ]\n}";
    assert_eq!(results["analyze"]["prompt"], json!(expected_prompt));
}
