mod common;

use orchestrator_core::orchestrator::agent::AgentDefinition;
use orchestrator_core::orchestrator::llm::{ModelConfig, ModelDriver, ModelRegistry, ProviderKind};
use orchestrator_core::orchestrator::session::SessionBroker;
use orchestrator_core::orchestrator::team::{RoutingPolicy, TeamDefinition, TeamMember, TeamRuntime};
use orchestrator_core::orchestrator::worker::WorkerRegistry;
use serde_json::json;

use common::spawn_recording_stub_llm;

fn agent(id: &str, model_id: &str) -> AgentDefinition {
    AgentDefinition {
        id: id.to_string(),
        system_prompt: "be helpful".to_string(),
        model_id: model_id.to_string(),
        model_driver: ModelDriver::AnthropicStyle,
        temperature: None,
        max_tokens: None,
        max_iterations: 5,
        tool_scope: Vec::new(),
    }
}

fn text_response(text: &str) -> serde_json::Value {
    json!({
        "stop_reason": "end_turn",
        "content": [{"type": "text", "text": text}],
        "usage": {"input_tokens": 1, "output_tokens": 1}
    })
}

#[tokio::test]
async fn sequential_run_carries_prior_reply_instead_of_repeating_the_question() {
    std::env::set_var("ORCH_TEST_S7_KEY", "test-key");

    let (llm_endpoint, requests, _llm_server) =
        spawn_recording_stub_llm(vec![text_response("first reply"), text_response("second reply")]).await;

    let model = ModelConfig {
        id: "anthropic-test".to_string(),
        provider: ProviderKind::Anthropic,
        model_name: "claude-test".to_string(),
        api_key_env: "ORCH_TEST_S7_KEY".to_string(),
        base_url: Some(llm_endpoint),
        default_timeout_secs: 30,
        is_default: false,
    };

    let models_dir = tempfile::tempdir().unwrap();
    let models = ModelRegistry::empty(models_dir.path().join("models.json"));
    models.upsert(model).await.unwrap();

    let workers = WorkerRegistry::new();

    let team = TeamDefinition {
        id: "team-1".to_string(),
        name: "writers".to_string(),
        members: vec![
            TeamMember { agent: agent("drafter", "anthropic-test"), role: "drafter".to_string() },
            TeamMember { agent: agent("editor", "anthropic-test"), role: "editor".to_string() },
        ],
        routing: RoutingPolicy::Sequential,
    };

    let broker = SessionBroker::new("session-s7");
    let handle = broker.start_execution();

    let runtime = TeamRuntime::new(&workers, &models);
    let reply = runtime.run(&team, "draft a haiku about rust", &handle.ctx).await.unwrap();

    assert!(reply.contains("first reply"));
    assert!(reply.contains("second reply"));

    let captured = requests.lock().await;
    assert_eq!(captured.len(), 2);

    let first_messages = captured[0]["messages"].as_array().unwrap();
    let second_messages = captured[1]["messages"].as_array().unwrap();

    // The first member only ever saw the original question.
    assert_eq!(first_messages.len(), 1);
    assert_eq!(first_messages[0]["content"], "draft a haiku about rust");

    // The second member must be carried the first member's reply, not a
    // second copy of the original user message.
    let second_user_turns: Vec<&str> =
        second_messages.iter().filter(|m| m["role"] == "user").map(|m| m["content"].as_str().unwrap()).collect();
    assert_eq!(second_user_turns, vec!["first reply"]);
    assert!(
        !second_messages.iter().any(|m| m["content"] == "draft a haiku about rust"),
        "original user message must not be duplicated into later members' transcripts: {:?}",
        second_messages
    );
}
