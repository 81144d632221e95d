use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::orchestrator::workflow::NodeStatus;

/// Token accounting reported by a provider adapter for one LLM call.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolUseSummary {
    pub name: String,
    pub summary: String,
}

/// The discriminated set of server-to-client messages a streaming
/// session may emit. Extra fields may be added in later versions;
/// consumers must ignore unknown fields, hence `#[serde(tag = "type")]`
/// rather than a closed enum of payload shapes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    ExecutionStarted { execution_id: String },
    Status { message: String },
    NodeState {
        node_id: String,
        status: NodeStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<serde_json::Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    AgentIteration {
        iteration: u32,
        max_iterations: u32,
        stop_reason: String,
        token_usage: TokenUsage,
        model: String,
        tools_used: Vec<ToolUseSummary>,
    },
    ToolExecution { worker: String, tool: String, summary: String },
    AgentComplete {
        final_text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        flag: Option<String>,
    },
    Complete { result: serde_json::Value },
    Cancelled,
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        kind: Option<String>,
    },
    /// Wraps an event emitted by one member of a team run, so a
    /// downstream consumer can color-code per-agent output without the
    /// team needing to coordinate colors up front. `TeamRuntime` is the
    /// only emitter of this variant; a plain workflow or solo agent run
    /// never wraps its events.
    AgentEvent {
        agent_id: String,
        color_index: usize,
        event: Box<StreamEvent>,
    },
}

impl StreamEvent {
    pub fn node_state(
        node_id: &str,
        status: NodeStatus,
        result: Option<serde_json::Value>,
        error: Option<String>,
    ) -> Self {
        StreamEvent::NodeState { node_id: node_id.to_string(), status, result, error }
    }
}

/// Client-to-server control message; the only one defined so far is
/// cancellation of the run tied to `execution_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    CancelExecution { execution_id: String },
}

/// Observer hook for every lifecycle event an engine produces,
/// independent of whether a streaming session is attached. Default
/// methods are no-ops so implementers only override what they need
/// (logging, metrics, audit trail).
#[async_trait]
pub trait EventObserver: Send + Sync {
    async fn on_event(&self, _session_id: &str, _event: &StreamEvent) {}
}

pub struct NoopObserver;

#[async_trait]
impl EventObserver for NoopObserver {}

/// Logs every event at debug level, tagged with the session it belongs
/// to. The default observer wired into `SessionBroker` outside of
/// tests — cheap enough to run on every event, and gives an operator
/// a server-side audit trail independent of whether any client is
/// actually attached to the stream.
pub struct LoggingEventObserver;

#[async_trait]
impl EventObserver for LoggingEventObserver {
    async fn on_event(&self, session_id: &str, event: &StreamEvent) {
        log::debug!("session '{}' event: {:?}", session_id, event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_state_serializes_with_type_tag() {
        let event = StreamEvent::node_state("n1", NodeStatus::Completed, Some(serde_json::json!(5)), None);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "node_state");
        assert_eq!(json["status"], "completed");
        assert_eq!(json["result"], 5);
        assert!(json.get("error").is_none());
    }

    #[tokio::test]
    async fn noop_and_logging_observers_do_not_panic() {
        let event = StreamEvent::Status { message: "hi".to_string() };
        NoopObserver.on_event("s1", &event).await;
        LoggingEventObserver.on_event("s1", &event).await;
    }

    #[test]
    fn control_message_roundtrips() {
        let msg = ControlMessage::CancelExecution { execution_id: "exec-1".to_string() };
        let json = serde_json::to_string(&msg).unwrap();
        let parsed: ControlMessage = serde_json::from_str(&json).unwrap();
        match parsed {
            ControlMessage::CancelExecution { execution_id } => assert_eq!(execution_id, "exec-1"),
        }
    }
}
