use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::orchestrator::error::OrchestratorError;
use crate::orchestrator::event::{ControlMessage, EventObserver, NoopObserver, StreamEvent};
use crate::orchestrator::workflow::ExecutionContext;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// One streaming session per client connection. Owns the
/// `ExecutionContext` for the run it drives, relays engine events to
/// the client transport, and turns `cancel_execution` control
/// messages into the context's cancellation flag.
pub struct SessionBroker {
    pub session_id: String,
    observer: Arc<dyn EventObserver>,
}

pub struct SessionHandle {
    pub ctx: Arc<ExecutionContext>,
    pub events: mpsc::Receiver<StreamEvent>,
}

impl SessionBroker {
    pub fn new(session_id: impl Into<String>) -> Self {
        SessionBroker { session_id: session_id.into(), observer: Arc::new(NoopObserver) }
    }

    /// Attaches an `EventObserver` every execution started from this
    /// broker will notify, in addition to relaying events to the
    /// client transport.
    pub fn with_observer(mut self, observer: Arc<dyn EventObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Starts a new execution: allocates a fresh execution id and
    /// event channel, returning the context engines should drive and
    /// the receiving half the transport layer drains.
    pub fn start_execution(&self) -> SessionHandle {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let execution_id = Uuid::new_v4().to_string();
        let ctx =
            Arc::new(ExecutionContext::new(self.session_id.clone(), execution_id, tx).with_observer(self.observer.clone()));
        SessionHandle { ctx, events: rx }
    }

    /// Applies a client control message to the given context.
    pub fn handle_control(&self, ctx: &ExecutionContext, message: ControlMessage) {
        match message {
            ControlMessage::CancelExecution { execution_id } => {
                if execution_id == ctx.execution_id {
                    log::info!("session '{}' cancelling execution '{}'", self.session_id, execution_id);
                    ctx.cancel_handle().store(true, Ordering::SeqCst);
                } else {
                    log::warn!(
                        "session '{}' received cancel for unknown execution '{}'",
                        self.session_id,
                        execution_id
                    );
                }
            }
        }
    }

    /// Maps a run outcome to the terminal event the client should see.
    pub fn terminal_event(result: &Result<serde_json::Value, OrchestratorError>) -> StreamEvent {
        match result {
            Ok(value) => StreamEvent::Complete { result: value.clone() },
            Err(OrchestratorError::ExecutionCancelled) => StreamEvent::Cancelled,
            Err(e) => StreamEvent::Error { message: e.sanitized_message(), kind: Some(e.kind().to_string()) },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancel_with_matching_execution_id_sets_flag() {
        let broker = SessionBroker::new("session-1");
        let handle = broker.start_execution();
        broker.handle_control(&handle.ctx, ControlMessage::CancelExecution { execution_id: handle.ctx.execution_id.clone() });
        assert!(handle.ctx.is_cancelled());
    }

    #[tokio::test]
    async fn cancel_with_mismatched_execution_id_is_ignored() {
        let broker = SessionBroker::new("session-1");
        let handle = broker.start_execution();
        broker.handle_control(&handle.ctx, ControlMessage::CancelExecution { execution_id: "other".to_string() });
        assert!(!handle.ctx.is_cancelled());
    }

    #[test]
    fn terminal_event_classifies_cancellation_separately_from_errors() {
        let cancelled = SessionBroker::terminal_event(&Err(OrchestratorError::ExecutionCancelled));
        assert!(matches!(cancelled, StreamEvent::Cancelled));

        let failed = SessionBroker::terminal_event(&Err(OrchestratorError::InvalidWorkflow("bad".to_string())));
        assert!(matches!(failed, StreamEvent::Error { .. }));
    }

    struct CountingObserver {
        count: std::sync::atomic::AtomicUsize,
    }

    #[async_trait::async_trait]
    impl EventObserver for CountingObserver {
        async fn on_event(&self, _session_id: &str, _event: &StreamEvent) {
            self.count.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn with_observer_is_notified_of_every_emitted_event() {
        let observer = Arc::new(CountingObserver { count: std::sync::atomic::AtomicUsize::new(0) });
        let broker = SessionBroker::new("session-1").with_observer(observer.clone());
        let handle = broker.start_execution();
        handle.ctx.emit(StreamEvent::Status { message: "hi".to_string() }).await;
        handle.ctx.emit(StreamEvent::Status { message: "again".to_string() }).await;
        assert_eq!(observer.count.load(std::sync::atomic::Ordering::SeqCst), 2);
    }
}
