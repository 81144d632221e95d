// src/lib.rs

pub mod orchestrator;

// Re-export the most commonly reached-for types so callers can write
// `orchestrator_core::Workflow` instead of drilling into the submodule
// that happens to define it.
pub use orchestrator::agent::{AgentDefinition, AgentRuntime};
pub use orchestrator::error::OrchestratorError;
pub use orchestrator::event::StreamEvent;
pub use orchestrator::session::SessionBroker;
pub use orchestrator::team::{TeamDefinition, TeamRuntime};
pub use orchestrator::worker::{Worker, WorkerRegistry};
pub use orchestrator::workflow::{Workflow, WorkflowEngine};
