use futures_util::future::join_all;
use serde::{Deserialize, Serialize};

use crate::orchestrator::agent::{AgentDefinition, AgentRuntime};
use crate::orchestrator::error::OrchestratorError;
use crate::orchestrator::llm::{Message, ModelRegistry};
use crate::orchestrator::workflow::ExecutionContext;
use crate::orchestrator::worker::WorkerRegistry;

/// Size of the stable color palette `color_index` maps agent ids into;
/// an arbitrary but fixed bound so the index is always small enough for
/// a UI to key into a short, pre-defined color list.
const COLOR_PALETTE_SIZE: usize = 12;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RoutingPolicy {
    Single,
    Sequential,
    Broadcast,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamMember {
    pub agent: AgentDefinition,
    pub role: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamDefinition {
    pub id: String,
    pub name: String,
    pub members: Vec<TeamMember>,
    pub routing: RoutingPolicy,
}

/// A stable, non-cryptographic hash of an agent id into a small
/// palette index, so streaming consumers can color-code agent output
/// without the team needing to coordinate colors up front.
pub fn color_index(agent_id: &str, palette_size: usize) -> usize {
    let mut hash: u32 = 2166136261;
    for byte in agent_id.bytes() {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(16777619);
    }
    (hash as usize) % palette_size.max(1)
}

pub struct TeamRuntime<'a> {
    workers: &'a WorkerRegistry,
    models: &'a ModelRegistry,
}

impl<'a> TeamRuntime<'a> {
    pub fn new(workers: &'a WorkerRegistry, models: &'a ModelRegistry) -> Self {
        TeamRuntime { workers, models }
    }

    pub async fn run(
        &self,
        team: &TeamDefinition,
        user_message: &str,
        ctx: &ExecutionContext,
    ) -> Result<String, OrchestratorError> {
        self.run_with_history(team, user_message, Vec::new(), ctx).await
    }

    /// Like `run`, but seeds the routed agent(s) with prior conversation
    /// turns — used by the `/chat` endpoint, which forwards the last ten
    /// history turns. Only `single` routing carries the history forward;
    /// `sequential` builds its own carried transcript across members and
    /// `broadcast` gives every member the same fresh message by design.
    pub async fn run_with_history(
        &self,
        team: &TeamDefinition,
        user_message: &str,
        history: Vec<Message>,
        ctx: &ExecutionContext,
    ) -> Result<String, OrchestratorError> {
        match team.routing {
            RoutingPolicy::Single => self.run_single(team, user_message, history, ctx).await,
            RoutingPolicy::Sequential => self.run_sequential(team, user_message, ctx).await,
            RoutingPolicy::Broadcast => self.run_broadcast(team, user_message, ctx).await,
        }
    }

    async fn run_single(
        &self,
        team: &TeamDefinition,
        user_message: &str,
        history: Vec<Message>,
        ctx: &ExecutionContext,
    ) -> Result<String, OrchestratorError> {
        let member = team
            .members
            .first()
            .ok_or_else(|| OrchestratorError::InvalidWorkflow(format!("team '{}' has no members", team.id)))?;
        let member_ctx = ctx.with_annotation(member.agent.id.clone(), color_index(&member.agent.id, COLOR_PALETTE_SIZE));
        let outcome = self.run_member(member, user_message, history, &member_ctx).await?;
        Ok(outcome.final_text)
    }

    async fn run_sequential(
        &self,
        team: &TeamDefinition,
        user_message: &str,
        ctx: &ExecutionContext,
    ) -> Result<String, OrchestratorError> {
        let mut sections = Vec::with_capacity(team.members.len());
        let mut carried_history = Vec::new();
        // The first member sees the original question; `AgentRuntime::run`
        // appends whatever is passed here as a fresh user turn onto
        // `carried_history`, so later rounds must carry the previous
        // member's reply forward instead of re-asking the same question.
        let mut round_message = user_message.to_string();

        for member in &team.members {
            if ctx.is_cancelled() {
                return Err(OrchestratorError::ExecutionCancelled);
            }
            let member_ctx = ctx.with_annotation(member.agent.id.clone(), color_index(&member.agent.id, COLOR_PALETTE_SIZE));
            let outcome = self.run_member(member, &round_message, carried_history.clone(), &member_ctx).await?;
            sections.push(format!("[{}]\n{}", member.role, outcome.final_text));
            round_message = outcome.final_text.clone();
            carried_history = outcome.transcript;
        }

        Ok(sections.join("\n\n"))
    }

    /// Invokes every member concurrently with the original message, each
    /// forwarding its events through its own annotated child context, and
    /// awaits all of them before combining the reply. Unlike `sequential`,
    /// no member sees another's output.
    async fn run_broadcast(
        &self,
        team: &TeamDefinition,
        user_message: &str,
        ctx: &ExecutionContext,
    ) -> Result<String, OrchestratorError> {
        let runs = team.members.iter().map(|member| {
            let member_ctx = ctx.with_annotation(member.agent.id.clone(), color_index(&member.agent.id, COLOR_PALETTE_SIZE));
            async move {
                let outcome = self.run_member(member, user_message, Vec::new(), &member_ctx).await;
                (member, outcome)
            }
        });

        let mut sections = Vec::with_capacity(team.members.len());
        let mut any_succeeded = false;
        let mut failures = Vec::new();

        for (member, outcome) in join_all(runs).await {
            match outcome {
                Ok(outcome) => {
                    any_succeeded = true;
                    sections.push(format!("[{}]\n{}", member.role, outcome.final_text));
                }
                Err(e) => {
                    failures.push(format!("[{}] failed: {}", member.role, e));
                }
            }
        }

        if !any_succeeded {
            return Err(OrchestratorError::InvalidWorkflow(format!(
                "all members of team '{}' failed: {}",
                team.id,
                failures.join("; ")
            )));
        }

        sections.extend(failures);
        Ok(sections.join("\n\n"))
    }

    async fn run_member(
        &self,
        member: &TeamMember,
        user_message: &str,
        history: Vec<Message>,
        ctx: &ExecutionContext,
    ) -> Result<crate::orchestrator::agent::AgentOutcome, OrchestratorError> {
        let model = self.models.get(&member.agent.model_id).await?;
        let runtime = AgentRuntime::new(self.workers);
        runtime.run(&member.agent, &model, user_message, history, ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn color_index_is_stable_for_the_same_id() {
        let a = color_index("agent-1", 8);
        let b = color_index("agent-1", 8);
        assert_eq!(a, b);
        assert!(a < 8);
    }

    #[test]
    fn color_index_differs_across_ids_in_practice() {
        assert_ne!(color_index("agent-1", 8), color_index("agent-2", 8));
    }
}
