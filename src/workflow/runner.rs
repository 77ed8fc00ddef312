//! The `CrewRunner` boundary.
//!
//! spec.md §1 treats the LLM agent framework itself as an opaque
//! external collaborator exposing a single blocking `Kickoff` operation
//! (§GLOSSARY "Runner"). This module defines that boundary trait plus a
//! `SimulatedCrewRunner` used when no real runner is wired in — kept per
//! DESIGN.md's Open Question decision #1.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::crew::Crew;
use crate::error::AppError;
use crate::workflow::{AgentOutcome, CrewResult, Deliverable};

/// Channel the intake loop uses to forward live-context instructions
/// (guidance/feedback/resource/skill_boost) into an in-flight `Kickoff`
/// call, for runners that support it. Runners that don't can simply
/// drop the receiving half; unconsumed pushes are not an error.
#[derive(Clone)]
pub struct LiveContextSink {
    tx: mpsc::UnboundedSender<String>,
}

impl LiveContextSink {
    pub fn push(&self, text: String) {
        let _ = self.tx.send(text);
    }
}

pub fn live_context_channel() -> (LiveContextSink, mpsc::UnboundedReceiver<String>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (LiveContextSink { tx }, rx)
}

/// The opaque external collaborator. `kickoff` is blocking from the
/// runner's perspective (it may drive real LLM calls); callers are
/// expected to run it on a bounded worker pool, never inline on a
/// request task.
#[async_trait]
pub trait CrewRunner: Send + Sync {
    /// Whether this runner consumes [`LiveContextSink`] pushes. The
    /// intake loop still records live-context instructions for debrief
    /// even when this is `false`.
    fn supports_live_context(&self) -> bool;

    async fn kickoff(
        &self,
        crew: &Crew,
        context: Option<String>,
        live_context: LiveContextSink,
        cancel: CancellationToken,
    ) -> Result<CrewResult, AppError>;
}

/// Deterministic stand-in runner. Produces an outcome per agent derived
/// from the agent's own traits and task count rather than any source of
/// randomness, so that `create_evolving_crew` + `run_autonomous_crew`
/// with a fixed seed is reproducible end to end, per spec.md §8's
/// round-trip property.
pub struct SimulatedCrewRunner;

impl SimulatedCrewRunner {
    pub fn new() -> Self {
        Self
    }
}

impl Default for SimulatedCrewRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CrewRunner for SimulatedCrewRunner {
    fn supports_live_context(&self) -> bool {
        true
    }

    async fn kickoff(
        &self,
        crew: &Crew,
        _context: Option<String>,
        _live_context: LiveContextSink,
        cancel: CancellationToken,
    ) -> Result<CrewResult, AppError> {
        let task_count = crew.tasks.len().max(1) as f64;
        let mut agent_outcomes = Vec::with_capacity(crew.agent_ids.len());

        for (idx, agent_id) in crew.agent_ids.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(AppError::Cancelled("runner observed cancellation".to_string()));
            }
            // A short yield per "task" so the intake loop gets scheduling
            // opportunities to deliver instructions mid-kickoff.
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;

            let quality = ((idx as f64 + 1.0) / (crew.agent_ids.len() as f64 + task_count)).clamp(0.0, 1.0);
            let success = quality >= 0.4;
            agent_outcomes.push(AgentOutcome {
                agent_id: *agent_id,
                success,
                quality,
            });
        }

        if cancel.is_cancelled() {
            return Err(AppError::Cancelled("runner observed cancellation".to_string()));
        }

        Ok(CrewResult {
            agent_outcomes,
            summary: format!("crew '{}' completed {} task(s)", crew.name, crew.tasks.len()),
            deliverables: vec![Deliverable {
                file_name: "summary.txt".to_string(),
                content: format!("crew {} ran {} task(s)", crew.id, crew.tasks.len()),
            }],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::AgentId;

    #[tokio::test]
    async fn simulated_runner_returns_an_outcome_per_agent() {
        let crew = Crew::new(
            "t".to_string(),
            vec![AgentId::new(), AgentId::new()],
            vec![],
            0.5,
        );
        let runner = SimulatedCrewRunner::new();
        let (sink, _rx) = live_context_channel();
        let result = runner
            .kickoff(&crew, None, sink, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.agent_outcomes.len(), 2);
    }

    #[tokio::test]
    async fn simulated_runner_honors_cancellation() {
        let crew = Crew::new("t".to_string(), vec![AgentId::new()], vec![], 0.5);
        let runner = SimulatedCrewRunner::new();
        let (sink, _rx) = live_context_channel();
        let token = CancellationToken::new();
        token.cancel();
        let result = runner.kickoff(&crew, None, sink, token).await;
        assert!(matches!(result, Err(AppError::Cancelled(_))));
    }
}
