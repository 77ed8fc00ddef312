//! Workflow entity and state machine.
//!
//! Corresponds to spec.md §4.4 and §3's `Workflow` row. Grounded on
//! `crew.rs`'s `Crew` struct for field shape and on
//! `events/crewai_event_bus.rs` for the "emit an event per transition"
//! posture (here: `tracing` spans instead of an event bus, since no
//! external subscriber is in scope).

pub mod runner;
pub mod state_machine;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{CrewId, WorkflowId};

/// spec.md §4.4's state diagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    Created,
    Preparing,
    Executing,
    Debriefing,
    Cancelling,
    Completed,
    Cancelled,
    Failed,
}

impl WorkflowState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }

    pub fn is_non_terminal(self) -> bool {
        !self.is_terminal()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Preparing => "preparing",
            Self::Executing => "executing",
            Self::Debriefing => "debriefing",
            Self::Cancelling => "cancelling",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }
}

/// Opaque result handed back by a [`runner::CrewRunner`], carried
/// through to the Debriefing phase. The runner itself is out of scope
/// (spec.md §1); this crate only needs to read experience deltas out of
/// it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrewResult {
    /// Per-agent outcome used to update `Experience` during debrief.
    pub agent_outcomes: Vec<AgentOutcome>,
    pub summary: String,
    pub deliverables: Vec<Deliverable>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentOutcome {
    pub agent_id: crate::ids::AgentId,
    pub success: bool,
    pub quality: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deliverable {
    pub file_name: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: WorkflowId,
    pub crew_id: CrewId,
    pub state: WorkflowState,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub context: Option<String>,
    pub allow_evolution: bool,
    pub result: Option<CrewResult>,
    pub cancellation_reason: Option<String>,
    /// Set once an emergency_stop has been honored; spec.md §4.4 "at
    /// most one emergency_stop is honored".
    pub emergency_stop_seen: bool,
}

impl Workflow {
    pub fn new(crew_id: CrewId, context: Option<String>, allow_evolution: bool) -> Self {
        Self {
            id: WorkflowId::new(),
            crew_id,
            state: WorkflowState::Created,
            started_at: Utc::now(),
            ended_at: None,
            context,
            allow_evolution,
            result: None,
            cancellation_reason: None,
            emergency_stop_seen: false,
        }
    }

    pub fn transition(&mut self, next: WorkflowState) {
        tracing::debug!(workflow_id = %self.id, from = self.state.as_str(), to = next.as_str(), "workflow transition");
        self.state = next;
        if next.is_terminal() {
            self.ended_at = Some(Utc::now());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::CrewId;

    #[test]
    fn new_workflow_starts_created_and_non_terminal() {
        let w = Workflow::new(CrewId::new(), None, true);
        assert_eq!(w.state, WorkflowState::Created);
        assert!(w.state.is_non_terminal());
        assert!(w.ended_at.is_none());
    }

    #[test]
    fn transition_to_terminal_state_stamps_ended_at() {
        let mut w = Workflow::new(CrewId::new(), None, true);
        w.transition(WorkflowState::Completed);
        assert!(w.state.is_terminal());
        assert!(w.ended_at.is_some());
    }
}
