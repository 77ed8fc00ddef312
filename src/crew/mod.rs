//! Crew entity.
//!
//! Corresponds to spec.md §3's `Crew` row. Grounded on `crew.rs`'s
//! top-level struct shape (id/name/tasks/agents), narrowed away from the
//! teacher's process/memory/embedder/callback fields which belong to the
//! opaque `CrewRunner` collaborator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{AgentId, CrewId};

/// One task definition inside a crew's task list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrewTask {
    pub description: String,
    pub expected_output: String,
    pub assigned_agent: Option<AgentId>,
}

/// Lifecycle state of a `Crew` (distinct from its `Workflow`'s state).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrewState {
    Idle,
    Running,
    Debriefing,
    Disbanded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Crew {
    pub id: CrewId,
    pub name: String,
    pub agent_ids: Vec<AgentId>,
    pub tasks: Vec<CrewTask>,
    pub autonomy_level: f64,
    pub formation_date: DateTime<Utc>,
    pub state: CrewState,
}

impl Crew {
    pub fn new(name: impl Into<String>, agent_ids: Vec<AgentId>, tasks: Vec<CrewTask>, autonomy_level: f64) -> Self {
        Self {
            id: CrewId::new(),
            name: name.into(),
            agent_ids,
            tasks,
            autonomy_level: autonomy_level.clamp(0.0, 1.0),
            formation_date: Utc::now(),
            state: CrewState::Idle,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn autonomy_level_is_clamped_on_construction() {
        let crew = Crew::new("m1", vec![], vec![], 1.7);
        assert_eq!(crew.autonomy_level, 1.0);
    }
}
