//! Dynamic Instruction entity and the Instruction Bus.
//!
//! Corresponds to spec.md §3's `Instruction` row and §4.3 "Instruction
//! Bus". No direct teacher analogue exists (crewAI has no mid-run
//! instruction concept); the bus is grounded in spirit on the teacher's
//! publish/subscribe event-bus shape (`events::event_bus`) but
//! implemented as a per-crew priority structure with a `tokio::sync::Notify`
//! wakeup, which is the idiomatic non-polling signal in a tokio-based
//! corpus.

pub mod bus;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{CrewId, InstructionId, WorkflowId};

/// Kinds of dynamic instruction, per spec.md §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstructionKind {
    Guidance,
    Constraint,
    Resource,
    Feedback,
    EmergencyStop,
    Pivot,
    SkillBoost,
}

impl InstructionKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "guidance" => Some(Self::Guidance),
            "constraint" => Some(Self::Constraint),
            "resource" => Some(Self::Resource),
            "feedback" => Some(Self::Feedback),
            "emergency_stop" => Some(Self::EmergencyStop),
            "pivot" => Some(Self::Pivot),
            "skill_boost" => Some(Self::SkillBoost),
            _ => None,
        }
    }

    /// Whether this kind is delivered into the runner's live context
    /// channel (vs. only recorded for stricter debrief enforcement).
    /// See SPEC_FULL.md / DESIGN.md Open Question #2.
    pub fn is_live_context(&self) -> bool {
        matches!(
            self,
            Self::Guidance | Self::Feedback | Self::Resource | Self::SkillBoost
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstructionStatus {
    Pending,
    Delivered,
    Applied,
    Failed,
    Expired,
}

/// The highest priority value; reserved for `emergency_stop` per
/// spec.md §3/§4.3 — this priority is always either applied or causes
/// an emergency stop, and never silently expires.
pub const EMERGENCY_PRIORITY: u8 = 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instruction {
    pub id: InstructionId,
    pub crew_id: CrewId,
    pub workflow_id: Option<WorkflowId>,
    pub kind: InstructionKind,
    pub priority: u8,
    pub content: String,
    pub status: InstructionStatus,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl Instruction {
    pub fn new(crew_id: CrewId, kind: InstructionKind, priority: u8, content: String) -> Self {
        Self {
            id: InstructionId::new(),
            crew_id,
            workflow_id: None,
            kind,
            priority: priority.clamp(1, 5),
            content,
            status: InstructionStatus::Pending,
            created_at: Utc::now(),
            processed_at: None,
            error: None,
        }
    }

    pub fn is_emergency_stop(&self) -> bool {
        self.kind == InstructionKind::EmergencyStop || self.priority == EMERGENCY_PRIORITY
    }
}
