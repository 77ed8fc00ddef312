//! Evolution Engine.
//!
//! Corresponds to spec.md §4.5. No direct teacher analogue exists
//! (crewAI agents don't mutate their own personality); strategies are
//! modeled as a closed enum per the §9 REDESIGN FLAGS entry "runtime
//! reflection to match evolution_type strings -> enumerated strategy
//! variants with a closed mapping". Per-agent serialization is grounded
//! on `dashmap`'s per-shard locking idiom, used here as a
//! `DashMap<AgentId, Mutex<()>>` lock table — exactly one mutex per
//! agent, acquired for the duration of a single evolution.

pub mod engine;
pub mod strategies;
pub mod triggers;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::ids::AgentId;

/// spec.md §3 `EvolutionEvent.kind`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvolutionKind {
    PersonalityDrift,
    RoleSpecialization,
    CollaborativeAdaptation,
    RadicalTransformation,
}

impl EvolutionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PersonalityDrift => "personality_drift",
            Self::RoleSpecialization => "role_specialization",
            Self::CollaborativeAdaptation => "collaborative_adaptation",
            Self::RadicalTransformation => "radical_transformation",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "personality_drift" => Some(Self::PersonalityDrift),
            "role_specialization" => Some(Self::RoleSpecialization),
            "collaborative_adaptation" => Some(Self::CollaborativeAdaptation),
            "radical_transformation" => Some(Self::RadicalTransformation),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvolutionEvent {
    pub id: uuid::Uuid,
    pub agent_id: AgentId,
    pub cycle: u32,
    pub previous_traits: HashMap<String, f64>,
    pub new_traits: HashMap<String, f64>,
    pub kind: EvolutionKind,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}
