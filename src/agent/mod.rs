//! Agent entity.
//!
//! Corresponds to spec.md §3's `Agent` row. Grounded on the teacher's
//! `agent::core::Agent` field-documentation style, narrowed to the
//! orchestration kernel's schema: the LLM-facing fields (`llm`, `mcps`,
//! `max_rpm`, code-execution mode, step callbacks) belong to the opaque
//! `CrewRunner` collaborator and are not modeled here.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::AgentId;

/// Maximum number of reflections retained per agent (spec.md §5 "max
/// stored reflections per agent are ... bounded").
pub const MAX_REFLECTIONS: usize = 50;

/// A single free-text reflection entry, appended during debrief.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reflection {
    pub created_at: DateTime<Utc>,
    pub workflow_id: Option<crate::ids::WorkflowId>,
    pub text: String,
}

/// Rolling experience counters used by both the Evolution Engine's
/// triggers (spec.md §4.5) and `crew_self_assessment` (SPEC_FULL.md).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Experience {
    pub tasks_completed: u64,
    pub successes: u64,
    pub failures: u64,
    pub avg_quality: f64,
    /// Outcomes of the most recent tasks, most-recent-last, bounded to
    /// a rolling window used for the "< 0.6 success rate over >= 10
    /// tasks" and "3 consecutive failures" triggers.
    #[serde(default)]
    pub recent_outcomes: VecDeque<bool>,
}

const RECENT_OUTCOMES_WINDOW: usize = 32;

impl Experience {
    pub fn record_outcome(&mut self, success: bool, quality: f64) {
        self.tasks_completed += 1;
        if success {
            self.successes += 1;
        } else {
            self.failures += 1;
        }
        // Incremental mean over all completed tasks.
        let n = self.tasks_completed as f64;
        self.avg_quality += (quality - self.avg_quality) / n;

        self.recent_outcomes.push_back(success);
        while self.recent_outcomes.len() > RECENT_OUTCOMES_WINDOW {
            self.recent_outcomes.pop_front();
        }
    }

    /// Rolling success rate over the recent-outcomes window, if there
    /// are at least `min_tasks` samples (spec.md §4.5's windowed
    /// trigger requires >= 10).
    pub fn rolling_success_rate(&self, min_tasks: usize) -> Option<f64> {
        if self.recent_outcomes.len() < min_tasks {
            return None;
        }
        let successes = self.recent_outcomes.iter().filter(|ok| **ok).count();
        Some(successes as f64 / self.recent_outcomes.len() as f64)
    }

    /// Length of the current trailing run of failures.
    pub fn consecutive_failures(&self) -> u32 {
        self.recent_outcomes
            .iter()
            .rev()
            .take_while(|ok| !**ok)
            .count() as u32
    }
}

/// An evolving agent. Personality is an open `trait-name -> [0,1]` map
/// rather than a fixed schema, per spec.md §3.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    pub role: String,
    pub goal: String,
    pub backstory: String,
    pub personality: HashMap<String, f64>,
    pub experience: Experience,
    pub evolution_cycles: u32,
    pub created_at: DateTime<Utc>,
    pub last_evolved_at: Option<DateTime<Utc>>,
    pub reflections: VecDeque<Reflection>,
}

impl Agent {
    pub fn new(role: impl Into<String>, goal: impl Into<String>, backstory: impl Into<String>) -> Self {
        Self {
            id: AgentId::new(),
            role: role.into(),
            goal: goal.into(),
            backstory: backstory.into(),
            personality: HashMap::new(),
            experience: Experience::default(),
            evolution_cycles: 0,
            created_at: Utc::now(),
            last_evolved_at: None,
            reflections: VecDeque::new(),
        }
    }

    /// Clamp every trait value into `[0, 1]`. Invariant from spec.md §3:
    /// "Agent trait values are kept in [0,1]; mutations clamp".
    pub fn clamp_traits(&mut self) {
        for v in self.personality.values_mut() {
            *v = v.clamp(0.0, 1.0);
        }
    }

    pub fn push_reflection(&mut self, workflow_id: Option<crate::ids::WorkflowId>, text: String) {
        self.reflections.push_back(Reflection {
            created_at: Utc::now(),
            workflow_id,
            text,
        });
        while self.reflections.len() > MAX_REFLECTIONS {
            self.reflections.pop_front();
        }
    }
}

/// Built-in personality presets, referenced by name from
/// `create_evolving_crew`'s `personality_preset` field and by
/// `create_agent_from_template`. Preset *content* (specific trait
/// catalogs) is explicitly out of scope per spec.md §1 — these are
/// deliberately small, neutral starting points, not a curated library.
pub fn personality_preset(name: &str) -> HashMap<String, f64> {
    let mut traits = HashMap::new();
    match name {
        "analytical" => {
            traits.insert("analytical".to_string(), 0.8);
            traits.insert("creative".to_string(), 0.3);
            traits.insert("collaborative".to_string(), 0.5);
        }
        "creative" => {
            traits.insert("analytical".to_string(), 0.3);
            traits.insert("creative".to_string(), 0.8);
            traits.insert("collaborative".to_string(), 0.5);
        }
        "collaborative" => {
            traits.insert("analytical".to_string(), 0.4);
            traits.insert("creative".to_string(), 0.4);
            traits.insert("collaborative".to_string(), 0.9);
        }
        _ => {
            traits.insert("analytical".to_string(), 0.5);
            traits.insert("creative".to_string(), 0.5);
            traits.insert("collaborative".to_string(), 0.5);
        }
    }
    traits
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_traits_keeps_values_in_bounds() {
        let mut agent = Agent::new("Writer", "write", "a writer");
        agent.personality.insert("boldness".to_string(), 1.4);
        agent.personality.insert("caution".to_string(), -0.2);
        agent.clamp_traits();
        assert_eq!(agent.personality["boldness"], 1.0);
        assert_eq!(agent.personality["caution"], 0.0);
    }

    #[test]
    fn rolling_success_rate_requires_minimum_samples() {
        let mut exp = Experience::default();
        for _ in 0..9 {
            exp.record_outcome(true, 0.8);
        }
        assert_eq!(exp.rolling_success_rate(10), None);
        exp.record_outcome(false, 0.2);
        assert!(exp.rolling_success_rate(10).is_some());
    }

    #[test]
    fn consecutive_failures_counts_trailing_run() {
        let mut exp = Experience::default();
        exp.record_outcome(true, 0.9);
        exp.record_outcome(false, 0.1);
        exp.record_outcome(false, 0.2);
        exp.record_outcome(false, 0.1);
        assert_eq!(exp.consecutive_failures(), 3);
    }

    #[test]
    fn reflections_are_bounded() {
        let mut agent = Agent::new("Writer", "write", "a writer");
        for i in 0..(MAX_REFLECTIONS + 10) {
            agent.push_reflection(None, format!("reflection {i}"));
        }
        assert_eq!(agent.reflections.len(), MAX_REFLECTIONS);
        assert_eq!(agent.reflections.front().unwrap().text, "reflection 10");
    }
}
