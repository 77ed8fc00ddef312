//! Evolution strategies.
//!
//! Corresponds to spec.md §4.5 "Strategies". `pick` deterministically
//! maps trigger context to exactly one strategy — no free-text/LLM
//! choice, per the closed-enum REDESIGN FLAG.

use std::collections::HashMap;

use crate::agent::Agent;
use crate::evolution::triggers::Trigger;
use crate::evolution::EvolutionKind;

const DRIFT_DELTA: f64 = 0.1;
const SPECIALIZATION_BUMP: f64 = 0.1;
const SPECIALIZATION_REDUCE: f64 = 0.05;
const COLLABORATIVE_BUMP: f64 = 0.15;
const RADICAL_RETENTION: f64 = 0.3;

/// Pick exactly one strategy for the given (possibly multiple) fired
/// triggers, favoring the most severe signal: sustained low
/// performance escalates to RadicalTransformation; a lone consecutive-
/// failure or self-assessment signal favors RoleSpecialization;
/// collaboration-flagged imbalance favors CollaborativeAdaptation;
/// everything else is a PersonalityDrift.
pub fn pick(triggers: &[Trigger], agent: &Agent) -> EvolutionKind {
    let sustained_low_rate = triggers.iter().any(|t| {
        matches!(t, Trigger::LowRollingSuccessRate { rate } if *rate < 0.3)
    }) && agent.evolution_cycles >= 2;
    if sustained_low_rate {
        return EvolutionKind::RadicalTransformation;
    }

    if triggers
        .iter()
        .any(|t| matches!(t, Trigger::SelfAssessmentImbalance { reason } if reason.contains("collaborat")))
    {
        return EvolutionKind::CollaborativeAdaptation;
    }

    if triggers
        .iter()
        .any(|t| matches!(t, Trigger::ConsecutiveFailures { .. } | Trigger::SelfAssessmentImbalance { .. }))
    {
        return EvolutionKind::RoleSpecialization;
    }

    EvolutionKind::PersonalityDrift
}

/// Apply a strategy to an agent's personality map, returning the new
/// map (the caller is responsible for the previous/new diffing and
/// persistence). Always clamps to `[0, 1]`.
pub fn apply(kind: EvolutionKind, agent: &Agent) -> HashMap<String, f64> {
    let mut traits = agent.personality.clone();
    if traits.is_empty() {
        return traits;
    }

    match kind {
        EvolutionKind::PersonalityDrift => {
            let mut keys: Vec<_> = traits.keys().cloned().collect();
            keys.sort();
            let n = keys.len().min(3).max(1);
            for key in keys.into_iter().take(n) {
                let bias = if (agent.experience.avg_quality - 0.5) >= 0.0 {
                    DRIFT_DELTA
                } else {
                    -DRIFT_DELTA
                };
                if let Some(v) = traits.get_mut(&key) {
                    *v = (*v + bias).clamp(0.0, 1.0);
                }
            }
        }
        EvolutionKind::RoleSpecialization => {
            let mut sorted: Vec<(String, f64)> = traits.iter().map(|(k, v)| (k.clone(), *v)).collect();
            sorted.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap());
            if let Some((top, _)) = sorted.first() {
                if let Some(v) = traits.get_mut(top) {
                    *v = (*v + SPECIALIZATION_BUMP).clamp(0.0, 1.0);
                }
            }
            for (k, _) in sorted.iter().rev().take(2) {
                if let Some(v) = traits.get_mut(k) {
                    *v = (*v - SPECIALIZATION_REDUCE).clamp(0.0, 1.0);
                }
            }
        }
        EvolutionKind::CollaborativeAdaptation => {
            let key = traits
                .keys()
                .find(|k| k.contains("collaborat"))
                .cloned()
                .unwrap_or_else(|| "collaborative".to_string());
            let entry = traits.entry(key).or_insert(0.5);
            *entry = (*entry + COLLABORATIVE_BUMP).clamp(0.0, 1.0);
        }
        EvolutionKind::RadicalTransformation => {
            let template = crate::agent::personality_preset("balanced");
            let mut merged = HashMap::new();
            for (k, v) in &template {
                let prior = traits.get(k).copied().unwrap_or(*v);
                merged.insert(k.clone(), (prior * RADICAL_RETENTION + v * (1.0 - RADICAL_RETENTION)).clamp(0.0, 1.0));
            }
            traits = merged;
        }
    }
    traits
}

/// Narrowed goal text for RoleSpecialization, per spec.md §4.5 ("narrow
/// goal text toward dominant strength").
pub fn specialized_goal(original_goal: &str, agent: &Agent) -> String {
    let dominant = agent
        .personality
        .iter()
        .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
        .map(|(k, _)| k.clone());
    match dominant {
        Some(trait_name) => format!("{original_goal} (specializing toward {trait_name})"),
        None => original_goal.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent_with_traits(traits: &[(&str, f64)]) -> Agent {
        let mut a = Agent::new("R", "g", "b");
        for (k, v) in traits {
            a.personality.insert(k.to_string(), *v);
        }
        a
    }

    #[test]
    fn collaborative_adaptation_clamps_at_one() {
        let agent = agent_with_traits(&[("collaborative", 0.95)]);
        let traits = apply(EvolutionKind::CollaborativeAdaptation, &agent);
        assert_eq!(traits["collaborative"], 1.0);
    }

    #[test]
    fn role_specialization_bumps_top_reduces_bottom_two() {
        let agent = agent_with_traits(&[("a", 0.9), ("b", 0.2), ("c", 0.1)]);
        let traits = apply(EvolutionKind::RoleSpecialization, &agent);
        assert!(traits["a"] > 0.9);
        assert!(traits["b"] < 0.2);
        assert!(traits["c"] < 0.1);
    }

    #[test]
    fn radical_transformation_retains_30_percent_of_prior() {
        let agent = agent_with_traits(&[("analytical", 1.0)]);
        let traits = apply(EvolutionKind::RadicalTransformation, &agent);
        // template "balanced" analytical = 0.5; 1.0*0.3 + 0.5*0.7 = 0.65
        assert!((traits["analytical"] - 0.65).abs() < 1e-9);
    }
}
