//! Evolution trigger evaluation.
//!
//! Corresponds to spec.md §4.5 "Triggers". Each trigger, if it fires,
//! carries enough context for [`super::strategies`] to deterministically
//! pick a strategy.

use chrono::{DateTime, Utc};

use crate::agent::Agent;

/// A fired trigger, with the context the strategy picker needs.
#[derive(Debug, Clone)]
pub enum Trigger {
    LowRollingSuccessRate { rate: f64 },
    ConsecutiveFailures { count: u32 },
    StaleAgent { weeks_since_evolved: i64 },
    SelfAssessmentImbalance { reason: String },
    ExplicitUserTrigger,
}

const ROLLING_WINDOW_MIN_TASKS: usize = 10;
const ROLLING_SUCCESS_THRESHOLD: f64 = 0.6;
const CONSECUTIVE_FAILURE_THRESHOLD: u32 = 3;
const STALE_WEEKS: i64 = 4;

/// Evaluate the automatic (non-explicit) triggers for one agent.
/// Returns every trigger that currently fires; callers pick the
/// highest-severity one deterministically (see [`super::strategies::pick`]).
pub fn evaluate(agent: &Agent, now: DateTime<Utc>) -> Vec<Trigger> {
    let mut fired = Vec::new();

    if let Some(rate) = agent.experience.rolling_success_rate(ROLLING_WINDOW_MIN_TASKS) {
        if rate < ROLLING_SUCCESS_THRESHOLD {
            fired.push(Trigger::LowRollingSuccessRate { rate });
        }
    }

    let consecutive = agent.experience.consecutive_failures();
    if consecutive >= CONSECUTIVE_FAILURE_THRESHOLD {
        fired.push(Trigger::ConsecutiveFailures { count: consecutive });
    }

    if agent.experience.tasks_completed >= 1 {
        let last = agent.last_evolved_at.unwrap_or(agent.created_at);
        let weeks = (now - last).num_weeks();
        if weeks > STALE_WEEKS {
            fired.push(Trigger::StaleAgent {
                weeks_since_evolved: weeks,
            });
        }
    }

    fired
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn low_success_rate_fires_once_window_is_full() {
        let mut agent = Agent::new("R", "g", "b");
        for _ in 0..6 {
            agent.experience.record_outcome(true, 0.8);
        }
        for _ in 0..5 {
            agent.experience.record_outcome(false, 0.1);
        }
        let fired = evaluate(&agent, Utc::now());
        assert!(fired
            .iter()
            .any(|t| matches!(t, Trigger::LowRollingSuccessRate { .. })));
    }

    #[test]
    fn stale_agent_requires_at_least_one_task() {
        let agent = Agent::new("R", "g", "b");
        let far_future = Utc::now() + chrono::Duration::weeks(10);
        let fired = evaluate(&agent, far_future);
        assert!(!fired.iter().any(|t| matches!(t, Trigger::StaleAgent { .. })));
    }
}
