//! Evolution Engine driver: cooldown enforcement, per-agent
//! serialization, and the transactional agent+event write.
//!
//! Corresponds to spec.md §4.5.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::error::AppError;
use crate::evolution::strategies;
use crate::evolution::triggers::{self, Trigger};
use crate::evolution::{EvolutionEvent, EvolutionKind};
use crate::ids::AgentId;
use crate::store::Store;

pub struct EvolutionEngine {
    store: Arc<dyn Store>,
    /// One lock per agent id, created on first use. Guarantees
    /// spec.md §3's "Evolution mutations to an agent are serialized
    /// per-agent (no two concurrent mutations)".
    locks: DashMap<AgentId, Arc<Mutex<()>>>,
    min_evolution_interval: chrono::Duration,
}

impl EvolutionEngine {
    pub fn new(store: Arc<dyn Store>, min_evolution_interval: std::time::Duration) -> Self {
        Self {
            store,
            locks: DashMap::new(),
            min_evolution_interval: chrono::Duration::from_std(min_evolution_interval)
                .unwrap_or(chrono::Duration::hours(6)),
        }
    }

    fn lock_for(&self, agent_id: AgentId) -> Arc<Mutex<()>> {
        self.locks.entry(agent_id).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    fn in_cooldown(&self, agent: &crate::agent::Agent) -> bool {
        match agent.last_evolved_at {
            Some(last) => Utc::now() - last < self.min_evolution_interval,
            None => false,
        }
    }

    /// Automatic sweep path used by the Supervisor's hourly evolution
    /// tick: evolves every agent whose triggers fire and who is outside
    /// cooldown. Returns the events written.
    pub async fn sweep(&self) -> Result<Vec<EvolutionEvent>, AppError> {
        let agents = self.store.list_agents().await?;
        let mut events = Vec::new();
        for agent in agents {
            if self.in_cooldown(&agent) {
                continue;
            }
            let fired = triggers::evaluate(&agent, Utc::now());
            if fired.is_empty() {
                continue;
            }
            if let Some(event) = self.evolve(agent.id, &fired, None).await? {
                events.push(event);
            }
        }
        Ok(events)
    }

    /// Evolve a single agent. `explicit_kind` overrides strategy
    /// selection for the `trigger_agent_evolution` tool; `forced`
    /// bypasses cooldown (spec.md §4.5 "unless manually forced").
    pub async fn evolve_one(
        &self,
        agent_id: AgentId,
        explicit_kind: Option<EvolutionKind>,
        forced: bool,
    ) -> Result<EvolutionEvent, AppError> {
        let agent = self.store.get_agent(agent_id).await?;
        if !forced && self.in_cooldown(&agent) {
            return Err(AppError::Conflict(format!(
                "agent {agent_id} is within its evolution cooldown"
            )));
        }
        let fired = if explicit_kind.is_some() {
            vec![Trigger::ExplicitUserTrigger]
        } else {
            triggers::evaluate(&agent, Utc::now())
        };
        self.evolve(agent_id, &fired, explicit_kind)
            .await?
            .ok_or_else(|| AppError::Conflict("no trigger currently fires for this agent".into()))
    }

    async fn evolve(
        &self,
        agent_id: AgentId,
        fired: &[Trigger],
        explicit_kind: Option<EvolutionKind>,
    ) -> Result<Option<EvolutionEvent>, AppError> {
        if fired.is_empty() && explicit_kind.is_none() {
            return Ok(None);
        }

        let lock = self.lock_for(agent_id);
        let _guard = lock.lock().await;

        // Re-read under the lock: another task may have just evolved
        // this agent, which would make us double-fire within the same
        // cooldown window (spec.md §8 "idempotent within the cooldown").
        let mut agent = self.store.get_agent(agent_id).await?;
        if explicit_kind.is_none() && self.in_cooldown(&agent) {
            return Ok(None);
        }

        let kind = explicit_kind.unwrap_or_else(|| strategies::pick(fired, &agent));
        let previous_traits = agent.personality.clone();
        let new_traits = strategies::apply(kind, &agent);

        if kind == EvolutionKind::RoleSpecialization {
            agent.goal = strategies::specialized_goal(&agent.goal, &agent);
        }
        agent.personality = new_traits.clone();
        agent.clamp_traits();
        agent.evolution_cycles += 1;
        agent.last_evolved_at = Some(Utc::now());

        let reason = describe_reason(fired, explicit_kind);
        let event = EvolutionEvent {
            id: uuid::Uuid::new_v4(),
            agent_id,
            cycle: agent.evolution_cycles,
            previous_traits,
            new_traits: agent.personality.clone(),
            kind,
            reason,
            created_at: Utc::now(),
        };

        self.store.evolve_agent_transactional(&agent, &event).await?;
        Ok(Some(event))
    }
}

fn describe_reason(fired: &[Trigger], explicit_kind: Option<EvolutionKind>) -> String {
    if explicit_kind.is_some() {
        return "explicit user trigger".to_string();
    }
    fired
        .iter()
        .map(|t| match t {
            Trigger::LowRollingSuccessRate { rate } => format!("rolling success rate {rate:.2} < 0.6"),
            Trigger::ConsecutiveFailures { count } => format!("{count} consecutive failures"),
            Trigger::StaleAgent { weeks_since_evolved } => {
                format!("{weeks_since_evolved} weeks since last evolution")
            }
            Trigger::SelfAssessmentImbalance { reason } => format!("self-assessment: {reason}"),
            Trigger::ExplicitUserTrigger => "explicit user trigger".to_string(),
        })
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::sqlite::SqliteStore;

    fn engine() -> (EvolutionEngine, Arc<dyn Store>) {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let engine = EvolutionEngine::new(store.clone(), std::time::Duration::from_secs(6 * 3600));
        (engine, store)
    }

    #[tokio::test]
    async fn trigger_twice_within_cooldown_yields_exactly_one_event() {
        let (engine, store) = engine();
        let mut agent = crate::agent::Agent::new("Writer", "write well", "veteran writer");
        agent.personality = crate::agent::personality_preset("analytical");
        for _ in 0..3 {
            agent.experience.record_outcome(false, 0.1);
        }
        store.put_agent(&agent).await.unwrap();

        let first = engine.evolve_one(agent.id, None, false).await.unwrap();
        assert_eq!(first.cycle, 1);

        let second = engine.evolve_one(agent.id, None, false).await;
        assert!(second.is_err(), "second trigger within cooldown must not fire");

        let events = store.list_evolution_events(agent.id, None).await.unwrap();
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn forced_evolution_bypasses_cooldown() {
        let (engine, store) = engine();
        let mut agent = crate::agent::Agent::new("Writer", "write well", "veteran writer");
        agent.personality = crate::agent::personality_preset("analytical");
        store.put_agent(&agent).await.unwrap();

        engine
            .evolve_one(agent.id, Some(EvolutionKind::PersonalityDrift), true)
            .await
            .unwrap();
        let second = engine
            .evolve_one(agent.id, Some(EvolutionKind::PersonalityDrift), true)
            .await
            .unwrap();
        assert_eq!(second.cycle, 2);
    }

    #[tokio::test]
    async fn trait_values_never_leave_unit_interval() {
        let (engine, store) = engine();
        let mut agent = crate::agent::Agent::new("Writer", "write well", "veteran writer");
        agent.personality.insert("boldness".to_string(), 0.98);
        store.put_agent(&agent).await.unwrap();

        for _ in 0..5 {
            let _ = engine
                .evolve_one(agent.id, Some(EvolutionKind::PersonalityDrift), true)
                .await;
        }
        let stored = store.get_agent(agent.id).await.unwrap();
        for v in stored.personality.values() {
            assert!(*v >= 0.0 && *v <= 1.0);
        }
    }
}
