//! Scheduler / Supervisor: named background ticking loops.
//!
//! Corresponds to spec.md §4.7 and the §9 REDESIGN FLAGS entry
//! "background `asyncio` tasks embedded in the server object → explicit
//! Supervisor component with named ticking loops, each with a
//! documented interval, cancellation token, and shutdown drain."

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::evolution::engine::EvolutionEngine;
use crate::instructions::bus::InstructionBus;
use crate::store::Store;
use crate::workflow::WorkflowState;

/// A point-in-time health snapshot, refreshed by the health-probe tick
/// and served by `health_check` / `GET /health`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct HealthSnapshot {
    pub store_reachable: bool,
    pub worker_pool_available: usize,
    pub worker_pool_capacity: usize,
    pub checked_at: chrono::DateTime<chrono::Utc>,
}

pub struct Supervisor {
    store: Arc<dyn Store>,
    bus: Arc<InstructionBus>,
    evolution: Arc<EvolutionEngine>,
    worker_pool: Arc<tokio::sync::Semaphore>,
    worker_pool_capacity: usize,
    config: Arc<parking_lot::RwLock<Config>>,
    health: Arc<parking_lot::RwLock<HealthSnapshot>>,
    shutdown: CancellationToken,
}

impl Supervisor {
    pub fn new(
        store: Arc<dyn Store>,
        bus: Arc<InstructionBus>,
        evolution: Arc<EvolutionEngine>,
        worker_pool: Arc<tokio::sync::Semaphore>,
        worker_pool_capacity: usize,
        config: Arc<parking_lot::RwLock<Config>>,
    ) -> Self {
        let health = Arc::new(parking_lot::RwLock::new(HealthSnapshot {
            store_reachable: true,
            worker_pool_available: worker_pool_capacity,
            worker_pool_capacity,
            checked_at: chrono::Utc::now(),
        }));
        Self {
            store,
            bus,
            evolution,
            worker_pool,
            worker_pool_capacity,
            config,
            health,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn health_snapshot(&self) -> HealthSnapshot {
        self.health.read().clone()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Spawn every ticking loop. Returns their join handles so `main`
    /// can await a clean drain on shutdown.
    pub fn spawn_all(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        vec![
            self.clone().spawn_evolution_sweep(),
            self.clone().spawn_instruction_expirer(),
            self.clone().spawn_workflow_reaper(),
            self.clone().spawn_health_probe(),
        ]
    }

    fn spawn_evolution_sweep(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let interval = self.config.read().evolution_sweep_interval;
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = self.shutdown.cancelled() => break,
                }
                match self.evolution.sweep().await {
                    Ok(events) if !events.is_empty() => {
                        tracing::info!(count = events.len(), "evolution sweep produced events");
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!(error = %e, "evolution sweep failed"),
                }
            }
        })
    }

    fn spawn_instruction_expirer(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.read().instruction_expirer_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = self.shutdown.cancelled() => break,
                }
                let ttl = chrono::Duration::from_std(self.config.read().instruction_ttl).unwrap_or(chrono::Duration::hours(1));
                match self.bus.expire(ttl).await {
                    Ok(count) if count > 0 => tracing::info!(count, "expired stale instructions"),
                    Ok(_) => {}
                    Err(e) => tracing::warn!(error = %e, "instruction expirer failed"),
                }
            }
        })
    }

    fn spawn_workflow_reaper(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.read().workflow_reaper_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = self.shutdown.cancelled() => break,
                }
                let max_duration = chrono::Duration::from_std(self.config.read().max_workflow_duration)
                    .unwrap_or(chrono::Duration::hours(1));
                match self.store.list_active_workflows().await {
                    Ok(workflows) => {
                        for workflow in workflows {
                            if workflow.state != WorkflowState::Executing {
                                continue;
                            }
                            if chrono::Utc::now() - workflow.started_at > max_duration {
                                tracing::warn!(workflow_id = %workflow.id, "reaping stuck workflow with emergency_stop");
                                let estop = crate::instructions::Instruction::new(
                                    workflow.crew_id,
                                    crate::instructions::InstructionKind::EmergencyStop,
                                    5,
                                    "workflow exceeded max_workflow_duration".to_string(),
                                );
                                if let Err(e) = self.bus.submit(estop).await {
                                    tracing::warn!(error = %e, "reaper failed to submit emergency_stop");
                                }
                            }
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "workflow reaper failed to list active workflows"),
                }
            }
        })
    }

    fn spawn_health_probe(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.read().health_probe_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = self.shutdown.cancelled() => break,
                }
                let store_reachable = self.store.count_api_keys().await.is_ok();
                let snapshot = HealthSnapshot {
                    store_reachable,
                    worker_pool_available: self.worker_pool.available_permits(),
                    worker_pool_capacity: self.worker_pool_capacity,
                    checked_at: chrono::Utc::now(),
                };
                *self.health.write() = snapshot;
            }
        })
    }

    /// Signal every ticking loop to stop and wait up to `timeout` for
    /// them to drain.
    pub async fn shutdown(&self, handles: Vec<JoinHandle<()>>, timeout: Duration) {
        self.shutdown.cancel();
        let drain = futures::future::join_all(handles);
        if tokio::time::timeout(timeout, drain).await.is_err() {
            tracing::warn!("supervisor shutdown drain timed out");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::store::sqlite::SqliteStore;

    #[tokio::test]
    async fn health_snapshot_starts_optimistic() {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let bus = Arc::new(InstructionBus::new(store.clone()));
        let evolution = Arc::new(EvolutionEngine::new(store.clone(), Duration::from_secs(6 * 3600)));
        let pool = Arc::new(tokio::sync::Semaphore::new(4));
        let config = Arc::new(parking_lot::RwLock::new(Config::from_env().unwrap()));
        let supervisor = Supervisor::new(store, bus, evolution, pool, 4, config);
        let snapshot = supervisor.health_snapshot();
        assert!(snapshot.store_reachable);
        assert_eq!(snapshot.worker_pool_capacity, 4);
    }
}
