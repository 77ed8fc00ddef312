//! The Store: durable state for agents, crews, workflows, instructions,
//! evolution events, audit, api keys.
//!
//! Corresponds to spec.md §4.1. Grounded on `memory/storage/ltm_sqlite_storage.rs`'s
//! use of `rusqlite` as crewAI's own embedded durable backend, and on
//! `contract/pg_store.rs`'s migrate-on-boot shape (referenced from
//! `src/bin/server.rs`) — adapted here to a single rusqlite connection,
//! which spec.md §4.1 explicitly allows as "the reference" backend.

pub mod sqlite;

use async_trait::async_trait;
use chrono::Duration;

use crate::agent::Agent;
use crate::crew::Crew;
use crate::error::StoreError;
use crate::evolution::EvolutionEvent;
use crate::ids::{AgentId, ApiKeyId, CrewId, InstructionId, WorkflowId};
use crate::instructions::{Instruction, InstructionStatus};
use crate::security::api_key::ApiKey;
use crate::security::audit::AuditRecord;
use crate::workflow::Workflow;

/// Durable persistence operations. Every method either succeeds or
/// fails with [`StoreError`]; cross-entity updates (currently only the
/// evolution path: agent mutation + event append) go through
/// [`Store::evolve_agent_transactional`] so they commit atomically.
#[async_trait]
pub trait Store: Send + Sync {
    async fn put_agent(&self, agent: &Agent) -> Result<(), StoreError>;
    async fn get_agent(&self, id: AgentId) -> Result<Agent, StoreError>;
    async fn list_agents(&self) -> Result<Vec<Agent>, StoreError>;

    async fn put_crew(&self, crew: &Crew) -> Result<(), StoreError>;
    async fn get_crew(&self, id: CrewId) -> Result<Crew, StoreError>;
    async fn list_crews(&self) -> Result<Vec<Crew>, StoreError>;
    async fn delete_crew(&self, id: CrewId) -> Result<(), StoreError>;

    async fn append_evolution_event(&self, event: &EvolutionEvent) -> Result<(), StoreError>;
    async fn list_evolution_events(
        &self,
        agent_id: AgentId,
        since: Option<chrono::DateTime<chrono::Utc>>,
    ) -> Result<Vec<EvolutionEvent>, StoreError>;
    async fn list_all_evolution_events(&self) -> Result<Vec<EvolutionEvent>, StoreError>;

    /// Atomic transaction: persist the mutated agent and append its
    /// evolution event together. spec.md §4.5 "Each evolution is
    /// executed as a single transaction".
    async fn evolve_agent_transactional(
        &self,
        agent: &Agent,
        event: &EvolutionEvent,
    ) -> Result<(), StoreError>;

    async fn put_workflow(&self, workflow: &Workflow) -> Result<(), StoreError>;
    async fn get_workflow(&self, id: WorkflowId) -> Result<Workflow, StoreError>;
    async fn list_active_workflows(&self) -> Result<Vec<Workflow>, StoreError>;
    async fn get_active_workflow_for_crew(&self, crew_id: CrewId) -> Result<Option<Workflow>, StoreError>;

    async fn enqueue_instruction(&self, instruction: Instruction) -> Result<(), StoreError>;
    async fn update_instruction_status(
        &self,
        id: InstructionId,
        status: InstructionStatus,
        error: Option<String>,
    ) -> Result<(), StoreError>;
    async fn get_instruction(&self, id: InstructionId) -> Result<Instruction, StoreError>;
    async fn list_instructions(
        &self,
        crew_id: CrewId,
        status: Option<InstructionStatus>,
    ) -> Result<Vec<Instruction>, StoreError>;
    async fn expire_stale_instructions(&self, max_age: Duration) -> Result<u64, StoreError>;

    async fn append_audit(&self, record: &AuditRecord) -> Result<(), StoreError>;
    async fn recent_audit(&self, limit: usize) -> Result<Vec<AuditRecord>, StoreError>;

    async fn get_api_key_by_hash(&self, hash: &str) -> Result<Option<ApiKey>, StoreError>;
    async fn put_api_key(&self, key: &ApiKey) -> Result<(), StoreError>;
    async fn touch_api_key_last_used(&self, id: ApiKeyId) -> Result<(), StoreError>;
    async fn count_api_keys(&self) -> Result<u64, StoreError>;

    /// Mark any workflow left in a non-terminal state at the previous
    /// process's exit as `Failed` with `reason = "process-restart"`.
    /// spec.md §8 scenario 6. Returns the ids that were transitioned.
    async fn recover_interrupted_workflows(&self) -> Result<Vec<WorkflowId>, StoreError>;
}
