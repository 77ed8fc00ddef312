//! `rusqlite`-backed `Store` implementation.
//!
//! Corresponds to spec.md §4.1's "reference backend". Grounded on
//! `memory/storage/ltm_sqlite_storage.rs`'s pattern of a single
//! `Connection` with sync calls wrapped in `tokio::task::spawn_blocking`;
//! adapted here to one shared connection behind a `parking_lot::Mutex`
//! (rusqlite's `Connection` is `!Sync`) rather than opening a fresh
//! connection per call, since every entity here is small and the
//! bottleneck is meant to be the mutex, not file handles.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use crate::agent::Agent;
use crate::crew::Crew;
use crate::error::StoreError;
use crate::evolution::EvolutionEvent;
use crate::ids::{AgentId, ApiKeyId, CrewId, InstructionId, WorkflowId};
use crate::instructions::{Instruction, InstructionStatus};
use crate::security::api_key::ApiKey;
use crate::security::audit::AuditRecord;
use crate::store::Store;
use crate::workflow::{Workflow, WorkflowState};

pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS agents (
        id TEXT PRIMARY KEY,
        json TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS crews (
        id TEXT PRIMARY KEY,
        json TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS workflows (
        id TEXT PRIMARY KEY,
        crew_id TEXT NOT NULL,
        state TEXT NOT NULL,
        json TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_workflows_crew ON workflows(crew_id);
    CREATE TABLE IF NOT EXISTS instructions (
        id TEXT PRIMARY KEY,
        crew_id TEXT NOT NULL,
        status TEXT NOT NULL,
        priority INTEGER NOT NULL,
        created_at TEXT NOT NULL,
        json TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_instructions_crew ON instructions(crew_id, status);
    CREATE TABLE IF NOT EXISTS evolution_events (
        id TEXT PRIMARY KEY,
        agent_id TEXT NOT NULL,
        cycle INTEGER NOT NULL,
        created_at TEXT NOT NULL,
        json TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_evolution_agent ON evolution_events(agent_id);
    CREATE TABLE IF NOT EXISTS audit_log (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        ts TEXT NOT NULL,
        json TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS api_keys (
        id TEXT PRIMARY KEY,
        key_hash TEXT NOT NULL UNIQUE,
        json TEXT NOT NULL
    );
";

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Unreachable(e.to_string()))?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn blocking<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock();
            f(&guard)
        })
        .await
        .map_err(|e| StoreError::Transaction(e.to_string()))?
    }
}

fn workflow_state_str(state: WorkflowState) -> &'static str {
    state.as_str()
}

#[async_trait]
impl Store for SqliteStore {
    async fn put_agent(&self, agent: &Agent) -> Result<(), StoreError> {
        let id = agent.id.to_string();
        let json = serde_json::to_string(agent)?;
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO agents (id, json) VALUES (?1, ?2)
                 ON CONFLICT(id) DO UPDATE SET json = excluded.json",
                params![id, json],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_agent(&self, id: AgentId) -> Result<Agent, StoreError> {
        let id_str = id.to_string();
        self.blocking(move |conn| {
            let json: Option<String> = conn
                .query_row("SELECT json FROM agents WHERE id = ?1", params![id_str], |row| row.get(0))
                .optional()?;
            match json {
                Some(json) => Ok(serde_json::from_str(&json)?),
                None => Err(StoreError::NotFound(format!("agent {id_str}"))),
            }
        })
        .await
    }

    async fn list_agents(&self) -> Result<Vec<Agent>, StoreError> {
        self.blocking(|conn| {
            let mut stmt = conn.prepare("SELECT json FROM agents")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            let mut agents = Vec::new();
            for row in rows {
                agents.push(serde_json::from_str(&row?)?);
            }
            Ok(agents)
        })
        .await
    }

    async fn put_crew(&self, crew: &Crew) -> Result<(), StoreError> {
        let id = crew.id.to_string();
        let json = serde_json::to_string(crew)?;
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO crews (id, json) VALUES (?1, ?2)
                 ON CONFLICT(id) DO UPDATE SET json = excluded.json",
                params![id, json],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_crew(&self, id: CrewId) -> Result<Crew, StoreError> {
        let id_str = id.to_string();
        self.blocking(move |conn| {
            let json: Option<String> = conn
                .query_row("SELECT json FROM crews WHERE id = ?1", params![id_str], |row| row.get(0))
                .optional()?;
            match json {
                Some(json) => Ok(serde_json::from_str(&json)?),
                None => Err(StoreError::NotFound(format!("crew {id_str}"))),
            }
        })
        .await
    }

    async fn list_crews(&self) -> Result<Vec<Crew>, StoreError> {
        self.blocking(|conn| {
            let mut stmt = conn.prepare("SELECT json FROM crews")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            let mut crews = Vec::new();
            for row in rows {
                crews.push(serde_json::from_str(&row?)?);
            }
            Ok(crews)
        })
        .await
    }

    async fn delete_crew(&self, id: CrewId) -> Result<(), StoreError> {
        let id_str = id.to_string();
        self.blocking(move |conn| {
            conn.execute("DELETE FROM crews WHERE id = ?1", params![id_str])?;
            Ok(())
        })
        .await
    }

    async fn append_evolution_event(&self, event: &EvolutionEvent) -> Result<(), StoreError> {
        let id = event.id.to_string();
        let agent_id = event.agent_id.to_string();
        let cycle = event.cycle as i64;
        let created_at = event.created_at.to_rfc3339();
        let json = serde_json::to_string(event)?;
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO evolution_events (id, agent_id, cycle, created_at, json) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![id, agent_id, cycle, created_at, json],
            )?;
            Ok(())
        })
        .await
    }

    async fn list_evolution_events(
        &self,
        agent_id: AgentId,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<EvolutionEvent>, StoreError> {
        let agent_id_str = agent_id.to_string();
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT json, created_at FROM evolution_events WHERE agent_id = ?1 ORDER BY cycle ASC",
            )?;
            let rows = stmt.query_map(params![agent_id_str], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            let mut events = Vec::new();
            for row in rows {
                let (json, created_at) = row?;
                if let Some(since) = since {
                    let ts: DateTime<Utc> = created_at.parse().unwrap_or(since);
                    if ts <= since {
                        continue;
                    }
                }
                events.push(serde_json::from_str(&json)?);
            }
            Ok(events)
        })
        .await
    }

    async fn list_all_evolution_events(&self) -> Result<Vec<EvolutionEvent>, StoreError> {
        self.blocking(|conn| {
            let mut stmt = conn.prepare("SELECT json FROM evolution_events ORDER BY created_at ASC")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            let mut events = Vec::new();
            for row in rows {
                events.push(serde_json::from_str(&row?)?);
            }
            Ok(events)
        })
        .await
    }

    async fn evolve_agent_transactional(&self, agent: &Agent, event: &EvolutionEvent) -> Result<(), StoreError> {
        let agent_id = agent.id.to_string();
        let agent_json = serde_json::to_string(agent)?;
        let event_id = event.id.to_string();
        let event_agent_id = event.agent_id.to_string();
        let cycle = event.cycle as i64;
        let created_at = event.created_at.to_rfc3339();
        let event_json = serde_json::to_string(event)?;

        self.blocking(move |conn| {
            let tx = conn.unchecked_transaction()?;
            tx.execute(
                "INSERT INTO agents (id, json) VALUES (?1, ?2)
                 ON CONFLICT(id) DO UPDATE SET json = excluded.json",
                params![agent_id, agent_json],
            )?;
            tx.execute(
                "INSERT INTO evolution_events (id, agent_id, cycle, created_at, json) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![event_id, event_agent_id, cycle, created_at, event_json],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn put_workflow(&self, workflow: &Workflow) -> Result<(), StoreError> {
        let id = workflow.id.to_string();
        let crew_id = workflow.crew_id.to_string();
        let state = workflow_state_str(workflow.state).to_string();
        let json = serde_json::to_string(workflow)?;
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO workflows (id, crew_id, state, json) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(id) DO UPDATE SET crew_id = excluded.crew_id, state = excluded.state, json = excluded.json",
                params![id, crew_id, state, json],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_workflow(&self, id: WorkflowId) -> Result<Workflow, StoreError> {
        let id_str = id.to_string();
        self.blocking(move |conn| {
            let json: Option<String> = conn
                .query_row("SELECT json FROM workflows WHERE id = ?1", params![id_str], |row| row.get(0))
                .optional()?;
            match json {
                Some(json) => Ok(serde_json::from_str(&json)?),
                None => Err(StoreError::NotFound(format!("workflow {id_str}"))),
            }
        })
        .await
    }

    async fn list_active_workflows(&self) -> Result<Vec<Workflow>, StoreError> {
        self.blocking(|conn| {
            let mut stmt = conn.prepare(
                "SELECT json FROM workflows WHERE state NOT IN ('completed', 'cancelled', 'failed')",
            )?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            let mut workflows = Vec::new();
            for row in rows {
                workflows.push(serde_json::from_str(&row?)?);
            }
            Ok(workflows)
        })
        .await
    }

    async fn get_active_workflow_for_crew(&self, crew_id: CrewId) -> Result<Option<Workflow>, StoreError> {
        let crew_id_str = crew_id.to_string();
        self.blocking(move |conn| {
            let json: Option<String> = conn
                .query_row(
                    "SELECT json FROM workflows WHERE crew_id = ?1 AND state NOT IN ('completed', 'cancelled', 'failed')
                     ORDER BY rowid DESC LIMIT 1",
                    params![crew_id_str],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(match json {
                Some(json) => Some(serde_json::from_str(&json)?),
                None => None,
            })
        })
        .await
    }

    async fn enqueue_instruction(&self, instruction: Instruction) -> Result<(), StoreError> {
        let id = instruction.id.to_string();
        let crew_id = instruction.crew_id.to_string();
        let status = format!("{:?}", instruction.status).to_lowercase();
        let priority = instruction.priority as i64;
        let created_at = instruction.created_at.to_rfc3339();
        let json = serde_json::to_string(&instruction)?;
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO instructions (id, crew_id, status, priority, created_at, json) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![id, crew_id, status, priority, created_at, json],
            )?;
            Ok(())
        })
        .await
    }

    async fn update_instruction_status(
        &self,
        id: InstructionId,
        status: InstructionStatus,
        error: Option<String>,
    ) -> Result<(), StoreError> {
        let id_str = id.to_string();
        let status_str = format!("{status:?}").to_lowercase();
        self.blocking(move |conn| {
            let existing: Option<String> = conn
                .query_row("SELECT json FROM instructions WHERE id = ?1", params![id_str], |row| row.get(0))
                .optional()?;
            let Some(existing) = existing else {
                return Err(StoreError::NotFound(format!("instruction {id_str}")));
            };
            let mut instruction: Instruction = serde_json::from_str(&existing)?;
            instruction.status = status;
            instruction.processed_at = Some(Utc::now());
            instruction.error = error;
            let json = serde_json::to_string(&instruction)?;
            conn.execute(
                "UPDATE instructions SET status = ?1, json = ?2 WHERE id = ?3",
                params![status_str, json, id_str],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_instruction(&self, id: InstructionId) -> Result<Instruction, StoreError> {
        let id_str = id.to_string();
        self.blocking(move |conn| {
            let json: Option<String> = conn
                .query_row("SELECT json FROM instructions WHERE id = ?1", params![id_str], |row| row.get(0))
                .optional()?;
            match json {
                Some(json) => Ok(serde_json::from_str(&json)?),
                None => Err(StoreError::NotFound(format!("instruction {id_str}"))),
            }
        })
        .await
    }

    async fn list_instructions(
        &self,
        crew_id: CrewId,
        status: Option<InstructionStatus>,
    ) -> Result<Vec<Instruction>, StoreError> {
        let crew_id_str = crew_id.to_string();
        self.blocking(move |conn| {
            let mut instructions = Vec::new();
            if let Some(status) = status {
                let status_str = format!("{status:?}").to_lowercase();
                let mut stmt = conn.prepare("SELECT json FROM instructions WHERE crew_id = ?1 AND status = ?2")?;
                let rows = stmt.query_map(params![crew_id_str, status_str], |row| row.get::<_, String>(0))?;
                for row in rows {
                    instructions.push(serde_json::from_str(&row?)?);
                }
            } else {
                let mut stmt = conn.prepare("SELECT json FROM instructions WHERE crew_id = ?1")?;
                let rows = stmt.query_map(params![crew_id_str], |row| row.get::<_, String>(0))?;
                for row in rows {
                    instructions.push(serde_json::from_str(&row?)?);
                }
            }
            Ok(instructions)
        })
        .await
    }

    async fn expire_stale_instructions(&self, max_age: Duration) -> Result<u64, StoreError> {
        let cutoff = (Utc::now() - max_age).to_rfc3339();
        self.blocking(move |conn| {
            let tx = conn.unchecked_transaction()?;
            let stale: Vec<(String, String)> = {
                let mut stmt = tx.prepare(
                    "SELECT id, json FROM instructions
                     WHERE status = 'pending' AND priority < 5 AND created_at < ?1",
                )?;
                let rows = stmt.query_map(params![cutoff], |row| Ok((row.get(0)?, row.get(1)?)))?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            };

            let mut changed = 0u64;
            for (id, json) in stale {
                let mut instruction: Instruction = serde_json::from_str(&json)?;
                instruction.status = InstructionStatus::Expired;
                instruction.processed_at = Some(Utc::now());
                let updated_json = serde_json::to_string(&instruction)?;
                tx.execute(
                    "UPDATE instructions SET status = 'expired', json = ?1 WHERE id = ?2",
                    params![updated_json, id],
                )?;
                changed += 1;
            }
            tx.commit()?;
            Ok(changed)
        })
        .await
    }

    async fn append_audit(&self, record: &AuditRecord) -> Result<(), StoreError> {
        let ts = record.ts.to_rfc3339();
        let json = serde_json::to_string(record)?;
        self.blocking(move |conn| {
            conn.execute("INSERT INTO audit_log (ts, json) VALUES (?1, ?2)", params![ts, json])?;
            Ok(())
        })
        .await
    }

    async fn recent_audit(&self, limit: usize) -> Result<Vec<AuditRecord>, StoreError> {
        let limit = limit as i64;
        self.blocking(move |conn| {
            let mut stmt = conn.prepare("SELECT json FROM audit_log ORDER BY seq DESC LIMIT ?1")?;
            let rows = stmt.query_map(params![limit], |row| row.get::<_, String>(0))?;
            let mut records = Vec::new();
            for row in rows {
                records.push(serde_json::from_str(&row?)?);
            }
            Ok(records)
        })
        .await
    }

    async fn get_api_key_by_hash(&self, hash: &str) -> Result<Option<ApiKey>, StoreError> {
        let hash = hash.to_string();
        self.blocking(move |conn| {
            let json: Option<String> = conn
                .query_row("SELECT json FROM api_keys WHERE key_hash = ?1", params![hash], |row| row.get(0))
                .optional()?;
            Ok(match json {
                Some(json) => Some(serde_json::from_str(&json)?),
                None => None,
            })
        })
        .await
    }

    async fn put_api_key(&self, key: &ApiKey) -> Result<(), StoreError> {
        let id = key.id.to_string();
        let hash = key.key_hash.clone();
        let json = serde_json::to_string(key)?;
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO api_keys (id, key_hash, json) VALUES (?1, ?2, ?3)
                 ON CONFLICT(id) DO UPDATE SET key_hash = excluded.key_hash, json = excluded.json",
                params![id, hash, json],
            )?;
            Ok(())
        })
        .await
    }

    async fn touch_api_key_last_used(&self, id: ApiKeyId) -> Result<(), StoreError> {
        let id_str = id.to_string();
        self.blocking(move |conn| {
            let existing: Option<String> = conn
                .query_row("SELECT json FROM api_keys WHERE id = ?1", params![id_str], |row| row.get(0))
                .optional()?;
            let Some(existing) = existing else {
                return Err(StoreError::NotFound(format!("api key {id_str}")));
            };
            let mut key: ApiKey = serde_json::from_str(&existing)?;
            key.last_used_at = Some(Utc::now());
            let json = serde_json::to_string(&key)?;
            conn.execute("UPDATE api_keys SET json = ?1 WHERE id = ?2", params![json, id_str])?;
            Ok(())
        })
        .await
    }

    async fn count_api_keys(&self) -> Result<u64, StoreError> {
        self.blocking(|conn| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM api_keys", [], |row| row.get(0))?;
            Ok(count as u64)
        })
        .await
    }

    async fn recover_interrupted_workflows(&self) -> Result<Vec<WorkflowId>, StoreError> {
        self.blocking(|conn| {
            let mut stmt = conn.prepare(
                "SELECT json FROM workflows WHERE state NOT IN ('completed', 'cancelled', 'failed')",
            )?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            let mut recovered = Vec::new();
            for row in rows {
                let mut workflow: Workflow = serde_json::from_str(&row?)?;
                workflow.state = WorkflowState::Failed;
                workflow.ended_at = Some(Utc::now());
                workflow.cancellation_reason = Some("process-restart".to_string());
                let json = serde_json::to_string(&workflow)?;
                conn.execute(
                    "UPDATE workflows SET state = 'failed', json = ?1 WHERE id = ?2",
                    params![json, workflow.id.to_string()],
                )?;
                recovered.push(workflow.id);
            }
            Ok(recovered)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::Agent;

    #[tokio::test]
    async fn put_then_get_agent_round_trips() {
        let store = SqliteStore::open_in_memory().unwrap();
        let agent = Agent::new("Writer", "draft", "veteran writer");
        store.put_agent(&agent).await.unwrap();
        let fetched = store.get_agent(agent.id).await.unwrap();
        assert_eq!(fetched.role, "Writer");
    }

    #[tokio::test]
    async fn get_missing_agent_is_not_found() {
        let store = SqliteStore::open_in_memory().unwrap();
        let result = store.get_agent(AgentId::new()).await;
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn recover_interrupted_workflows_marks_non_terminal_as_failed() {
        let store = SqliteStore::open_in_memory().unwrap();
        let crew_id = CrewId::new();
        let mut workflow = Workflow::new(crew_id, None, false);
        workflow.transition(WorkflowState::Executing);
        store.put_workflow(&workflow).await.unwrap();

        let recovered = store.recover_interrupted_workflows().await.unwrap();
        assert_eq!(recovered, vec![workflow.id]);

        let fetched = store.get_workflow(workflow.id).await.unwrap();
        assert_eq!(fetched.state, WorkflowState::Failed);
        assert_eq!(fetched.cancellation_reason.as_deref(), Some("process-restart"));
    }

    #[tokio::test]
    async fn expire_stale_instructions_never_touches_priority_five() {
        let store = SqliteStore::open_in_memory().unwrap();
        let crew_id = CrewId::new();
        let mut estop = Instruction::new(crew_id, crate::instructions::InstructionKind::EmergencyStop, 5, "stop".into());
        estop.created_at = Utc::now() - Duration::days(1);
        store.enqueue_instruction(estop.clone()).await.unwrap();

        let expired = store.expire_stale_instructions(Duration::seconds(1)).await.unwrap();
        assert_eq!(expired, 0);
        let fetched = store.get_instruction(estop.id).await.unwrap();
        assert_eq!(fetched.status, InstructionStatus::Pending);
    }
}
