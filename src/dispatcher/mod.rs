//! Tool Dispatcher: binds tool names to handlers, behind the Security
//! Gate.
//!
//! Corresponds to spec.md §4.8. Grounded on the teacher's
//! `server/routes.rs` route-table shape, collapsed from axum routes to
//! a single JSON-RPC `tools/call` entry point with an internal match on
//! tool name — the MCP surface is one method, many tool names, rather
//! than one HTTP route per tool.

use std::sync::Arc;
use std::time::Instant;

use serde::Deserialize;
use serde_json::{json, Value};

use crate::config::Config;
use crate::crew_manager::{AgentConfig, CreateCrewSpec, CrewManager, TaskConfig};
use crate::error::AppError;
use crate::evolution::EvolutionKind;
use crate::ids::{AgentId, CrewId, InstructionId};
use crate::instructions::{InstructionKind, InstructionStatus};
use crate::security::gate::SecurityGate;
use crate::supervisor::Supervisor;

pub struct Dispatcher {
    crew_manager: Arc<CrewManager>,
    supervisor: Arc<Supervisor>,
    gate: Arc<SecurityGate>,
    config: Arc<parking_lot::RwLock<Config>>,
    started_at: Instant,
}

impl Dispatcher {
    pub fn new(
        crew_manager: Arc<CrewManager>,
        supervisor: Arc<Supervisor>,
        gate: Arc<SecurityGate>,
        config: Arc<parking_lot::RwLock<Config>>,
    ) -> Self {
        Self {
            crew_manager,
            supervisor,
            gate,
            config,
            started_at: Instant::now(),
        }
    }

    /// Full request path: admit (steps 1-5), audit-start, route,
    /// audit-complete. The only entry point a transport should call.
    pub async fn dispatch(&self, credential: Option<&str>, tool_name: &str, args: Value) -> Result<Value, AppError> {
        let admitted = self.gate.admit(credential, tool_name, args).await?;
        let client_id = admitted.key.id.to_string();

        self.gate.audit_started(&client_id, tool_name, &admitted.args).await;
        let start = Instant::now();
        let result = self.route(tool_name, admitted.args.clone()).await;
        self.gate
            .audit_completed(
                &client_id,
                tool_name,
                &admitted.args,
                start.elapsed(),
                result.as_ref().err().map(|e| e.kind().to_string()),
            )
            .await;
        result
    }

    async fn route(&self, tool_name: &str, args: Value) -> Result<Value, AppError> {
        match tool_name {
            "create_evolving_crew" => self.create_evolving_crew(args).await,
            "run_autonomous_crew" => self.run_autonomous_crew(args).await,
            "get_crew_status" => self.get_crew_status(args).await,
            "list_active_crews" => self.list_active_crews().await,
            "crew_self_assessment" => self.crew_self_assessment(args).await,
            "add_dynamic_instruction" => self.add_dynamic_instruction(args).await,
            "list_dynamic_instructions" => self.list_dynamic_instructions(args).await,
            "get_instruction_status" => self.get_instruction_status(args).await,
            "trigger_agent_evolution" => self.trigger_agent_evolution(args).await,
            "get_agent_reflection" => self.get_agent_reflection(args).await,
            "create_agent_from_template" => self.create_agent_from_template(args).await,
            "get_agent_details" => self.get_agent_details(args).await,
            "get_live_events" => self.get_live_events(args).await,
            "get_evolution_summary" => self.get_evolution_summary().await,
            "health_check" => self.health_check().await,
            "get_server_config" => self.get_server_config().await,
            "reload_config" => self.reload_config().await,
            other => Err(AppError::NotFound(format!("unknown tool '{other}'"))),
        }
    }

    async fn create_evolving_crew(&self, args: Value) -> Result<Value, AppError> {
        #[derive(Deserialize)]
        struct Args {
            crew_name: String,
            agents_config: Vec<AgentConfig>,
            #[serde(default)]
            tasks: Vec<TaskConfig>,
            #[serde(default)]
            autonomy_level: f64,
        }
        let parsed: Args = serde_json::from_value(args).map_err(invalid_argument)?;
        let (crew_id, agent_ids) = self
            .crew_manager
            .create_crew(CreateCrewSpec {
                crew_name: parsed.crew_name,
                agents_config: parsed.agents_config,
                tasks: parsed.tasks,
                autonomy_level: parsed.autonomy_level,
            })
            .await?;
        Ok(json!({ "crew_id": crew_id, "agent_ids": agent_ids }))
    }

    async fn run_autonomous_crew(&self, args: Value) -> Result<Value, AppError> {
        #[derive(Deserialize)]
        struct Args {
            crew_id: CrewId,
            #[serde(default)]
            context: Option<String>,
            #[serde(default)]
            allow_evolution: bool,
        }
        let parsed: Args = serde_json::from_value(args).map_err(invalid_argument)?;
        let workflow_id = self
            .crew_manager
            .start_crew(parsed.crew_id, parsed.context, parsed.allow_evolution)
            .await?;
        Ok(json!({ "workflow_id": workflow_id, "state": "preparing" }))
    }

    async fn get_crew_status(&self, args: Value) -> Result<Value, AppError> {
        #[derive(Deserialize)]
        struct Args {
            crew_id: CrewId,
        }
        let parsed: Args = serde_json::from_value(args).map_err(invalid_argument)?;
        let status = self.crew_manager.get_crew_status(parsed.crew_id).await?;
        Ok(serde_json::to_value(status).map_err(AppError::internal)?)
    }

    async fn list_active_crews(&self) -> Result<Value, AppError> {
        let (crews, active_crews, total_agents) = self.crew_manager.list_active_crews().await?;
        Ok(json!({ "crews": crews, "active_crews": active_crews, "total_agents": total_agents }))
    }

    async fn crew_self_assessment(&self, args: Value) -> Result<Value, AppError> {
        #[derive(Deserialize)]
        struct Args {
            crew_id: CrewId,
        }
        let parsed: Args = serde_json::from_value(args).map_err(invalid_argument)?;
        let assessment = self.crew_manager.crew_self_assessment(parsed.crew_id).await?;
        Ok(serde_json::to_value(assessment).map_err(AppError::internal)?)
    }

    async fn add_dynamic_instruction(&self, args: Value) -> Result<Value, AppError> {
        #[derive(Deserialize)]
        struct Args {
            crew_id: CrewId,
            instruction: String,
            instruction_type: String,
            priority: u8,
        }
        let parsed: Args = serde_json::from_value(args).map_err(invalid_argument)?;
        let kind = InstructionKind::parse(&parsed.instruction_type)
            .ok_or_else(|| AppError::InvalidArgument(format!("unknown instruction_type '{}'", parsed.instruction_type)))?;
        let priority = if kind == InstructionKind::EmergencyStop { 5 } else { parsed.priority };
        let instruction_id = self
            .crew_manager
            .add_instruction(parsed.crew_id, kind, priority, parsed.instruction)
            .await?;
        Ok(json!({ "instruction_id": instruction_id, "status": "pending" }))
    }

    async fn list_dynamic_instructions(&self, args: Value) -> Result<Value, AppError> {
        #[derive(Deserialize)]
        struct Args {
            crew_id: CrewId,
            #[serde(default)]
            status: Option<String>,
        }
        let parsed: Args = serde_json::from_value(args).map_err(invalid_argument)?;
        let status = match parsed.status.as_deref() {
            Some("pending") => Some(InstructionStatus::Pending),
            Some("delivered") => Some(InstructionStatus::Delivered),
            Some("applied") => Some(InstructionStatus::Applied),
            Some("failed") => Some(InstructionStatus::Failed),
            Some("expired") => Some(InstructionStatus::Expired),
            Some(other) => return Err(AppError::InvalidArgument(format!("unknown status '{other}'"))),
            None => None,
        };
        let instructions = self.crew_manager_store().list_instructions(parsed.crew_id, status).await?;
        Ok(json!({ "instructions": instructions }))
    }

    async fn get_instruction_status(&self, args: Value) -> Result<Value, AppError> {
        #[derive(Deserialize)]
        struct Args {
            instruction_id: InstructionId,
        }
        let parsed: Args = serde_json::from_value(args).map_err(invalid_argument)?;
        let instruction = self.crew_manager_store().get_instruction(parsed.instruction_id).await?;
        Ok(json!({
            "id": instruction.id,
            "status": instruction.status,
            "processed_at": instruction.processed_at,
            "error": instruction.error,
        }))
    }

    async fn trigger_agent_evolution(&self, args: Value) -> Result<Value, AppError> {
        #[derive(Deserialize)]
        struct Args {
            agent_id: AgentId,
            #[serde(default)]
            evolution_type: Option<String>,
        }
        let parsed: Args = serde_json::from_value(args).map_err(invalid_argument)?;
        let kind = match parsed.evolution_type {
            Some(raw) => Some(
                EvolutionKind::parse(&raw)
                    .ok_or_else(|| AppError::InvalidArgument(format!("unknown evolution_type '{raw}'")))?,
            ),
            None => None,
        };
        let event = self.evolution().evolve_one(parsed.agent_id, kind, true).await?;
        Ok(json!({
            "agent_id": event.agent_id,
            "cycle": event.cycle,
            "previous_traits": event.previous_traits,
            "new_traits": event.new_traits,
        }))
    }

    async fn get_agent_reflection(&self, args: Value) -> Result<Value, AppError> {
        #[derive(Deserialize)]
        struct Args {
            agent_id: AgentId,
        }
        let parsed: Args = serde_json::from_value(args).map_err(invalid_argument)?;
        self.crew_manager.get_agent_reflection(parsed.agent_id).await
    }

    async fn create_agent_from_template(&self, args: Value) -> Result<Value, AppError> {
        #[derive(Deserialize)]
        struct Args {
            template: String,
            role: String,
            goal: String,
            backstory: String,
        }
        let parsed: Args = serde_json::from_value(args).map_err(invalid_argument)?;
        let agent = self
            .crew_manager
            .create_agent_from_template(&parsed.template, parsed.role, parsed.goal, parsed.backstory)
            .await?;
        Ok(serde_json::to_value(agent).map_err(AppError::internal)?)
    }

    async fn get_agent_details(&self, args: Value) -> Result<Value, AppError> {
        #[derive(Deserialize)]
        struct Args {
            agent_id: AgentId,
        }
        let parsed: Args = serde_json::from_value(args).map_err(invalid_argument)?;
        let agent = self.crew_manager.get_agent_details(parsed.agent_id).await?;
        Ok(serde_json::to_value(agent).map_err(AppError::internal)?)
    }

    async fn get_live_events(&self, args: Value) -> Result<Value, AppError> {
        #[derive(Deserialize, Default)]
        struct Args {
            #[serde(default)]
            limit: Option<usize>,
        }
        let parsed: Args = serde_json::from_value(args).unwrap_or_default();
        let limit = parsed.limit.unwrap_or(50).min(500);
        let records = self.crew_manager_store().recent_audit(limit).await?;
        Ok(json!({ "events": records }))
    }

    async fn get_evolution_summary(&self) -> Result<Value, AppError> {
        let events = self.crew_manager_store().list_all_evolution_events().await?;
        let mut by_kind = std::collections::HashMap::new();
        for event in &events {
            *by_kind.entry(event.kind.as_str()).or_insert(0u64) += 1;
        }
        Ok(json!({
            "total_events": events.len(),
            "by_kind": by_kind,
            "most_recent": events.last(),
        }))
    }

    async fn health_check(&self) -> Result<Value, AppError> {
        let snapshot = self.supervisor.health_snapshot();
        Ok(json!({
            "status": if snapshot.store_reachable { "ok" } else { "degraded" },
            "components": {
                "store": snapshot.store_reachable,
                "worker_pool_available": snapshot.worker_pool_available,
                "worker_pool_capacity": snapshot.worker_pool_capacity,
            },
            "uptime_secs": self.started_at.elapsed().as_secs(),
        }))
    }

    async fn get_server_config(&self) -> Result<Value, AppError> {
        Ok(self.config.read().sanitized_snapshot())
    }

    async fn reload_config(&self) -> Result<Value, AppError> {
        let fresh = Config::from_env().map_err(|e| AppError::InvalidArgument(e.to_string()))?;
        self.config.write().apply_reloadable(&fresh);
        Ok(json!({
            "reloaded": true,
            "restart_required_fields": Config::restart_required_fields(),
            "config": self.config.read().sanitized_snapshot(),
        }))
    }

    fn crew_manager_store(&self) -> Arc<dyn crate::store::Store> {
        self.crew_manager.store_handle()
    }

    fn evolution(&self) -> Arc<crate::evolution::engine::EvolutionEngine> {
        self.crew_manager.evolution_handle()
    }
}

fn invalid_argument(e: serde_json::Error) -> AppError {
    AppError::InvalidArgument(format!("argument schema mismatch: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evolution::engine::EvolutionEngine;
    use crate::instructions::bus::InstructionBus;
    use crate::security::api_key::ApiKey;
    use crate::store::sqlite::SqliteStore;
    use crate::store::Store;
    use crate::workflow::runner::SimulatedCrewRunner;
    use crate::workflow::state_machine::WorkflowContext;
    use std::time::Duration;

    async fn dispatcher() -> (Dispatcher, String) {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let (plaintext, key) = ApiKey::generate(vec!["*".to_string()]);
        store.put_api_key(&key).await.unwrap();

        let bus = Arc::new(InstructionBus::new(store.clone()));
        let config = Config::from_env().unwrap();
        let ctx = Arc::new(WorkflowContext {
            store: store.clone(),
            bus: bus.clone(),
            runner: Arc::new(SimulatedCrewRunner::new()),
            evolution: Arc::new(EvolutionEngine::new(store.clone(), Duration::from_secs(6 * 3600))),
            worker_pool: Arc::new(tokio::sync::Semaphore::new(2)),
            data_root: std::env::temp_dir(),
            intake_poll_interval: Duration::from_millis(10),
            emergency_stop_deadline: Duration::from_secs(2),
        });
        let crew_manager = Arc::new(CrewManager::new(
            store.clone(),
            bus.clone(),
            ctx.clone(),
            crate::config::SaturationPolicy::Queue,
        ));
        let supervisor = Arc::new(Supervisor::new(
            store.clone(),
            bus.clone(),
            ctx.evolution.clone(),
            ctx.worker_pool.clone(),
            2,
            Arc::new(parking_lot::RwLock::new(config.clone())),
        ));
        let gate = Arc::new(SecurityGate::new(store.clone(), &config));
        let dispatcher = Dispatcher::new(crew_manager, supervisor, gate, Arc::new(parking_lot::RwLock::new(config)));
        (dispatcher, plaintext)
    }

    #[tokio::test]
    async fn unknown_tool_is_not_found() {
        let (d, key) = dispatcher().await;
        let result = d.dispatch(Some(&key), "does_not_exist", json!({})).await;
        assert!(matches!(result, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn missing_credential_is_unauthenticated() {
        let (d, _key) = dispatcher().await;
        let result = d.dispatch(None, "health_check", json!({})).await;
        assert!(matches!(result, Err(AppError::Unauthenticated(_))));
    }

    #[tokio::test]
    async fn health_check_round_trips() {
        let (d, key) = dispatcher().await;
        let result = d.dispatch(Some(&key), "health_check", json!({})).await.unwrap();
        assert_eq!(result["status"], "ok");
    }

    #[tokio::test]
    async fn create_and_status_round_trip() {
        let (d, key) = dispatcher().await;
        let create_args = json!({
            "crew_name": "dispatcher-test-crew",
            "agents_config": [{
                "existing_agent_id": null,
                "role": "Writer",
                "goal": "draft",
                "backstory": "veteran",
                "personality_preset": null,
            }],
            "tasks": [],
            "autonomy_level": 0.5,
        });
        let created = d.dispatch(Some(&key), "create_evolving_crew", create_args).await.unwrap();
        let crew_id = created["crew_id"].clone();
        let status = d
            .dispatch(Some(&key), "get_crew_status", json!({ "crew_id": crew_id }))
            .await
            .unwrap();
        assert_eq!(status["state"], "idle");
    }

    #[tokio::test]
    async fn bad_argument_shape_is_invalid_argument() {
        let (d, key) = dispatcher().await;
        let result = d.dispatch(Some(&key), "get_crew_status", json!({ "wrong_field": 1 })).await;
        assert!(matches!(result, Err(AppError::InvalidArgument(_))));
    }
}
