//! Crew Manager: the facade spec.md §4.6 describes — crew/agent
//! catalog, workflow kickoff, instruction routing, introspection.
//!
//! Grounded on the teacher's `crew.rs` for what a crew-creation spec
//! looks like, narrowed to the fields this kernel actually owns.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::agent::{personality_preset, Agent};
use crate::config::SaturationPolicy;
use crate::crew::{Crew, CrewState, CrewTask};
use crate::error::AppError;
use crate::ids::{AgentId, CrewId, InstructionId, WorkflowId};
use crate::instructions::bus::InstructionBus;
use crate::instructions::{Instruction, InstructionKind};
use crate::store::Store;
use crate::workflow::state_machine::{self, WorkflowContext};
use crate::workflow::{Workflow, WorkflowState};

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Reattach an existing agent by id instead of minting a new one —
    /// spec.md §4.6 "existing ones reattached by AgentId".
    pub existing_agent_id: Option<AgentId>,
    pub role: String,
    pub goal: String,
    pub backstory: String,
    pub personality_preset: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TaskConfig {
    pub description: String,
    pub expected_output: String,
    pub assigned_agent: Option<AgentId>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateCrewSpec {
    pub crew_name: String,
    pub agents_config: Vec<AgentConfig>,
    pub tasks: Vec<TaskConfig>,
    pub autonomy_level: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CrewStatus {
    pub crew_id: CrewId,
    pub state: String,
    pub agents: Vec<AgentSummary>,
    pub workflow: Option<WorkflowSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentSummary {
    pub agent_id: AgentId,
    pub role: String,
    pub evolution_cycles: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkflowSummary {
    pub workflow_id: WorkflowId,
    pub state: String,
    pub cancellation_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CrewSelfAssessment {
    pub strengths: Vec<String>,
    pub gaps: Vec<String>,
    pub recommendations: Vec<String>,
}

/// Margin below the crew mean success rate that flags an agent as a
/// "gap" in `crew_self_assessment` — SPEC_FULL.md's committed
/// self-assessment algorithm.
pub const SELF_ASSESSMENT_GAP_MARGIN: f64 = 0.25;

pub struct CrewManager {
    store: Arc<dyn Store>,
    bus: Arc<InstructionBus>,
    workflow_ctx: Arc<WorkflowContext>,
    saturation_policy: SaturationPolicy,
}

impl CrewManager {
    pub fn new(
        store: Arc<dyn Store>,
        bus: Arc<InstructionBus>,
        workflow_ctx: Arc<WorkflowContext>,
        saturation_policy: SaturationPolicy,
    ) -> Self {
        Self {
            store,
            bus,
            workflow_ctx,
            saturation_policy,
        }
    }

    pub async fn create_crew(&self, spec: CreateCrewSpec) -> Result<(CrewId, Vec<AgentId>), AppError> {
        for existing in self.store.list_crews().await? {
            if existing.name == spec.crew_name {
                return Err(AppError::Conflict(format!("crew '{}' already exists", spec.crew_name)));
            }
        }

        let mut agent_ids = Vec::with_capacity(spec.agents_config.len());
        for config in &spec.agents_config {
            let agent_id = if let Some(existing_id) = config.existing_agent_id {
                self.store.get_agent(existing_id).await?;
                existing_id
            } else {
                let mut agent = Agent::new(config.role.clone(), config.goal.clone(), config.backstory.clone());
                if let Some(preset) = &config.personality_preset {
                    agent.personality = personality_preset(preset);
                }
                let id = agent.id;
                self.store.put_agent(&agent).await?;
                id
            };
            agent_ids.push(agent_id);
        }

        let tasks: Vec<CrewTask> = spec
            .tasks
            .into_iter()
            .map(|t| CrewTask {
                description: t.description,
                expected_output: t.expected_output,
                assigned_agent: t.assigned_agent,
            })
            .collect();
        for task in &tasks {
            if let Some(assigned) = task.assigned_agent {
                if !agent_ids.contains(&assigned) {
                    return Err(AppError::Misconfigured(format!(
                        "task '{}' assigned to an agent not in agents_config",
                        task.description
                    )));
                }
            }
        }

        let crew = Crew::new(spec.crew_name, agent_ids.clone(), tasks, spec.autonomy_level);
        self.store.put_crew(&crew).await?;
        Ok((crew.id, agent_ids))
    }

    pub async fn start_crew(
        &self,
        crew_id: CrewId,
        context: Option<String>,
        allow_evolution: bool,
    ) -> Result<WorkflowId, AppError> {
        let mut crew = self.store.get_crew(crew_id).await?;
        if self.store.get_active_workflow_for_crew(crew_id).await?.is_some() {
            return Err(AppError::Conflict(format!("crew {crew_id} already has an active workflow")));
        }

        if self.saturation_policy == SaturationPolicy::Fail && self.workflow_ctx.worker_pool.available_permits() == 0 {
            return Err(AppError::Unavailable("worker pool is saturated".to_string()));
        }

        let mut workflow = Workflow::new(crew_id, context, allow_evolution);
        workflow.transition(WorkflowState::Preparing);
        self.store.put_workflow(&workflow).await?;

        crew.state = CrewState::Running;
        self.store.put_crew(&crew).await?;

        let workflow_id = workflow.id;
        let ctx = self.workflow_ctx.clone();
        let store = self.store.clone();
        tokio::spawn(async move {
            match state_machine::run(ctx, workflow, crew).await {
                Ok(finished) => {
                    if let Ok(mut crew_after) = store.get_crew(finished.crew_id).await {
                        crew_after.state = CrewState::Idle;
                        if let Err(e) = store.put_crew(&crew_after).await {
                            tracing::error!(error = %e, "failed to persist crew idle state after workflow");
                        }
                    }
                }
                Err(e) => tracing::error!(error = %e, "workflow run returned an error"),
            }
        });

        Ok(workflow_id)
    }

    pub async fn add_instruction(
        &self,
        crew_id: CrewId,
        kind: InstructionKind,
        priority: u8,
        content: String,
    ) -> Result<InstructionId, AppError> {
        self.store.get_crew(crew_id).await?;
        let instruction = Instruction::new(crew_id, kind, priority, content);
        self.bus.submit(instruction).await
    }

    pub async fn get_crew_status(&self, crew_id: CrewId) -> Result<CrewStatus, AppError> {
        let crew = self.store.get_crew(crew_id).await?;
        let mut agents = Vec::with_capacity(crew.agent_ids.len());
        for agent_id in &crew.agent_ids {
            let agent = self.store.get_agent(*agent_id).await?;
            agents.push(AgentSummary {
                agent_id: agent.id,
                role: agent.role,
                evolution_cycles: agent.evolution_cycles,
            });
        }
        let workflow = self
            .store
            .get_active_workflow_for_crew(crew_id)
            .await?
            .map(|w| WorkflowSummary {
                workflow_id: w.id,
                state: w.state.as_str().to_string(),
                cancellation_reason: w.cancellation_reason,
            });
        Ok(CrewStatus {
            crew_id,
            state: format!("{:?}", crew.state).to_lowercase(),
            agents,
            workflow,
        })
    }

    pub async fn list_active_crews(&self) -> Result<(Vec<CrewStatus>, usize, usize), AppError> {
        let crews = self.store.list_crews().await?;
        let mut statuses = Vec::new();
        let mut total_agents = 0usize;
        let mut active = 0usize;
        for crew in &crews {
            total_agents += crew.agent_ids.len();
            if crew.state == CrewState::Running {
                active += 1;
            }
            statuses.push(self.get_crew_status(crew.id).await?);
        }
        Ok((statuses, active, total_agents))
    }

    pub async fn get_agent_reflection(&self, agent_id: AgentId) -> Result<serde_json::Value, AppError> {
        let agent = self.store.get_agent(agent_id).await?;
        Ok(serde_json::json!({
            "reflections": agent.reflections.iter().map(|r| serde_json::json!({
                "created_at": r.created_at,
                "workflow_id": r.workflow_id,
                "text": r.text,
            })).collect::<Vec<_>>(),
            "metrics": {
                "tasks_completed": agent.experience.tasks_completed,
                "successes": agent.experience.successes,
                "failures": agent.experience.failures,
                "avg_quality": agent.experience.avg_quality,
                "rolling_success_rate": agent.experience.rolling_success_rate(10),
            }
        }))
    }

    pub async fn get_agent_details(&self, agent_id: AgentId) -> Result<Agent, AppError> {
        Ok(self.store.get_agent(agent_id).await?)
    }

    pub async fn create_agent_from_template(
        &self,
        template: &str,
        role: String,
        goal: String,
        backstory: String,
    ) -> Result<Agent, AppError> {
        let mut agent = Agent::new(role, goal, backstory);
        agent.personality = personality_preset(template);
        self.store.put_agent(&agent).await?;
        Ok(agent)
    }

    pub fn store_handle(&self) -> Arc<dyn Store> {
        self.store.clone()
    }

    pub fn evolution_handle(&self) -> Arc<crate::evolution::engine::EvolutionEngine> {
        self.workflow_ctx.evolution.clone()
    }

    pub async fn disband_crew(&self, crew_id: CrewId) -> Result<(), AppError> {
        let crew = self.store.get_crew(crew_id).await?;
        if crew.state != CrewState::Idle {
            return Err(AppError::Conflict(format!(
                "crew {crew_id} can only be disbanded from idle state, currently {:?}",
                crew.state
            )));
        }
        self.store.delete_crew(crew_id).await?;
        Ok(())
    }

    /// SPEC_FULL.md's self-assessment algorithm: an agent's overall
    /// success rate more than [`SELF_ASSESSMENT_GAP_MARGIN`] below the
    /// crew's mean is a gap; at or above the mean is a strength.
    pub async fn crew_self_assessment(&self, crew_id: CrewId) -> Result<CrewSelfAssessment, AppError> {
        let crew = self.store.get_crew(crew_id).await?;
        let mut rates = Vec::new();
        for agent_id in &crew.agent_ids {
            let agent = self.store.get_agent(*agent_id).await?;
            if agent.experience.tasks_completed > 0 {
                let rate = agent.experience.successes as f64 / agent.experience.tasks_completed as f64;
                rates.push((agent.role.clone(), agent.id, rate));
            }
        }

        if rates.is_empty() {
            return Ok(CrewSelfAssessment {
                strengths: vec![],
                gaps: vec![],
                recommendations: vec!["no task history yet; run the crew before assessing".to_string()],
            });
        }

        let mean = rates.iter().map(|(_, _, r)| r).sum::<f64>() / rates.len() as f64;
        let mut strengths = Vec::new();
        let mut gaps = Vec::new();
        let mut recommendations = Vec::new();

        for (role, agent_id, rate) in &rates {
            if *rate >= mean {
                strengths.push(format!("{role} ({rate:.2} success rate)"));
            } else if mean - rate > SELF_ASSESSMENT_GAP_MARGIN {
                gaps.push(format!("{role} ({rate:.2} success rate, crew mean {mean:.2})"));
                recommendations.push(format!(
                    "consider `trigger_agent_evolution` for agent {agent_id} ({role})"
                ));
            }
        }

        Ok(CrewSelfAssessment {
            strengths,
            gaps,
            recommendations,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evolution::engine::EvolutionEngine;
    use crate::workflow::runner::SimulatedCrewRunner;
    use std::time::Duration;

    async fn manager() -> CrewManager {
        let store: Arc<dyn Store> = Arc::new(crate::store::sqlite::SqliteStore::open_in_memory().unwrap());
        let bus = Arc::new(InstructionBus::new(store.clone()));
        let ctx = Arc::new(WorkflowContext {
            bus: bus.clone(),
            evolution: Arc::new(EvolutionEngine::new(store.clone(), Duration::from_secs(6 * 3600))),
            runner: Arc::new(SimulatedCrewRunner::new()),
            worker_pool: Arc::new(tokio::sync::Semaphore::new(2)),
            data_root: std::env::temp_dir(),
            intake_poll_interval: Duration::from_millis(10),
            emergency_stop_deadline: Duration::from_secs(2),
            store: store.clone(),
        });
        CrewManager::new(store, bus, ctx, SaturationPolicy::Queue)
    }

    #[tokio::test]
    async fn create_crew_rejects_duplicate_name() {
        let manager = manager().await;
        let spec = CreateCrewSpec {
            crew_name: "m1".to_string(),
            agents_config: vec![AgentConfig {
                existing_agent_id: None,
                role: "Writer".to_string(),
                goal: "draft".to_string(),
                backstory: "veteran".to_string(),
                personality_preset: None,
            }],
            tasks: vec![],
            autonomy_level: 0.5,
        };
        manager.create_crew(spec.clone()).await.unwrap();
        let result = manager.create_crew(spec).await;
        assert!(matches!(result, Err(AppError::Conflict(_))));
    }

    #[tokio::test]
    async fn start_crew_twice_is_a_conflict() {
        let manager = manager().await;
        let spec = CreateCrewSpec {
            crew_name: "m2".to_string(),
            agents_config: vec![AgentConfig {
                existing_agent_id: None,
                role: "Writer".to_string(),
                goal: "draft".to_string(),
                backstory: "veteran".to_string(),
                personality_preset: None,
            }],
            tasks: vec![],
            autonomy_level: 0.5,
        };
        let (crew_id, _) = manager.create_crew(spec).await.unwrap();
        manager.start_crew(crew_id, None, false).await.unwrap();
        let result = manager.start_crew(crew_id, None, false).await;
        assert!(matches!(result, Err(AppError::Conflict(_))));
    }

    #[tokio::test]
    async fn self_assessment_with_no_history_recommends_running_first() {
        let manager = manager().await;
        let spec = CreateCrewSpec {
            crew_name: "m3".to_string(),
            agents_config: vec![AgentConfig {
                existing_agent_id: None,
                role: "Writer".to_string(),
                goal: "draft".to_string(),
                backstory: "veteran".to_string(),
                personality_preset: None,
            }],
            tasks: vec![],
            autonomy_level: 0.5,
        };
        let (crew_id, _) = manager.create_crew(spec).await.unwrap();
        let assessment = manager.crew_self_assessment(crew_id).await.unwrap();
        assert!(assessment.strengths.is_empty());
        assert!(assessment.gaps.is_empty());
        assert_eq!(assessment.recommendations.len(), 1);
    }
}
