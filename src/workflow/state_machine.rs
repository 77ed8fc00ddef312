//! The per-workflow driver: Preparing → Executing → Debriefing →
//! terminal, with a concurrent instruction intake loop.
//!
//! Corresponds to spec.md §4.4 and §5's concurrency model. One call to
//! [`run`] is spawned per workflow by the Crew Manager; it owns the
//! workflow end to end and persists every transition.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::crew::Crew;
use crate::error::AppError;
use crate::evolution::engine::EvolutionEngine;
use crate::ids::{AgentId, WorkflowId};
use crate::instructions::bus::{InstructionBus, WorkflowHandle};
use crate::instructions::InstructionKind;
use crate::security::validation;
use crate::store::Store;
use crate::workflow::runner::{live_context_channel, CrewRunner};
use crate::workflow::{Workflow, WorkflowState};

/// Everything a running workflow needs that outlives any one call.
pub struct WorkflowContext {
    pub store: Arc<dyn Store>,
    pub bus: Arc<InstructionBus>,
    pub runner: Arc<dyn CrewRunner>,
    pub evolution: Arc<EvolutionEngine>,
    pub worker_pool: Arc<Semaphore>,
    pub data_root: std::path::PathBuf,
    pub intake_poll_interval: Duration,
    pub emergency_stop_deadline: Duration,
}

/// Drive one workflow from `Created` to a terminal state. Persists
/// every transition so a crash mid-run is recoverable (spec.md §8
/// scenario 6, handled by `Store::recover_interrupted_workflows` at
/// boot).
pub async fn run(ctx: Arc<WorkflowContext>, mut workflow: Workflow, crew: Crew) -> Result<Workflow, AppError> {
    // Preparing.
    workflow.transition(WorkflowState::Preparing);
    ctx.store.put_workflow(&workflow).await?;

    if let Err(e) = prepare(&crew) {
        workflow.transition(WorkflowState::Failed);
        workflow.cancellation_reason = Some(e.to_string());
        ctx.store.put_workflow(&workflow).await?;
        return Ok(workflow);
    }

    // Executing.
    workflow.transition(WorkflowState::Executing);
    ctx.store.put_workflow(&workflow).await?;

    let cancel = CancellationToken::new();
    let notify = Arc::new(tokio::sync::Notify::new());
    ctx.bus.register_workflow(
        crew.id,
        WorkflowHandle {
            workflow_id: workflow.id,
            notify: notify.clone(),
            cancel: cancel.clone(),
        },
    );

    let (live_sink, _live_rx) = live_context_channel();
    let intake_handle = tokio::spawn(intake_loop(
        ctx.bus.clone(),
        crew.id,
        workflow.id,
        live_sink.clone(),
        notify,
        cancel.clone(),
        ctx.intake_poll_interval,
    ));

    let permit = ctx
        .worker_pool
        .clone()
        .acquire_owned()
        .await
        .map_err(|_| AppError::Unavailable("worker pool closed".to_string()))?;

    let outcome = execute_with_estop(&ctx, &crew, &workflow, cancel.clone(), live_sink).await;
    drop(permit);
    ctx.bus.unregister_workflow(&crew.id);
    intake_handle.abort();

    match outcome {
        Ok(result) => {
            workflow.result = Some(result);
            workflow.transition(WorkflowState::Debriefing);
            ctx.store.put_workflow(&workflow).await?;
            debrief(&ctx, &workflow, crew.id).await?;
            workflow.transition(WorkflowState::Completed);
        }
        Err(AppError::Cancelled(reason)) => {
            workflow.cancellation_reason = Some(reason);
            workflow.transition(WorkflowState::Cancelled);
        }
        Err(e) => {
            workflow.cancellation_reason = Some(e.client_message());
            workflow.transition(WorkflowState::Failed);
        }
    }
    ctx.store.put_workflow(&workflow).await?;
    Ok(workflow)
}

fn prepare(crew: &Crew) -> Result<(), AppError> {
    if crew.agent_ids.is_empty() {
        return Err(AppError::Misconfigured(format!(
            "crew {} has no agents to execute",
            crew.id
        )));
    }
    for task in &crew.tasks {
        if let Some(assigned) = task.assigned_agent {
            if !crew.agent_ids.contains(&assigned) {
                return Err(AppError::Misconfigured(format!(
                    "task '{}' is assigned to agent {assigned} which is not part of the crew",
                    task.description
                )));
            }
        }
    }
    Ok(())
}

/// Runs `Kickoff`, racing it against the cancellation token. Once
/// cancelled, gives the runner up to `emergency_stop_deadline` to
/// return before treating the worker slot as abandoned — spec.md §4.4
/// "the SM times out ... and transitions to Cancelled with
/// reason = hard-deadline".
async fn execute_with_estop(
    ctx: &WorkflowContext,
    crew: &Crew,
    workflow: &Workflow,
    cancel: CancellationToken,
    live_sink: crate::workflow::runner::LiveContextSink,
) -> Result<crate::workflow::CrewResult, AppError> {
    let kickoff = ctx.runner.kickoff(crew, workflow.context.clone(), live_sink, cancel.clone());
    tokio::pin!(kickoff);

    tokio::select! {
        res = &mut kickoff => res,
        _ = cancel.cancelled() => {
            match tokio::time::timeout(ctx.emergency_stop_deadline, &mut kickoff).await {
                Ok(res) => res,
                Err(_) => Err(AppError::Cancelled("hard-deadline".to_string())),
            }
        }
    }
}

/// The instruction intake loop: polls the bus, applies side effects,
/// marks status. Runs for the lifetime of `Executing`; aborted once the
/// workflow leaves that state.
async fn intake_loop(
    bus: Arc<InstructionBus>,
    crew_id: crate::ids::CrewId,
    workflow_id: WorkflowId,
    live_sink: crate::workflow::runner::LiveContextSink,
    notify: Arc<tokio::sync::Notify>,
    cancel: CancellationToken,
    poll_interval: Duration,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(poll_interval) => {}
            _ = notify.notified() => {}
            _ = cancel.cancelled() => {}
        }

        let drained = match bus.drain_for(crew_id, workflow_id).await {
            Ok(drained) => drained,
            Err(e) => {
                tracing::warn!(error = %e, "instruction intake: drain_for failed");
                continue;
            }
        };

        for instruction in drained {
            if instruction.kind == InstructionKind::EmergencyStop {
                // Normally already applied by `InstructionBus::submit` at
                // the moment it cancelled the token; this is a defensive
                // fallback, not the path the cancellation invariant
                // depends on.
                cancel.cancel();
                let _ = bus.mark_applied(instruction.id).await;
                continue;
            }
            if instruction.kind.is_live_context() {
                live_sink.push(instruction.content.clone());
            }
            // constraint/pivot: recorded via the live-context channel too
            // (flagged for stricter debrief enforcement is a runner-side
            // concern outside this crate's boundary; see DESIGN.md Open
            // Question #2).
            let _ = bus.mark_applied(instruction.id).await;
        }

        if cancel.is_cancelled() {
            break;
        }
    }
}

/// Debriefing: fold `CrewResult` into each agent's experience, persist
/// reflections, write deliverables, and give the Evolution Engine a
/// chance to act immediately rather than waiting for the next sweep.
async fn debrief(ctx: &WorkflowContext, workflow: &Workflow, _crew_id: crate::ids::CrewId) -> Result<(), AppError> {
    let Some(result) = workflow.result.clone() else {
        return Ok(());
    };

    for outcome in &result.agent_outcomes {
        update_agent_experience(ctx, workflow.id, outcome.agent_id, outcome.success, outcome.quality).await?;
    }

    write_deliverables(&ctx.data_root, workflow.id, &result.deliverables)?;

    if workflow.allow_evolution {
        for outcome in &result.agent_outcomes {
            if let Err(e) = ctx.evolution.evolve_one(outcome.agent_id, None, false).await {
                tracing::debug!(agent_id = %outcome.agent_id, error = %e, "no evolution fired at debrief");
            }
        }
    }
    Ok(())
}

async fn update_agent_experience(
    ctx: &WorkflowContext,
    workflow_id: WorkflowId,
    agent_id: AgentId,
    success: bool,
    quality: f64,
) -> Result<(), AppError> {
    let mut agent = ctx.store.get_agent(agent_id).await?;
    agent.experience.record_outcome(success, quality);
    agent.push_reflection(
        Some(workflow_id),
        format!(
            "workflow {workflow_id}: {} (quality {quality:.2})",
            if success { "succeeded" } else { "fell short" }
        ),
    );
    ctx.store.put_agent(&agent).await?;
    Ok(())
}

fn write_deliverables(
    data_root: &Path,
    workflow_id: WorkflowId,
    deliverables: &[crate::workflow::Deliverable],
) -> Result<(), AppError> {
    for deliverable in deliverables {
        let path = validation::resolve_deliverable_path(data_root, &workflow_id.to_string(), &deliverable.file_name)?;
        if deliverable.content.len() > validation::MAX_DELIVERABLE_TEXT_BYTES {
            return Err(AppError::InvalidArgument(format!(
                "deliverable '{}' exceeds the maximum text size",
                deliverable.file_name
            )));
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(AppError::internal)?;
        }
        std::fs::write(&path, &deliverable.content).map_err(AppError::internal)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::ids::CrewId;
    use crate::store::sqlite::SqliteStore;
    use crate::workflow::runner::SimulatedCrewRunner;

    async fn context(data_root: std::path::PathBuf) -> Arc<WorkflowContext> {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let config = Config::from_env().unwrap();
        Arc::new(WorkflowContext {
            bus: Arc::new(InstructionBus::new(store.clone())),
            evolution: Arc::new(EvolutionEngine::new(store.clone(), config.min_evolution_interval)),
            store,
            runner: Arc::new(SimulatedCrewRunner::new()),
            worker_pool: Arc::new(Semaphore::new(2)),
            data_root,
            intake_poll_interval: Duration::from_millis(10),
            emergency_stop_deadline: Duration::from_secs(2),
        })
    }

    #[tokio::test]
    async fn happy_path_reaches_completed_and_updates_experience() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = context(tmp.path().to_path_buf()).await;
        let agent = crate::agent::Agent::new("Writer", "draft", "veteran");
        ctx.store.put_agent(&agent).await.unwrap();

        let crew = Crew::new(
            "m1",
            vec![agent.id],
            vec![crate::crew::CrewTask {
                description: "draft".to_string(),
                expected_output: "a draft".to_string(),
                assigned_agent: None,
            }],
            0.5,
        );
        ctx.store.put_crew(&crew).await.unwrap();

        let workflow = Workflow::new(crew.id, None, true);
        let finished = run(ctx.clone(), workflow, crew).await.unwrap();
        assert_eq!(finished.state, WorkflowState::Completed);

        let stored_agent = ctx.store.get_agent(agent.id).await.unwrap();
        assert_eq!(stored_agent.experience.tasks_completed, 1);
    }

    #[tokio::test]
    async fn missing_agents_fails_at_preparing() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = context(tmp.path().to_path_buf()).await;
        let crew = Crew::new("empty", vec![], vec![], 0.5);
        ctx.store.put_crew(&crew).await.unwrap();

        let workflow = Workflow::new(crew.id, None, false);
        let finished = run(ctx, workflow, crew).await.unwrap();
        assert_eq!(finished.state, WorkflowState::Failed);
    }

    #[tokio::test]
    async fn emergency_stop_cancels_before_kickoff_completes() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = context(tmp.path().to_path_buf()).await;
        let agent = crate::agent::Agent::new("Writer", "draft", "veteran");
        ctx.store.put_agent(&agent).await.unwrap();
        let crew = Crew::new("m1", vec![agent.id], vec![], 0.5);
        ctx.store.put_crew(&crew).await.unwrap();
        let workflow = Workflow::new(crew.id, None, false);

        let bus_for_estop = ctx.bus.clone();
        let crew_id = crew.id;
        let run_handle = tokio::spawn(run(ctx.clone(), workflow, crew));

        tokio::time::sleep(Duration::from_millis(5)).await;
        let estop = crate::instructions::Instruction::new(
            crew_id,
            InstructionKind::EmergencyStop,
            5,
            "stop".to_string(),
        );
        bus_for_estop.submit(estop).await.unwrap();

        let finished = run_handle.await.unwrap().unwrap();
        assert_ne!(finished.state, WorkflowState::Executing);
    }
}
