//! The per-crew priority queue described in spec.md §4.3.
//!
//! Persistence of instruction rows lives in the [`crate::store::Store`];
//! this type adds the in-memory "watch" signal (a `tokio::sync::Notify`
//! per crew, avoiding the intake loop having to poll the Store on every
//! tick) and the priority-5 bypass routing to a registered workflow's
//! cancellation token.

use std::sync::Arc;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use crate::error::AppError;
use crate::ids::{CrewId, InstructionId, WorkflowId};
use crate::instructions::{Instruction, InstructionStatus};
use crate::store::Store;

/// Registration a running Workflow makes with the bus so that
/// `submit()` can wake its intake loop (and, for priority 5,
/// unconditionally cancel it) without the bus polling anything.
#[derive(Clone)]
pub struct WorkflowHandle {
    pub workflow_id: WorkflowId,
    pub notify: Arc<tokio::sync::Notify>,
    pub cancel: CancellationToken,
}

pub struct InstructionBus {
    store: Arc<dyn Store>,
    running: DashMap<CrewId, WorkflowHandle>,
}

impl InstructionBus {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            running: DashMap::new(),
        }
    }

    /// Called by the Workflow SM when it enters `Executing`.
    pub fn register_workflow(&self, crew_id: CrewId, handle: WorkflowHandle) {
        self.running.insert(crew_id, handle);
    }

    /// Called by the Workflow SM on reaching a terminal state.
    pub fn unregister_workflow(&self, crew_id: &CrewId) {
        self.running.remove(crew_id);
    }

    /// spec.md §4.3 `submit(Instruction)`.
    ///
    /// A priority-5 instruction is marked `applied` right here, on the
    /// same call that cancels the workflow's token, rather than left
    /// for the intake loop to pick up later: that loop is aborted by
    /// `run()` as soon as the cancellation is observed, racing its own
    /// `mark_applied` against the abort. Deciding it here is
    /// unconditional — the spec.md §3 invariant that priority-5 is
    /// "either applied or causes an emergency stop, never silently
    /// expires" must hold regardless of how the intake loop's timing
    /// plays out.
    pub async fn submit(&self, instruction: Instruction) -> Result<InstructionId, AppError> {
        let id = instruction.id;
        let crew_id = instruction.crew_id;
        let is_emergency = instruction.is_emergency_stop();
        self.store.enqueue_instruction(instruction).await?;

        if let Some(handle) = self.running.get(&crew_id) {
            handle.notify.notify_one();
            if is_emergency {
                handle.cancel.cancel();
                self.store.update_instruction_status(id, InstructionStatus::Applied, None).await?;
            }
        }
        Ok(id)
    }

    /// spec.md §4.3 `drain_for(workflow)` — pending instructions for the
    /// workflow's crew, priority-desc then submit-time-asc, marked
    /// `delivered`.
    pub async fn drain_for(&self, crew_id: CrewId, workflow_id: WorkflowId) -> Result<Vec<Instruction>, AppError> {
        let mut pending = self
            .store
            .list_instructions(crew_id, Some(crate::instructions::InstructionStatus::Pending))
            .await?;
        pending.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.created_at.cmp(&b.created_at)));

        for instr in pending.iter_mut() {
            instr.workflow_id = Some(workflow_id);
            instr.status = InstructionStatus::Delivered;
            self.store
                .update_instruction_status(instr.id, InstructionStatus::Delivered, None)
                .await?;
        }
        Ok(pending)
    }

    pub async fn mark_applied(&self, id: InstructionId) -> Result<(), AppError> {
        self.store
            .update_instruction_status(id, InstructionStatus::Applied, None)
            .await
    }

    pub async fn mark_failed(&self, id: InstructionId, error: String) -> Result<(), AppError> {
        self.store
            .update_instruction_status(id, InstructionStatus::Failed, Some(error))
            .await
    }

    /// Supervisor sweeper path: move stale `pending` instructions to
    /// `expired`. Priority-5 instructions never expire (spec.md §3
    /// invariant).
    pub async fn expire(&self, max_age: chrono::Duration) -> Result<u64, AppError> {
        self.store.expire_stale_instructions(max_age).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instructions::{Instruction, InstructionKind};
    use crate::store::sqlite::SqliteStore;

    fn test_store() -> Arc<dyn Store> {
        Arc::new(SqliteStore::open_in_memory().unwrap())
    }

    #[tokio::test]
    async fn submit_then_drain_orders_by_priority_desc_then_time_asc() {
        let store = test_store();
        let bus = InstructionBus::new(store.clone());
        let crew_id = CrewId::new();

        let low = Instruction::new(crew_id, InstructionKind::Guidance, 2, "a".into());
        let mid = Instruction::new(crew_id, InstructionKind::Guidance, 3, "b".into());

        bus.submit(low).await.unwrap();
        // second call so created_at for "mid" is >= "low"'s
        bus.submit(mid).await.unwrap();

        let workflow_id = WorkflowId::new();
        let drained = bus.drain_for(crew_id, workflow_id).await.unwrap();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].priority, 3);
        assert_eq!(drained[1].priority, 2);
        for instr in &drained {
            assert_eq!(instr.status, InstructionStatus::Delivered);
        }
    }

    #[tokio::test]
    async fn emergency_stop_cancels_registered_workflow_immediately() {
        let store = test_store();
        let bus = InstructionBus::new(store.clone());
        let crew_id = CrewId::new();
        let workflow_id = WorkflowId::new();

        let notify = Arc::new(tokio::sync::Notify::new());
        let cancel = CancellationToken::new();
        bus.register_workflow(
            crew_id,
            WorkflowHandle {
                workflow_id,
                notify: notify.clone(),
                cancel: cancel.clone(),
            },
        );

        let estop = Instruction::new(crew_id, InstructionKind::EmergencyStop, 5, "stop".into());
        let id = estop.id;
        bus.submit(estop).await.unwrap();

        assert!(cancel.is_cancelled());
        // Applied synchronously by `submit`, not left for the intake
        // loop's own `mark_applied` — that task may be aborted before it
        // ever observes this instruction.
        let stored = store.get_instruction(id).await.unwrap();
        assert_eq!(stored.status, InstructionStatus::Applied);
    }
}
