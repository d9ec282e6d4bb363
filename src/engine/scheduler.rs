//! One replay step: snapshot, run the body, commit the buffered outcome.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::engine::registry::Registry;
use crate::error::EngineError;
use crate::persistence::store::{
    ExecutionStore, StepApplied, StepCommit, StepOutcome, StoreError,
};
use crate::workflow::context::{Interrupt, PendingWrites, WorkflowContext};
use crate::workflow::event::EventBody;

/// How a step left the execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepReport {
    /// Body returned; WORKFLOW_COMPLETED committed.
    Completed,

    /// Body raised a failure; WORKFLOW_FAILED committed.
    Failed,

    /// Body paused; schedule events and tasks committed, execution parked.
    Yielded,

    /// Nothing to do; the execution was already terminal.
    AlreadyTerminal,

    /// An external append (signal, resolution) raced the step; the buffered
    /// writes were dropped and the execution stays runnable.
    Superseded,
}

/// Advances executions one replay step at a time.
///
/// The store transaction is never held across the workflow body: the step
/// reads a snapshot, buffers every write in memory, and commits the batch at
/// yield. Lock duration is bounded by the commit, not the body's runtime.
pub struct Scheduler<S: ExecutionStore> {
    store: Arc<S>,
    registry: Arc<Registry>,
}

impl<S: ExecutionStore> Clone for Scheduler<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            registry: Arc::clone(&self.registry),
        }
    }
}

impl<S: ExecutionStore> Scheduler<S> {
    pub fn new(store: Arc<S>, registry: Arc<Registry>) -> Self {
        Self { store, registry }
    }

    /// Run the workflow body against its history and commit the outcome.
    #[instrument(skip(self), fields(execution_id = %execution_id))]
    pub async fn step(&self, execution_id: Uuid) -> Result<StepReport, EngineError> {
        let (execution, history) = self.store.snapshot(execution_id).await?;
        if execution.status.is_terminal() {
            debug!(status = %execution.status, "execution already terminal");
            return Ok(StepReport::AlreadyTerminal);
        }
        let expected_pos = history.len() as i64;

        let func = match self.registry.workflow(&execution.workflow_name) {
            Some(entry) => Arc::clone(&entry.func),
            None => {
                let error = EngineError::not_registered(format!(
                    "unknown workflow '{}'",
                    execution.workflow_name
                ));
                warn!(workflow_name = %execution.workflow_name, "failing unregistered workflow");
                return self
                    .commit(
                        execution_id,
                        expected_pos,
                        PendingWrites::default(),
                        Err(Interrupt::Failed(error)),
                    )
                    .await;
            }
        };

        let mut ctx = WorkflowContext::new(
            execution.clone(),
            history,
            Arc::clone(&self.registry),
            Utc::now(),
        );
        let body_result = (func)(&mut ctx, execution.input.clone());
        let pending = ctx.into_pending();

        self.commit(execution_id, expected_pos, pending, body_result)
            .await
    }

    async fn commit(
        &self,
        execution_id: Uuid,
        expected_pos: i64,
        pending: PendingWrites,
        body_result: Result<serde_json::Value, Interrupt>,
    ) -> Result<StepReport, EngineError> {
        let PendingWrites {
            mut events,
            tasks,
            children,
        } = pending;

        let (outcome, report) = match body_result {
            Ok(result) => {
                events.push(EventBody::WorkflowCompleted {
                    result: result.clone(),
                });
                (StepOutcome::Complete { result }, StepReport::Completed)
            }
            Err(Interrupt::Pause) => {
                // The earliest thing the new work could make runnable; None
                // when parked purely on external input (signal, resolution).
                let next_wakeup_at = tasks.iter().map(|t| t.after_time).min();
                (StepOutcome::Yield { next_wakeup_at }, StepReport::Yielded)
            }
            Err(Interrupt::Failed(error)) => {
                events.push(EventBody::WorkflowFailed {
                    error: error.clone(),
                });
                (StepOutcome::Fail { error }, StepReport::Failed)
            }
        };

        let commit = StepCommit {
            execution_id,
            expected_pos,
            events,
            tasks,
            children,
            outcome,
        };

        match self.store.step_commit(commit).await {
            Ok(StepApplied::Applied) => {
                debug!(?report, "step committed");
                Ok(report)
            }
            Ok(StepApplied::Superseded) => {
                debug!("step superseded by concurrent append");
                Ok(StepReport::Superseded)
            }
            Err(StoreError::ConcurrencyConflict { expected, actual }) => {
                debug!(expected, actual, "step superseded by concurrent append");
                Ok(StepReport::Superseded)
            }
            Err(err) => Err(err.into()),
        }
    }
}
