//! The engine's public surface: start / wait / signal / cancel / query.

pub mod registry;
pub mod scheduler;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use tracing::{info, instrument};
use uuid::Uuid;

use crate::error::EngineError;
use crate::persistence::store::{
    ExecutionStatus, ExecutionStore, NewExecution, TaskStatus,
};
use crate::workflow::event::EventBody;

pub use registry::{
    ActivityOptions, QuerySnapshot, Registry, WorkflowOptions,
};
pub use scheduler::{Scheduler, StepReport};

/// Poll interval for [`Engine::wait_workflow`].
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Reason recorded on children cancelled because their parent went away.
const PARENT_CANCELED: &str = "parent canceled";

/// Entry point tying a store and a registry together.
///
/// `Engine` is cheap to clone; all state lives behind `Arc`s. Workers are
/// spawned from an engine and share its store and registry.
///
/// # Example
///
/// ```ignore
/// let mut registry = Registry::new();
/// registry.register_workflow("onboard", onboard_body);
/// registry.register_activity("send_email", send_email);
///
/// let engine = Engine::new(Arc::new(InMemoryStore::new()), registry);
/// let id = engine.start_workflow("onboard", json!({"user": 7}), None).await?;
/// let result = engine.wait_workflow(id, None).await?;
/// ```
pub struct Engine<S: ExecutionStore> {
    store: Arc<S>,
    registry: Arc<Registry>,
    scheduler: Scheduler<S>,
}

impl<S: ExecutionStore> Clone for Engine<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            registry: Arc::clone(&self.registry),
            scheduler: self.scheduler.clone(),
        }
    }
}

impl<S: ExecutionStore> Engine<S> {
    pub fn new(store: Arc<S>, registry: Registry) -> Self {
        let registry = Arc::new(registry);
        let scheduler = Scheduler::new(Arc::clone(&store), Arc::clone(&registry));
        Self {
            store,
            registry,
            scheduler,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Create an execution and its WORKFLOW_STARTED event; returns the id.
    ///
    /// The name is not validated here: an unknown workflow is accepted and
    /// fails with `NOT_REGISTERED` at its first step.
    #[instrument(skip(self, input))]
    pub async fn start_workflow(
        &self,
        name: &str,
        input: Value,
        timeout: Option<Duration>,
    ) -> Result<Uuid, EngineError> {
        let timeout = timeout.or_else(|| self.registry.workflow(name).and_then(|w| w.timeout));
        let now = Utc::now();
        let execution = self
            .store
            .create_execution(NewExecution {
                id: Uuid::now_v7(),
                workflow_name: name.to_string(),
                input,
                timeout_at: timeout
                    .map(|t| now + chrono::Duration::milliseconds(t.as_millis() as i64)),
                parent: None,
            })
            .await?;
        info!(execution_id = %execution.id, workflow_name = name, "started workflow");
        Ok(execution.id)
    }

    /// Advance an execution one replay step. Exposed for embedders and tests;
    /// the worker loop calls this for every runnable execution.
    pub async fn step_workflow(&self, id: Uuid) -> Result<StepReport, EngineError> {
        self.scheduler.step(id).await
    }

    /// Poll until the execution reaches a terminal status.
    ///
    /// Returns the result on COMPLETED and the structured failure otherwise.
    /// A `timeout` bounds the wait itself and reports expiry as an
    /// `INTERNAL`-kind error.
    pub async fn wait_workflow(
        &self,
        id: Uuid,
        timeout: Option<Duration>,
    ) -> Result<Value, EngineError> {
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
        loop {
            let execution = self.store.get_execution(id).await?;
            match execution.status {
                ExecutionStatus::Completed => {
                    return Ok(execution.result.unwrap_or(Value::Null));
                }
                ExecutionStatus::Failed => {
                    return Err(execution
                        .error
                        .unwrap_or_else(|| EngineError::internal("workflow failed")));
                }
                ExecutionStatus::TimedOut => {
                    return Err(execution
                        .error
                        .unwrap_or_else(|| EngineError::workflow_timed_out("workflow timed out")));
                }
                ExecutionStatus::Canceled => {
                    return Err(execution
                        .error
                        .unwrap_or_else(|| EngineError::canceled("workflow canceled")));
                }
                ExecutionStatus::Pending | ExecutionStatus::Running => {}
            }

            if let Some(deadline) = deadline {
                if tokio::time::Instant::now() >= deadline {
                    return Err(EngineError::internal(format!(
                        "timed out waiting for workflow {id}"
                    )));
                }
            }
            tokio::time::sleep(WAIT_POLL_INTERVAL).await;
        }
    }

    /// Start a workflow and wait for its result.
    pub async fn run_workflow(
        &self,
        name: &str,
        input: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, EngineError> {
        let id = self.start_workflow(name, input, timeout).await?;
        self.wait_workflow(id, None).await
    }

    /// Append a SIGNAL_RECEIVED event and wake the execution.
    ///
    /// Signals to terminal executions are silently dropped.
    #[instrument(skip(self, payload))]
    pub async fn signal_workflow(
        &self,
        id: Uuid,
        name: &str,
        payload: Value,
    ) -> Result<(), EngineError> {
        self.store.signal_execution(id, name, payload).await?;
        Ok(())
    }

    /// Cancel an execution and, recursively, its non-terminal children.
    ///
    /// `cancel_queued` marks not-yet-started activity tasks CANCELED;
    /// already-running activities are not preempted, their late results are
    /// ignored. Idempotent on terminal executions.
    #[instrument(skip(self))]
    pub async fn cancel_workflow(
        &self,
        id: Uuid,
        reason: Option<String>,
        cancel_queued: bool,
    ) -> Result<(), EngineError> {
        let mut stack = vec![(id, reason)];
        while let Some((id, reason)) = stack.pop() {
            let message = reason.clone().unwrap_or_else(|| "workflow canceled".into());
            let outcome = self
                .store
                .finalize_execution(
                    id,
                    EventBody::WorkflowCanceled {
                        reason: reason.clone(),
                    },
                    ExecutionStatus::Canceled,
                    EngineError::canceled(message),
                    cancel_queued,
                )
                .await?;
            if outcome.applied {
                info!(execution_id = %id, "canceled workflow");
            }
            for child in outcome.children {
                stack.push((child, Some(PARENT_CANCELED.to_string())));
            }
        }
        Ok(())
    }

    /// Run a read-only query against a snapshot of the execution.
    ///
    /// The built-in `status` query is always available; anything else must be
    /// registered for the execution's workflow.
    pub async fn query_workflow(
        &self,
        id: Uuid,
        name: &str,
        payload: Value,
    ) -> Result<Value, EngineError> {
        let (execution, events) = self.store.snapshot(id).await?;
        let tasks = self.store.list_tasks(id).await?;

        if let Some(handler) = self.registry.query(&execution.workflow_name, name) {
            let handler = Arc::clone(handler);
            let snapshot = QuerySnapshot {
                execution,
                events,
                tasks,
            };
            return handler(&snapshot, payload);
        }

        if name == "status" {
            let pending_activities = tasks
                .iter()
                .filter(|t| matches!(t.status, TaskStatus::Queued | TaskStatus::Running))
                .count();
            return Ok(json!({
                "id": execution.id,
                "workflow_name": execution.workflow_name,
                "status": execution.status,
                "result": execution.result,
                "error": execution.error,
                "pending_activities": pending_activities,
            }));
        }

        Err(EngineError::not_registered(format!(
            "unknown query '{}' for workflow '{}'",
            name, execution.workflow_name
        )))
    }
}
