//! In-memory implementation of ExecutionStore for tests and embedding.
//!
//! All tables live behind one lock so every multi-row transition documented
//! on the trait is atomic, the same way the PostgreSQL implementation wraps
//! them in transactions.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::Value;
use uuid::Uuid;

use super::store::*;
use crate::error::EngineError;
use crate::workflow::event::{EventBody, HistoryEvent};

struct ExecutionState {
    execution: Execution,
    events: Vec<HistoryEvent>,
}

#[derive(Default)]
struct Inner {
    executions: HashMap<Uuid, ExecutionState>,
    tasks: BTreeMap<i64, ActivityTask>,
    next_event_id: i64,
    next_handle: i64,
}

impl Inner {
    fn append(&mut self, execution_id: Uuid, body: EventBody) -> Result<i64, StoreError> {
        let state = self
            .executions
            .get_mut(&execution_id)
            .ok_or(StoreError::ExecutionNotFound(execution_id))?;
        let pos = state.events.len() as i64;
        self.next_event_id += 1;
        state.events.push(HistoryEvent {
            id: self.next_event_id,
            execution_id,
            pos,
            body,
            created_at: Utc::now(),
        });
        Ok(pos)
    }

    fn insert_execution(&mut self, new: NewExecution, now: DateTime<Utc>) -> Execution {
        let execution = Execution {
            id: new.id,
            workflow_name: new.workflow_name,
            input: new.input.clone(),
            status: ExecutionStatus::Pending,
            result: None,
            error: None,
            created_at: now,
            started_at: None,
            finished_at: None,
            timeout_at: new.timeout_at,
            parent_id: new.parent.map(|p| p.execution_id),
            parent_handle: new.parent.map(|p| p.handle),
            next_wakeup_at: Some(now),
        };
        self.executions.insert(
            new.id,
            ExecutionState {
                execution: execution.clone(),
                events: vec![],
            },
        );
        // The insert above guarantees the append target exists.
        let _ = self.append(new.id, EventBody::WorkflowStarted { input: new.input });
        execution
    }

    fn insert_tasks(&mut self, execution_id: Uuid, tasks: Vec<NewTask>, now: DateTime<Utc>) {
        for task in tasks {
            self.next_handle += 1;
            self.tasks.insert(
                self.next_handle,
                ActivityTask {
                    handle: self.next_handle,
                    execution_id,
                    name: task.name,
                    args: task.args,
                    kwargs: task.kwargs,
                    status: TaskStatus::Queued,
                    attempt: 1,
                    after_time: task.after_time,
                    expires_at: task.expires_at,
                    heartbeat_timeout: task.heartbeat_timeout,
                    last_heartbeat_at: None,
                    heartbeat_details: None,
                    retry_policy: task.retry_policy,
                    scheduled_event_pos: task.scheduled_event_pos,
                    result: None,
                    error: None,
                    locked_by: None,
                    locked_until: None,
                    created_at: now,
                    finished_at: None,
                },
            );
        }
    }

    /// Append a child resolution event to the parent and wake it. Skipped
    /// entirely when the parent is already terminal.
    fn notify_parent(&mut self, child: &Execution, body: EventBody, now: DateTime<Utc>) {
        let (Some(parent_id), Some(_)) = (child.parent_id, child.parent_handle) else {
            return;
        };
        let Some(parent) = self.executions.get(&parent_id) else {
            return;
        };
        if parent.execution.status.is_terminal() {
            return;
        }
        let _ = self.append(parent_id, body);
        if let Some(parent) = self.executions.get_mut(&parent_id) {
            parent.execution.next_wakeup_at = Some(now);
        }
    }

    fn cancel_queued_tasks(&mut self, execution_id: Uuid, now: DateTime<Utc>) {
        for task in self.tasks.values_mut() {
            if task.execution_id == execution_id && task.status == TaskStatus::Queued {
                task.status = TaskStatus::Canceled;
                task.finished_at = Some(now);
                task.locked_by = None;
                task.locked_until = None;
            }
        }
    }

    fn nonterminal_children(&self, execution_id: Uuid) -> Vec<Uuid> {
        self.executions
            .values()
            .filter(|s| {
                s.execution.parent_id == Some(execution_id)
                    && !s.execution.status.is_terminal()
            })
            .map(|s| s.execution.id)
            .collect()
    }
}

/// In-memory ExecutionStore.
///
/// Primarily for tests; provides the same semantics as the PostgreSQL
/// implementation.
///
/// # Example
///
/// ```
/// use durable::InMemoryStore;
///
/// let store = InMemoryStore::new();
/// ```
#[derive(Default)]
pub struct InMemoryStore {
    inner: RwLock<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of executions (for tests).
    pub fn execution_count(&self) -> usize {
        self.inner.read().executions.len()
    }

    /// Number of queued tasks (for tests).
    pub fn queued_task_count(&self) -> usize {
        self.inner
            .read()
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Queued)
            .count()
    }
}

#[async_trait]
impl ExecutionStore for InMemoryStore {
    async fn create_execution(&self, new: NewExecution) -> Result<Execution, StoreError> {
        let mut inner = self.inner.write();
        Ok(inner.insert_execution(new, Utc::now()))
    }

    async fn get_execution(&self, id: Uuid) -> Result<Execution, StoreError> {
        let inner = self.inner.read();
        inner
            .executions
            .get(&id)
            .map(|s| s.execution.clone())
            .ok_or(StoreError::ExecutionNotFound(id))
    }

    async fn snapshot(&self, id: Uuid) -> Result<(Execution, Vec<HistoryEvent>), StoreError> {
        let inner = self.inner.read();
        let state = inner
            .executions
            .get(&id)
            .ok_or(StoreError::ExecutionNotFound(id))?;
        Ok((state.execution.clone(), state.events.clone()))
    }

    async fn append_events(
        &self,
        id: Uuid,
        expected_pos: i64,
        events: Vec<EventBody>,
    ) -> Result<i64, StoreError> {
        let mut inner = self.inner.write();
        let state = inner
            .executions
            .get(&id)
            .ok_or(StoreError::ExecutionNotFound(id))?;
        let actual = state.events.len() as i64;
        if actual != expected_pos {
            return Err(StoreError::ConcurrencyConflict {
                expected: expected_pos,
                actual,
            });
        }
        let mut next = actual;
        for body in events {
            next = inner.append(id, body)? + 1;
        }
        Ok(next)
    }

    async fn signal_execution(
        &self,
        id: Uuid,
        name: &str,
        payload: Value,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let state = inner
            .executions
            .get(&id)
            .ok_or(StoreError::ExecutionNotFound(id))?;
        if state.execution.status.is_terminal() {
            // Documented behavior: signals to terminal executions are dropped.
            return Ok(());
        }
        inner.append(
            id,
            EventBody::SignalReceived {
                name: name.to_string(),
                payload,
            },
        )?;
        if let Some(state) = inner.executions.get_mut(&id) {
            state.execution.next_wakeup_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn finalize_execution(
        &self,
        id: Uuid,
        body: EventBody,
        status: ExecutionStatus,
        error: EngineError,
        cancel_queued: bool,
    ) -> Result<FinalizeOutcome, StoreError> {
        let now = Utc::now();
        let mut inner = self.inner.write();
        let state = inner
            .executions
            .get(&id)
            .ok_or(StoreError::ExecutionNotFound(id))?;
        if state.execution.status.is_terminal() {
            return Ok(FinalizeOutcome {
                applied: false,
                children: vec![],
            });
        }

        inner.append(id, body)?;
        let child = {
            let state = inner
                .executions
                .get_mut(&id)
                .ok_or(StoreError::ExecutionNotFound(id))?;
            state.execution.status = status;
            state.execution.error = Some(error.clone());
            state.execution.finished_at = Some(now);
            state.execution.next_wakeup_at = None;
            state.execution.clone()
        };

        if cancel_queued {
            inner.cancel_queued_tasks(id, now);
        }

        if let Some(handle) = child.parent_handle {
            inner.notify_parent(
                &child,
                EventBody::ChildFailed {
                    scheduled_pos: handle,
                    child_id: id,
                    error,
                },
                now,
            );
        }

        Ok(FinalizeOutcome {
            applied: true,
            children: inner.nonterminal_children(id),
        })
    }

    async fn step_commit(&self, commit: StepCommit) -> Result<StepApplied, StoreError> {
        let now = Utc::now();
        let mut inner = self.inner.write();
        let state = inner
            .executions
            .get(&commit.execution_id)
            .ok_or(StoreError::ExecutionNotFound(commit.execution_id))?;
        if state.execution.status.is_terminal() {
            return Ok(StepApplied::Superseded);
        }
        if state.events.len() as i64 != commit.expected_pos {
            return Ok(StepApplied::Superseded);
        }

        for body in commit.events {
            inner.append(commit.execution_id, body)?;
        }
        inner.insert_tasks(commit.execution_id, commit.tasks, now);
        for child in commit.children {
            inner.insert_execution(child, now);
        }

        let updated = {
            let state = inner
                .executions
                .get_mut(&commit.execution_id)
                .ok_or(StoreError::ExecutionNotFound(commit.execution_id))?;
            let execution = &mut state.execution;
            if execution.started_at.is_none() {
                execution.started_at = Some(now);
            }
            match commit.outcome {
                StepOutcome::Yield { next_wakeup_at } => {
                    execution.status = ExecutionStatus::Pending;
                    execution.next_wakeup_at = next_wakeup_at;
                }
                StepOutcome::Complete { result } => {
                    execution.status = ExecutionStatus::Completed;
                    execution.result = Some(result);
                    execution.finished_at = Some(now);
                    execution.next_wakeup_at = None;
                }
                StepOutcome::Fail { error } => {
                    execution.status = ExecutionStatus::Failed;
                    execution.error = Some(error);
                    execution.finished_at = Some(now);
                    execution.next_wakeup_at = None;
                }
            }
            execution.clone()
        };

        if updated.status.is_terminal() {
            if let Some(handle) = updated.parent_handle {
                let body = match updated.status {
                    ExecutionStatus::Completed => EventBody::ChildCompleted {
                        scheduled_pos: handle,
                        child_id: updated.id,
                        result: updated.result.clone().unwrap_or(Value::Null),
                    },
                    _ => EventBody::ChildFailed {
                        scheduled_pos: handle,
                        child_id: updated.id,
                        error: updated
                            .error
                            .clone()
                            .unwrap_or_else(|| EngineError::internal("workflow failed")),
                    },
                };
                inner.notify_parent(&updated, body, now);
            }
        }

        Ok(StepApplied::Applied)
    }

    async fn fetch_runnable(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        retry_at: DateTime<Utc>,
    ) -> Result<Vec<Execution>, StoreError> {
        let mut inner = self.inner.write();
        let mut due: Vec<Uuid> = inner
            .executions
            .values()
            .filter(|s| {
                !s.execution.status.is_terminal()
                    && s.execution
                        .next_wakeup_at
                        .is_some_and(|wakeup| wakeup <= now)
            })
            .map(|s| s.execution.id)
            .collect();
        due.sort();
        due.truncate(limit);

        let mut claimed = Vec::with_capacity(due.len());
        for id in due {
            if let Some(state) = inner.executions.get_mut(&id) {
                state.execution.status = ExecutionStatus::Running;
                state.execution.next_wakeup_at = Some(retry_at);
                claimed.push(state.execution.clone());
            }
        }
        Ok(claimed)
    }

    async fn enqueue_tasks(
        &self,
        execution_id: Uuid,
        tasks: Vec<NewTask>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        if !inner.executions.contains_key(&execution_id) {
            return Err(StoreError::ExecutionNotFound(execution_id));
        }
        inner.insert_tasks(execution_id, tasks, Utc::now());
        Ok(())
    }

    async fn lease_due_tasks(
        &self,
        now: DateTime<Utc>,
        worker_id: &str,
        locked_until: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ActivityTask>, StoreError> {
        let mut inner = self.inner.write();
        let runnable_executions: Vec<Uuid> = inner
            .executions
            .values()
            .filter(|s| !s.execution.status.is_terminal())
            .map(|s| s.execution.id)
            .collect();

        let mut due: Vec<i64> = inner
            .tasks
            .values()
            .filter(|t| {
                t.status == TaskStatus::Queued
                    && t.after_time <= now
                    && runnable_executions.contains(&t.execution_id)
            })
            .map(|t| t.handle)
            .collect();
        due.sort();
        due.truncate(limit);

        let mut claimed = Vec::with_capacity(due.len());
        for handle in due {
            if let Some(task) = inner.tasks.get_mut(&handle) {
                task.status = TaskStatus::Running;
                task.locked_by = Some(worker_id.to_string());
                task.locked_until = Some(locked_until);
                task.last_heartbeat_at = Some(now);
                claimed.push(task.clone());
            }
        }
        Ok(claimed)
    }

    async fn complete_task(
        &self,
        handle: i64,
        worker_id: Option<&str>,
        resolution: TaskResolution,
    ) -> Result<StepApplied, StoreError> {
        let now = Utc::now();
        let mut inner = self.inner.write();
        let task = inner
            .tasks
            .get(&handle)
            .ok_or(StoreError::TaskNotFound(handle))?;

        if task.status.is_terminal() {
            return Ok(StepApplied::Superseded);
        }
        if let Some(worker) = worker_id {
            if task.locked_by.as_deref() != Some(worker) || task.status != TaskStatus::Running {
                return Ok(StepApplied::Superseded);
            }
        }

        let execution_id = task.execution_id;
        let scheduled_pos = task.scheduled_event_pos;

        let (status, result, error, body) = match resolution {
            TaskResolution::Completed { result } => (
                TaskStatus::Completed,
                Some(result.clone()),
                None,
                EventBody::ActivityCompleted {
                    scheduled_pos,
                    result,
                },
            ),
            TaskResolution::TimerFired => (
                TaskStatus::Completed,
                None,
                None,
                EventBody::TimerFired { scheduled_pos },
            ),
            TaskResolution::Failed { error } => (
                TaskStatus::Failed,
                None,
                Some(error.clone()),
                EventBody::ActivityFailed {
                    scheduled_pos,
                    error,
                },
            ),
            TaskResolution::TimedOut { error } => (
                TaskStatus::TimedOut,
                None,
                Some(error.clone()),
                EventBody::ActivityTimedOut {
                    scheduled_pos,
                    error,
                },
            ),
        };

        if let Some(task) = inner.tasks.get_mut(&handle) {
            task.status = status;
            task.result = result;
            task.error = error;
            task.finished_at = Some(now);
            task.locked_by = None;
            task.locked_until = None;
        }

        let execution_terminal = inner
            .executions
            .get(&execution_id)
            .map(|s| s.execution.status.is_terminal())
            .unwrap_or(true);
        if !execution_terminal {
            inner.append(execution_id, body)?;
            if let Some(state) = inner.executions.get_mut(&execution_id) {
                state.execution.next_wakeup_at = Some(now);
            }
        }

        Ok(StepApplied::Applied)
    }

    async fn retry_task(
        &self,
        handle: i64,
        worker_id: Option<&str>,
        after_time: DateTime<Utc>,
        error: Option<EngineError>,
    ) -> Result<StepApplied, StoreError> {
        let mut inner = self.inner.write();
        let task = inner
            .tasks
            .get_mut(&handle)
            .ok_or(StoreError::TaskNotFound(handle))?;

        if task.status.is_terminal() {
            return Ok(StepApplied::Superseded);
        }
        if let Some(worker) = worker_id {
            if task.locked_by.as_deref() != Some(worker) || task.status != TaskStatus::Running {
                return Ok(StepApplied::Superseded);
            }
        }

        task.status = TaskStatus::Queued;
        task.attempt += 1;
        task.after_time = after_time;
        task.locked_by = None;
        task.locked_until = None;
        task.last_heartbeat_at = None;
        if error.is_some() {
            task.error = error;
        }
        Ok(StepApplied::Applied)
    }

    async fn record_heartbeat(
        &self,
        handle: i64,
        worker_id: &str,
        details: Option<Value>,
        extend_until: DateTime<Utc>,
    ) -> Result<HeartbeatAck, StoreError> {
        let mut inner = self.inner.write();
        let task = inner
            .tasks
            .get_mut(&handle)
            .ok_or(StoreError::TaskNotFound(handle))?;

        if task.status != TaskStatus::Running || task.locked_by.as_deref() != Some(worker_id) {
            return Ok(HeartbeatAck {
                accepted: false,
                cancel_requested: true,
            });
        }

        task.last_heartbeat_at = Some(Utc::now());
        task.locked_until = Some(extend_until);
        if details.is_some() {
            task.heartbeat_details = details;
        }
        let execution_id = task.execution_id;

        let cancel_requested = inner
            .executions
            .get(&execution_id)
            .map(|s| s.execution.status.is_terminal())
            .unwrap_or(true);
        Ok(HeartbeatAck {
            accepted: true,
            cancel_requested,
        })
    }

    async fn expired_tasks(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<(ActivityTask, TimeoutCause)>, StoreError> {
        let inner = self.inner.read();
        let mut expired = Vec::new();
        for task in inner.tasks.values() {
            if expired.len() >= limit {
                break;
            }
            match task.status {
                TaskStatus::Queued | TaskStatus::Running
                    if task.expires_at.is_some_and(|at| at <= now) =>
                {
                    expired.push((task.clone(), TimeoutCause::ScheduleToClose));
                }
                TaskStatus::Running => {
                    if let (Some(timeout), Some(beat)) =
                        (task.heartbeat_timeout, task.last_heartbeat_at)
                    {
                        let deadline =
                            beat + chrono::Duration::milliseconds(timeout.as_millis() as i64);
                        if deadline <= now {
                            expired.push((task.clone(), TimeoutCause::Heartbeat));
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(expired)
    }

    async fn expired_executions(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Execution>, StoreError> {
        let inner = self.inner.read();
        Ok(inner
            .executions
            .values()
            .filter(|s| {
                !s.execution.status.is_terminal()
                    && s.execution.timeout_at.is_some_and(|at| at <= now)
            })
            .take(limit)
            .map(|s| s.execution.clone())
            .collect())
    }

    async fn release_expired_leases(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut inner = self.inner.write();
        let mut released = 0;
        for task in inner.tasks.values_mut() {
            if task.status == TaskStatus::Running
                && task.locked_until.is_some_and(|until| until < now)
            {
                task.status = TaskStatus::Queued;
                task.locked_by = None;
                task.locked_until = None;
                task.last_heartbeat_at = None;
                released += 1;
            }
        }
        Ok(released)
    }

    async fn earliest_wakeup(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        let inner = self.inner.read();
        let nonterminal: Vec<Uuid> = inner
            .executions
            .values()
            .filter(|s| !s.execution.status.is_terminal())
            .map(|s| s.execution.id)
            .collect();

        let task_due = inner
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Queued && nonterminal.contains(&t.execution_id))
            .map(|t| t.after_time)
            .min();
        let wakeup = inner
            .executions
            .values()
            .filter(|s| !s.execution.status.is_terminal())
            .filter_map(|s| s.execution.next_wakeup_at)
            .min();
        let deadline = inner
            .executions
            .values()
            .filter(|s| !s.execution.status.is_terminal())
            .filter_map(|s| s.execution.timeout_at)
            .min();

        Ok([task_due, wakeup, deadline].into_iter().flatten().min())
    }

    async fn list_tasks(&self, execution_id: Uuid) -> Result<Vec<ActivityTask>, StoreError> {
        let inner = self.inner.read();
        Ok(inner
            .tasks
            .values()
            .filter(|t| t.execution_id == execution_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryPolicy;
    use serde_json::json;

    fn new_execution() -> NewExecution {
        NewExecution {
            id: Uuid::now_v7(),
            workflow_name: "wf".into(),
            input: json!({"k": "v"}),
            timeout_at: None,
            parent: None,
        }
    }

    fn new_task(pos: i64) -> NewTask {
        NewTask {
            name: "act".into(),
            args: vec![],
            kwargs: serde_json::Map::new(),
            after_time: Utc::now(),
            expires_at: None,
            heartbeat_timeout: None,
            retry_policy: RetryPolicy::no_retry(),
            scheduled_event_pos: pos,
        }
    }

    #[tokio::test]
    async fn create_writes_started_event_and_wakeup() {
        let store = InMemoryStore::new();
        let execution = store.create_execution(new_execution()).await.unwrap();

        assert_eq!(execution.status, ExecutionStatus::Pending);
        assert!(execution.next_wakeup_at.is_some());

        let (_, events) = store.snapshot(execution.id).await.unwrap();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0].body, EventBody::WorkflowStarted { .. }));
        assert_eq!(events[0].pos, 0);
    }

    #[tokio::test]
    async fn append_position_check() {
        let store = InMemoryStore::new();
        let execution = store.create_execution(new_execution()).await.unwrap();

        let next = store
            .append_events(
                execution.id,
                1,
                vec![EventBody::SignalWait { name: "go".into() }],
            )
            .await
            .unwrap();
        assert_eq!(next, 2);

        let result = store
            .append_events(
                execution.id,
                5,
                vec![EventBody::SignalWait { name: "go".into() }],
            )
            .await;
        assert!(matches!(
            result,
            Err(StoreError::ConcurrencyConflict { .. })
        ));
    }

    #[tokio::test]
    async fn step_commit_superseded_on_raced_append() {
        let store = InMemoryStore::new();
        let execution = store.create_execution(new_execution()).await.unwrap();

        // A signal lands after the snapshot the step was computed from.
        store
            .signal_execution(execution.id, "go", json!(1))
            .await
            .unwrap();

        let applied = store
            .step_commit(StepCommit {
                execution_id: execution.id,
                expected_pos: 1,
                events: vec![EventBody::SignalWait { name: "go".into() }],
                tasks: vec![],
                children: vec![],
                outcome: StepOutcome::Yield {
                    next_wakeup_at: None,
                },
            })
            .await
            .unwrap();
        assert_eq!(applied, StepApplied::Superseded);

        // The raced signal kept the execution runnable.
        let execution = store.get_execution(execution.id).await.unwrap();
        assert!(execution.next_wakeup_at.is_some());
    }

    #[tokio::test]
    async fn task_lifecycle_resolution_appends_event_and_wakes() {
        let store = InMemoryStore::new();
        let execution = store.create_execution(new_execution()).await.unwrap();
        store
            .enqueue_tasks(execution.id, vec![new_task(1)])
            .await
            .unwrap();

        let now = Utc::now();
        let leased = store
            .lease_due_tasks(now, "w1", now + chrono::Duration::seconds(60), 10)
            .await
            .unwrap();
        assert_eq!(leased.len(), 1);
        assert_eq!(leased[0].status, TaskStatus::Running);
        assert_eq!(leased[0].attempt, 1);

        let applied = store
            .complete_task(
                leased[0].handle,
                Some("w1"),
                TaskResolution::Completed { result: json!(5) },
            )
            .await
            .unwrap();
        assert_eq!(applied, StepApplied::Applied);

        let (execution, events) = store.snapshot(execution.id).await.unwrap();
        assert!(execution.next_wakeup_at.is_some());
        assert!(matches!(
            events.last().unwrap().body,
            EventBody::ActivityCompleted { .. }
        ));
    }

    #[tokio::test]
    async fn stale_worker_cannot_double_resolve() {
        let store = InMemoryStore::new();
        let execution = store.create_execution(new_execution()).await.unwrap();
        store
            .enqueue_tasks(execution.id, vec![new_task(1)])
            .await
            .unwrap();

        let now = Utc::now();
        let leased = store
            .lease_due_tasks(now, "w1", now + chrono::Duration::seconds(60), 10)
            .await
            .unwrap();
        let handle = leased[0].handle;

        // Sweep requeues the task; the original worker's lease is gone.
        store.retry_task(handle, None, now, None).await.unwrap();

        let applied = store
            .complete_task(handle, Some("w1"), TaskResolution::Completed { result: json!(1) })
            .await
            .unwrap();
        assert_eq!(applied, StepApplied::Superseded);

        let (_, events) = store.snapshot(execution.id).await.unwrap();
        assert_eq!(events.len(), 1, "no resolution event for stale worker");
    }

    #[tokio::test]
    async fn signal_to_terminal_execution_is_dropped() {
        let store = InMemoryStore::new();
        let execution = store.create_execution(new_execution()).await.unwrap();
        store
            .finalize_execution(
                execution.id,
                EventBody::WorkflowCanceled { reason: None },
                ExecutionStatus::Canceled,
                EngineError::canceled("stop"),
                true,
            )
            .await
            .unwrap();

        store
            .signal_execution(execution.id, "go", json!(1))
            .await
            .unwrap();

        let (execution, events) = store.snapshot(execution.id).await.unwrap();
        assert_eq!(execution.status, ExecutionStatus::Canceled);
        assert!(execution.next_wakeup_at.is_none());
        assert!(!events
            .iter()
            .any(|e| matches!(e.body, EventBody::SignalReceived { .. })));
    }

    #[tokio::test]
    async fn finalize_cancels_queued_tasks_and_reports_children() {
        let store = InMemoryStore::new();
        let parent = store.create_execution(new_execution()).await.unwrap();
        store
            .enqueue_tasks(parent.id, vec![new_task(1)])
            .await
            .unwrap();

        let child = store
            .create_execution(NewExecution {
                id: Uuid::now_v7(),
                workflow_name: "child".into(),
                input: json!({}),
                timeout_at: None,
                parent: Some(ParentLink {
                    execution_id: parent.id,
                    handle: 2,
                }),
            })
            .await
            .unwrap();

        let outcome = store
            .finalize_execution(
                parent.id,
                EventBody::WorkflowCanceled { reason: None },
                ExecutionStatus::Canceled,
                EngineError::canceled("stop"),
                true,
            )
            .await
            .unwrap();
        assert!(outcome.applied);
        assert_eq!(outcome.children, vec![child.id]);

        let tasks = store.list_tasks(parent.id).await.unwrap();
        assert!(tasks.iter().all(|t| t.status == TaskStatus::Canceled));

        // Idempotent on terminal executions.
        let outcome = store
            .finalize_execution(
                parent.id,
                EventBody::WorkflowCanceled { reason: None },
                ExecutionStatus::Canceled,
                EngineError::canceled("again"),
                true,
            )
            .await
            .unwrap();
        assert!(!outcome.applied);
    }

    #[tokio::test]
    async fn lease_expiry_returns_task_to_queue() {
        let store = InMemoryStore::new();
        let execution = store.create_execution(new_execution()).await.unwrap();
        store
            .enqueue_tasks(execution.id, vec![new_task(1)])
            .await
            .unwrap();

        let now = Utc::now();
        store
            .lease_due_tasks(now, "w1", now - chrono::Duration::seconds(1), 10)
            .await
            .unwrap();

        let released = store.release_expired_leases(Utc::now()).await.unwrap();
        assert_eq!(released, 1);
        assert_eq!(store.queued_task_count(), 1);
    }
}
