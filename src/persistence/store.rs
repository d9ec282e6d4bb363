//! ExecutionStore trait definition
//!
//! The engine's only I/O dependency. Every operation that pairs a state
//! change with a history event commits both in one transaction or neither.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::EngineError;
use crate::retry::RetryPolicy;
use crate::workflow::event::{EventBody, HistoryEvent};

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Execution not found
    #[error("execution not found: {0}")]
    ExecutionNotFound(Uuid),

    /// Task not found
    #[error("task not found: {0}")]
    TaskNotFound(i64),

    /// Optimistic position check failed
    #[error("concurrency conflict: expected pos {expected}, got {actual}")]
    ConcurrencyConflict { expected: i64, actual: i64 },

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Serialization(msg) => EngineError::serialization(msg),
            other => EngineError::internal(other.to_string()),
        }
    }
}

/// Execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Created or yielded; runnable when `next_wakeup_at` is due.
    Pending,

    /// A scheduler step is in flight.
    Running,

    Completed,
    Failed,
    TimedOut,
    Canceled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::TimedOut | Self::Canceled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
            Self::Canceled => "canceled",
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Activity task status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    Completed,
    Failed,
    TimedOut,
    Canceled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::TimedOut | Self::Canceled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
            Self::Canceled => "canceled",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One instance of a workflow run.
#[derive(Debug, Clone, PartialEq)]
pub struct Execution {
    pub id: Uuid,
    pub workflow_name: String,
    pub input: Value,
    pub status: ExecutionStatus,
    pub result: Option<Value>,
    pub error: Option<EngineError>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Absolute deadline enforced by the worker's timeout sweep.
    pub timeout_at: Option<DateTime<Utc>>,
    pub parent_id: Option<Uuid>,
    /// Position of the parent's CHILD_SCHEDULED event.
    pub parent_handle: Option<i64>,
    /// Earliest time the scheduler should consider this execution; `None`
    /// means no wakeup is scheduled (waiting on an external nudge).
    pub next_wakeup_at: Option<DateTime<Utc>>,
}

/// Parameters for creating an execution.
#[derive(Debug, Clone)]
pub struct NewExecution {
    pub id: Uuid,
    pub workflow_name: String,
    pub input: Value,
    pub timeout_at: Option<DateTime<Utc>>,
    pub parent: Option<ParentLink>,
}

/// Back-reference from a child execution to its parent.
#[derive(Debug, Clone, Copy)]
pub struct ParentLink {
    pub execution_id: Uuid,
    /// Position of the CHILD_SCHEDULED event in the parent's history.
    pub handle: i64,
}

/// A queued unit of activity (or timer) work.
#[derive(Debug, Clone)]
pub struct ActivityTask {
    pub handle: i64,
    pub execution_id: Uuid,
    pub name: String,
    pub args: Vec<Value>,
    pub kwargs: serde_json::Map<String, Value>,
    pub status: TaskStatus,
    /// 1-based; incremented on each retry requeue.
    pub attempt: u32,
    /// Earliest time the task is eligible to run.
    pub after_time: DateTime<Utc>,
    /// Schedule-to-close deadline.
    pub expires_at: Option<DateTime<Utc>>,
    pub heartbeat_timeout: Option<Duration>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub heartbeat_details: Option<Value>,
    pub retry_policy: RetryPolicy,
    /// Back-reference to the schedule event; the activity handle workflows
    /// wait on.
    pub scheduled_event_pos: i64,
    pub result: Option<Value>,
    pub error: Option<EngineError>,
    pub locked_by: Option<String>,
    pub locked_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Parameters for enqueueing a task.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub name: String,
    pub args: Vec<Value>,
    pub kwargs: serde_json::Map<String, Value>,
    pub after_time: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub heartbeat_timeout: Option<Duration>,
    pub retry_policy: RetryPolicy,
    pub scheduled_event_pos: i64,
}

/// Everything one scheduler step produced, committed atomically.
#[derive(Debug, Clone)]
pub struct StepCommit {
    pub execution_id: Uuid,
    /// Position the first buffered event must land on; the commit is
    /// superseded when an external append raced the step.
    pub expected_pos: i64,
    pub events: Vec<EventBody>,
    pub tasks: Vec<NewTask>,
    pub children: Vec<NewExecution>,
    pub outcome: StepOutcome,
}

/// Terminal or yielding disposition of a step.
#[derive(Debug, Clone)]
pub enum StepOutcome {
    Yield { next_wakeup_at: Option<DateTime<Utc>> },
    Complete { result: Value },
    Fail { error: EngineError },
}

/// Whether a guarded write took effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepApplied {
    Applied,
    /// The target moved underneath the writer (position conflict, terminal
    /// execution, or lost lease); the write was dropped wholesale.
    Superseded,
}

/// How a leased task resolved.
#[derive(Debug, Clone)]
pub enum TaskResolution {
    Completed { result: Value },
    /// Reserved `__sleep__` tasks resolve with TIMER_FIRED instead of
    /// ACTIVITY_COMPLETED.
    TimerFired,
    Failed { error: EngineError },
    TimedOut { error: EngineError },
}

/// Which deadline a swept task blew.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutCause {
    ScheduleToClose,
    Heartbeat,
}

/// Result of finalizing (cancel / timeout) an execution.
#[derive(Debug, Clone)]
pub struct FinalizeOutcome {
    pub applied: bool,
    /// Non-terminal children, for cascading cancellation.
    pub children: Vec<Uuid>,
}

/// Response to an activity heartbeat.
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatAck {
    /// False when the task is no longer running under this worker's lease.
    pub accepted: bool,

    /// True when the owning execution has been canceled; cooperative
    /// activities should stop.
    pub cancel_requested: bool,
}

/// Store for executions, history events, and the activity task queue.
///
/// Implementations must be thread-safe and keep each documented operation
/// atomic; the engine's correctness hinges on it.
#[async_trait]
pub trait ExecutionStore: Send + Sync + 'static {
    // =========================================================================
    // Execution lifecycle
    // =========================================================================

    /// Insert the execution and its WORKFLOW_STARTED event (pos 0), with
    /// `next_wakeup_at = now`, in one transaction.
    async fn create_execution(&self, new: NewExecution) -> Result<Execution, StoreError>;

    async fn get_execution(&self, id: Uuid) -> Result<Execution, StoreError>;

    /// Consistent read of the execution and its full history in `pos` order.
    async fn snapshot(&self, id: Uuid) -> Result<(Execution, Vec<HistoryEvent>), StoreError>;

    /// Append events with dense monotonic `pos`, verifying the expected next
    /// position.
    async fn append_events(
        &self,
        id: Uuid,
        expected_pos: i64,
        events: Vec<EventBody>,
    ) -> Result<i64, StoreError>;

    /// Append a SIGNAL_RECEIVED event and mark the execution runnable.
    /// Silently drops the wakeup (but still records nothing) when the
    /// execution is terminal.
    async fn signal_execution(&self, id: Uuid, name: &str, payload: Value)
        -> Result<(), StoreError>;

    /// Drive the execution to a terminal status with the given event, used
    /// for cancellation and workflow timeouts. Marks queued tasks CANCELED
    /// when `cancel_queued` is set and reports non-terminal children for
    /// cascading. No-op on already-terminal executions.
    async fn finalize_execution(
        &self,
        id: Uuid,
        body: EventBody,
        status: ExecutionStatus,
        error: EngineError,
        cancel_queued: bool,
    ) -> Result<FinalizeOutcome, StoreError>;

    /// Commit everything one scheduler step produced: events (position
    /// checked), new tasks, new child executions, and the status/wakeup
    /// transition. Terminal outcomes notify the parent execution in the same
    /// transaction.
    async fn step_commit(&self, commit: StepCommit) -> Result<StepApplied, StoreError>;

    /// Claim up to `limit` runnable executions (`next_wakeup_at <= now`,
    /// non-terminal), marking them RUNNING with the wakeup pushed to
    /// `retry_at` so a crashed step gets retried.
    async fn fetch_runnable(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        retry_at: DateTime<Utc>,
    ) -> Result<Vec<Execution>, StoreError>;

    // =========================================================================
    // Task queue
    // =========================================================================

    /// Insert task rows for an execution.
    async fn enqueue_tasks(
        &self,
        execution_id: Uuid,
        tasks: Vec<NewTask>,
    ) -> Result<(), StoreError>;

    /// Claim up to `limit` due tasks under a lease, skipping tasks of
    /// terminal executions. Claimed tasks transition QUEUED -> RUNNING.
    async fn lease_due_tasks(
        &self,
        now: DateTime<Utc>,
        worker_id: &str,
        locked_until: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ActivityTask>, StoreError>;

    /// Resolve a task: terminal task status, the paired history event, and
    /// the execution wakeup, all in one transaction. Guarded by the lease
    /// when `worker_id` is given; sweep callers pass `None`. When the owning
    /// execution is already terminal the task status still lands but no
    /// event is appended and nothing is woken.
    async fn complete_task(
        &self,
        handle: i64,
        worker_id: Option<&str>,
        resolution: TaskResolution,
    ) -> Result<StepApplied, StoreError>;

    /// Requeue a failed attempt: status back to QUEUED, `attempt + 1`, new
    /// `after_time`, lease cleared. Appends no event; the terminal event only
    /// fires on the final attempt's outcome.
    async fn retry_task(
        &self,
        handle: i64,
        worker_id: Option<&str>,
        after_time: DateTime<Utc>,
        error: Option<EngineError>,
    ) -> Result<StepApplied, StoreError>;

    /// Record an activity heartbeat, extending the worker's lease so
    /// long-running activities that keep beating are not reclaimed.
    async fn record_heartbeat(
        &self,
        handle: i64,
        worker_id: &str,
        details: Option<Value>,
        extend_until: DateTime<Utc>,
    ) -> Result<HeartbeatAck, StoreError>;

    // =========================================================================
    // Sweeps
    // =========================================================================

    /// Tasks past their schedule-to-close deadline (QUEUED or RUNNING) or
    /// past their heartbeat deadline (RUNNING), tagged with the cause.
    async fn expired_tasks(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<(ActivityTask, TimeoutCause)>, StoreError>;

    /// Non-terminal executions past `timeout_at`.
    async fn expired_executions(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Execution>, StoreError>;

    /// Return RUNNING tasks with an expired lease to QUEUED. Returns the
    /// number of released tasks.
    async fn release_expired_leases(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Earliest of: due times of queued tasks, wakeups of non-terminal
    /// executions, and execution deadlines. Drives the worker's sleep.
    async fn earliest_wakeup(&self) -> Result<Option<DateTime<Utc>>, StoreError>;

    /// All tasks of an execution, oldest first (audit and queries).
    async fn list_tasks(&self, execution_id: Uuid) -> Result<Vec<ActivityTask>, StoreError>;
}
