//! PostgreSQL implementation of ExecutionStore
//!
//! Production persistence: every transition documented on the trait is one
//! transaction, task and execution claiming use `FOR UPDATE SKIP LOCKED`, and
//! per-execution appends serialize on the execution row lock.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgPool, Row};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use super::store::*;
use crate::error::EngineError;
use crate::workflow::event::{EventBody, HistoryEvent};

const SCHEMA: &str = include_str!("../../migrations/0001_init.sql");

/// PostgreSQL implementation of ExecutionStore
///
/// # Example
///
/// ```ignore
/// use durable::PostgresStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/durable").await?;
/// let store = PostgresStore::new(pool);
/// store.migrate().await?;
/// ```
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the embedded schema (idempotent).
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }
}

fn db_err(err: sqlx::Error) -> StoreError {
    StoreError::Database(err.to_string())
}

fn parse_execution_status(status: &str) -> Result<ExecutionStatus, StoreError> {
    match status {
        "pending" => Ok(ExecutionStatus::Pending),
        "running" => Ok(ExecutionStatus::Running),
        "completed" => Ok(ExecutionStatus::Completed),
        "failed" => Ok(ExecutionStatus::Failed),
        "timed_out" => Ok(ExecutionStatus::TimedOut),
        "canceled" => Ok(ExecutionStatus::Canceled),
        other => Err(StoreError::Database(format!(
            "unknown execution status '{other}'"
        ))),
    }
}

fn parse_task_status(status: &str) -> Result<TaskStatus, StoreError> {
    match status {
        "queued" => Ok(TaskStatus::Queued),
        "running" => Ok(TaskStatus::Running),
        "completed" => Ok(TaskStatus::Completed),
        "failed" => Ok(TaskStatus::Failed),
        "timed_out" => Ok(TaskStatus::TimedOut),
        "canceled" => Ok(TaskStatus::Canceled),
        other => Err(StoreError::Database(format!(
            "unknown task status '{other}'"
        ))),
    }
}

fn execution_from_row(row: &PgRow) -> Result<Execution, StoreError> {
    let status: String = row.get("status");
    let error: Option<Value> = row.get("error");
    let error = error
        .map(serde_json::from_value::<EngineError>)
        .transpose()
        .map_err(|e| StoreError::Serialization(e.to_string()))?;

    Ok(Execution {
        id: row.get("id"),
        workflow_name: row.get("workflow_name"),
        input: row.get("input"),
        status: parse_execution_status(&status)?,
        result: row.get("result"),
        error,
        created_at: row.get("created_at"),
        started_at: row.get("started_at"),
        finished_at: row.get("finished_at"),
        timeout_at: row.get("timeout_at"),
        parent_id: row.get("parent_id"),
        parent_handle: row.get("parent_handle"),
        next_wakeup_at: row.get("next_wakeup_at"),
    })
}

fn task_from_row(row: &PgRow) -> Result<ActivityTask, StoreError> {
    let status: String = row.get("status");
    let args: Value = row.get("args");
    let kwargs: Value = row.get("kwargs");
    let retry_policy: Value = row.get("retry_policy");
    let error: Option<Value> = row.get("error");

    Ok(ActivityTask {
        handle: row.get("handle"),
        execution_id: row.get("execution_id"),
        name: row.get("name"),
        args: serde_json::from_value(args)
            .map_err(|e| StoreError::Serialization(e.to_string()))?,
        kwargs: serde_json::from_value(kwargs)
            .map_err(|e| StoreError::Serialization(e.to_string()))?,
        status: parse_task_status(&status)?,
        attempt: row.get::<i32, _>("attempt") as u32,
        after_time: row.get("after_time"),
        expires_at: row.get("expires_at"),
        heartbeat_timeout: row
            .get::<Option<i64>, _>("heartbeat_timeout_ms")
            .map(|ms| Duration::from_millis(ms as u64)),
        last_heartbeat_at: row.get("last_heartbeat_at"),
        heartbeat_details: row.get("heartbeat_details"),
        retry_policy: serde_json::from_value(retry_policy)
            .map_err(|e| StoreError::Serialization(e.to_string()))?,
        scheduled_event_pos: row.get("scheduled_event_pos"),
        result: row.get("result"),
        error: error
            .map(serde_json::from_value::<EngineError>)
            .transpose()
            .map_err(|e| StoreError::Serialization(e.to_string()))?,
        locked_by: row.get("locked_by"),
        locked_until: row.get("locked_until"),
        created_at: row.get("created_at"),
        finished_at: row.get("finished_at"),
    })
}

fn event_from_row(row: &PgRow) -> Result<HistoryEvent, StoreError> {
    let payload: Value = row.get("payload");
    Ok(HistoryEvent {
        id: row.get("id"),
        execution_id: row.get("execution_id"),
        pos: row.get("pos"),
        body: serde_json::from_value(payload)
            .map_err(|e| StoreError::Serialization(e.to_string()))?,
        created_at: row.get("created_at"),
    })
}

/// Lock the execution row, serializing all append paths for it.
async fn lock_execution(conn: &mut PgConnection, id: Uuid) -> Result<Execution, StoreError> {
    let row = sqlx::query("SELECT * FROM durable_executions WHERE id = $1 FOR UPDATE")
        .bind(id)
        .fetch_optional(conn)
        .await
        .map_err(db_err)?
        .ok_or(StoreError::ExecutionNotFound(id))?;
    execution_from_row(&row)
}

async fn next_pos(conn: &mut PgConnection, id: Uuid) -> Result<i64, StoreError> {
    let row = sqlx::query(
        "SELECT COALESCE(MAX(pos) + 1, 0) AS next_pos FROM durable_history_events WHERE execution_id = $1",
    )
    .bind(id)
    .fetch_one(conn)
    .await
    .map_err(db_err)?;
    Ok(row.get("next_pos"))
}

async fn insert_event(
    conn: &mut PgConnection,
    execution_id: Uuid,
    pos: i64,
    body: &EventBody,
) -> Result<(), StoreError> {
    let payload =
        serde_json::to_value(body).map_err(|e| StoreError::Serialization(e.to_string()))?;
    sqlx::query(
        "INSERT INTO durable_history_events (execution_id, pos, kind, payload) VALUES ($1, $2, $3, $4)",
    )
    .bind(execution_id)
    .bind(pos)
    .bind(body.kind().as_str())
    .bind(&payload)
    .execute(conn)
    .await
    .map_err(db_err)?;
    Ok(())
}

async fn insert_task(
    conn: &mut PgConnection,
    execution_id: Uuid,
    task: &NewTask,
) -> Result<(), StoreError> {
    let args = serde_json::to_value(&task.args)
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
    let kwargs = serde_json::to_value(&task.kwargs)
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
    let retry_policy = serde_json::to_value(&task.retry_policy)
        .map_err(|e| StoreError::Serialization(e.to_string()))?;

    sqlx::query(
        r#"
        INSERT INTO durable_activity_tasks (
            execution_id, name, args, kwargs, after_time, expires_at,
            heartbeat_timeout_ms, retry_policy, scheduled_event_pos
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        "#,
    )
    .bind(execution_id)
    .bind(&task.name)
    .bind(&args)
    .bind(&kwargs)
    .bind(task.after_time)
    .bind(task.expires_at)
    .bind(task.heartbeat_timeout.map(|t| t.as_millis() as i64))
    .bind(&retry_policy)
    .bind(task.scheduled_event_pos)
    .execute(conn)
    .await
    .map_err(db_err)?;
    Ok(())
}

async fn insert_execution(
    conn: &mut PgConnection,
    new: &NewExecution,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO durable_executions (
            id, workflow_name, input, status, created_at, timeout_at,
            parent_id, parent_handle, next_wakeup_at
        )
        VALUES ($1, $2, $3, 'pending', $4, $5, $6, $7, $4)
        "#,
    )
    .bind(new.id)
    .bind(&new.workflow_name)
    .bind(&new.input)
    .bind(now)
    .bind(new.timeout_at)
    .bind(new.parent.map(|p| p.execution_id))
    .bind(new.parent.map(|p| p.handle))
    .execute(&mut *conn)
    .await
    .map_err(db_err)?;

    insert_event(
        conn,
        new.id,
        0,
        &EventBody::WorkflowStarted {
            input: new.input.clone(),
        },
    )
    .await
}

/// Append a child resolution event to a non-terminal parent and wake it.
async fn notify_parent(
    conn: &mut PgConnection,
    parent_id: Uuid,
    body: EventBody,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    let parent = lock_execution(&mut *conn, parent_id).await?;
    if parent.status.is_terminal() {
        return Ok(());
    }
    let pos = next_pos(&mut *conn, parent_id).await?;
    insert_event(&mut *conn, parent_id, pos, &body).await?;
    sqlx::query("UPDATE durable_executions SET next_wakeup_at = $2 WHERE id = $1")
        .bind(parent_id)
        .bind(now)
        .execute(conn)
        .await
        .map_err(db_err)?;
    Ok(())
}

#[async_trait]
impl ExecutionStore for PostgresStore {
    #[instrument(skip(self, new), fields(workflow_name = %new.workflow_name))]
    async fn create_execution(&self, new: NewExecution) -> Result<Execution, StoreError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        insert_execution(&mut tx, &new, now).await?;
        tx.commit().await.map_err(db_err)?;

        debug!(execution_id = %new.id, "created execution");
        Ok(Execution {
            id: new.id,
            workflow_name: new.workflow_name,
            input: new.input,
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
        })
    }

    async fn get_execution(&self, id: Uuid) -> Result<Execution, StoreError> {
        let row = sqlx::query("SELECT * FROM durable_executions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .ok_or(StoreError::ExecutionNotFound(id))?;
        execution_from_row(&row)
    }

    async fn snapshot(&self, id: Uuid) -> Result<(Execution, Vec<HistoryEvent>), StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let row = sqlx::query("SELECT * FROM durable_executions WHERE id = $1")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?
            .ok_or(StoreError::ExecutionNotFound(id))?;
        let execution = execution_from_row(&row)?;

        let rows = sqlx::query(
            "SELECT * FROM durable_history_events WHERE execution_id = $1 ORDER BY pos",
        )
        .bind(id)
        .fetch_all(&mut *tx)
        .await
        .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;

        let events = rows
            .iter()
            .map(event_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok((execution, events))
    }

    async fn append_events(
        &self,
        id: Uuid,
        expected_pos: i64,
        events: Vec<EventBody>,
    ) -> Result<i64, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        lock_execution(&mut tx, id).await?;
        let mut pos = next_pos(&mut tx, id).await?;
        if pos != expected_pos {
            return Err(StoreError::ConcurrencyConflict {
                expected: expected_pos,
                actual: pos,
            });
        }
        for body in &events {
            insert_event(&mut tx, id, pos, body).await?;
            pos += 1;
        }
        tx.commit().await.map_err(db_err)?;
        Ok(pos)
    }

    #[instrument(skip(self, payload))]
    async fn signal_execution(
        &self,
        id: Uuid,
        name: &str,
        payload: Value,
    ) -> Result<(), StoreError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let execution = lock_execution(&mut tx, id).await?;
        if execution.status.is_terminal() {
            // Documented behavior: signals to terminal executions are dropped.
            return Ok(());
        }
        let pos = next_pos(&mut tx, id).await?;
        insert_event(
            &mut tx,
            id,
            pos,
            &EventBody::SignalReceived {
                name: name.to_string(),
                payload,
            },
        )
        .await?;
        sqlx::query("UPDATE durable_executions SET next_wakeup_at = $2 WHERE id = $1")
            .bind(id)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        debug!(%id, signal = name, "signal recorded");
        Ok(())
    }

    #[instrument(skip(self, body, error))]
    async fn finalize_execution(
        &self,
        id: Uuid,
        body: EventBody,
        status: ExecutionStatus,
        error: EngineError,
        cancel_queued: bool,
    ) -> Result<FinalizeOutcome, StoreError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let execution = lock_execution(&mut tx, id).await?;
        if execution.status.is_terminal() {
            return Ok(FinalizeOutcome {
                applied: false,
                children: vec![],
            });
        }

        let pos = next_pos(&mut tx, id).await?;
        insert_event(&mut tx, id, pos, &body).await?;

        let error_json = serde_json::to_value(&error)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        sqlx::query(
            r#"
            UPDATE durable_executions
            SET status = $2, error = $3, finished_at = $4, next_wakeup_at = NULL
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(&error_json)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        if cancel_queued {
            sqlx::query(
                r#"
                UPDATE durable_activity_tasks
                SET status = 'canceled', finished_at = $2, locked_by = NULL, locked_until = NULL
                WHERE execution_id = $1 AND status = 'queued'
                "#,
            )
            .bind(id)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        if let (Some(parent_id), Some(handle)) = (execution.parent_id, execution.parent_handle) {
            notify_parent(
                &mut tx,
                parent_id,
                EventBody::ChildFailed {
                    scheduled_pos: handle,
                    child_id: id,
                    error,
                },
                now,
            )
            .await?;
        }

        let rows = sqlx::query(
            "SELECT id FROM durable_executions WHERE parent_id = $1 AND status IN ('pending', 'running')",
        )
        .bind(id)
        .fetch_all(&mut *tx)
        .await
        .map_err(db_err)?;
        let children = rows.iter().map(|r| r.get("id")).collect();

        tx.commit().await.map_err(db_err)?;
        Ok(FinalizeOutcome {
            applied: true,
            children,
        })
    }

    #[instrument(skip(self, commit), fields(execution_id = %commit.execution_id))]
    async fn step_commit(&self, commit: StepCommit) -> Result<StepApplied, StoreError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let execution = lock_execution(&mut tx, commit.execution_id).await?;
        if execution.status.is_terminal() {
            return Ok(StepApplied::Superseded);
        }
        let mut pos = next_pos(&mut tx, commit.execution_id).await?;
        if pos != commit.expected_pos {
            debug!(expected = commit.expected_pos, actual = pos, "step superseded");
            return Ok(StepApplied::Superseded);
        }

        for body in &commit.events {
            insert_event(&mut tx, commit.execution_id, pos, body).await?;
            pos += 1;
        }
        for task in &commit.tasks {
            insert_task(&mut tx, commit.execution_id, task).await?;
        }
        for child in &commit.children {
            insert_execution(&mut tx, child, now).await?;
        }

        let (status, result, error, finished_at, next_wakeup_at) = match &commit.outcome {
            StepOutcome::Yield { next_wakeup_at } => (
                ExecutionStatus::Pending,
                None,
                None,
                None,
                *next_wakeup_at,
            ),
            StepOutcome::Complete { result } => (
                ExecutionStatus::Completed,
                Some(result.clone()),
                None,
                Some(now),
                None,
            ),
            StepOutcome::Fail { error } => (
                ExecutionStatus::Failed,
                None,
                Some(error.clone()),
                Some(now),
                None,
            ),
        };

        let error_json = error
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        sqlx::query(
            r#"
            UPDATE durable_executions
            SET status = $2,
                result = COALESCE($3, result),
                error = COALESCE($4, error),
                started_at = COALESCE(started_at, $5),
                finished_at = $6,
                next_wakeup_at = $7
            WHERE id = $1
            "#,
        )
        .bind(commit.execution_id)
        .bind(status.as_str())
        .bind(&result)
        .bind(&error_json)
        .bind(now)
        .bind(finished_at)
        .bind(next_wakeup_at)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        if status.is_terminal() {
            if let (Some(parent_id), Some(handle)) = (execution.parent_id, execution.parent_handle)
            {
                let body = match (&status, result) {
                    (ExecutionStatus::Completed, result) => EventBody::ChildCompleted {
                        scheduled_pos: handle,
                        child_id: commit.execution_id,
                        result: result.unwrap_or(Value::Null),
                    },
                    (_, _) => EventBody::ChildFailed {
                        scheduled_pos: handle,
                        child_id: commit.execution_id,
                        error: error
                            .unwrap_or_else(|| EngineError::internal("workflow failed")),
                    },
                };
                notify_parent(&mut tx, parent_id, body, now).await?;
            }
        }

        tx.commit().await.map_err(db_err)?;
        Ok(StepApplied::Applied)
    }

    async fn fetch_runnable(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        retry_at: DateTime<Utc>,
    ) -> Result<Vec<Execution>, StoreError> {
        let rows = sqlx::query(
            r#"
            WITH runnable AS (
                SELECT id
                FROM durable_executions
                WHERE status IN ('pending', 'running')
                  AND next_wakeup_at IS NOT NULL
                  AND next_wakeup_at <= $1
                ORDER BY next_wakeup_at
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE durable_executions e
            SET status = 'running',
                started_at = COALESCE(e.started_at, $1),
                next_wakeup_at = $3
            FROM runnable r
            WHERE e.id = r.id
            RETURNING e.*
            "#,
        )
        .bind(now)
        .bind(limit as i64)
        .bind(retry_at)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(execution_from_row).collect()
    }

    async fn enqueue_tasks(
        &self,
        execution_id: Uuid,
        tasks: Vec<NewTask>,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        for task in &tasks {
            insert_task(&mut tx, execution_id, task).await?;
        }
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn lease_due_tasks(
        &self,
        now: DateTime<Utc>,
        worker_id: &str,
        locked_until: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ActivityTask>, StoreError> {
        let rows = sqlx::query(
            r#"
            WITH claimable AS (
                SELECT t.handle
                FROM durable_activity_tasks t
                JOIN durable_executions e ON e.id = t.execution_id
                WHERE t.status = 'queued'
                  AND t.after_time <= $1
                  AND e.status IN ('pending', 'running')
                ORDER BY t.after_time
                LIMIT $2
                FOR UPDATE OF t SKIP LOCKED
            )
            UPDATE durable_activity_tasks t
            SET status = 'running',
                locked_by = $3,
                locked_until = $4,
                last_heartbeat_at = $1
            FROM claimable c
            WHERE t.handle = c.handle
            RETURNING t.*
            "#,
        )
        .bind(now)
        .bind(limit as i64)
        .bind(worker_id)
        .bind(locked_until)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let claimed = rows
            .iter()
            .map(task_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        if !claimed.is_empty() {
            debug!(worker_id, count = claimed.len(), "leased tasks");
        }
        Ok(claimed)
    }

    #[instrument(skip(self, resolution))]
    async fn complete_task(
        &self,
        handle: i64,
        worker_id: Option<&str>,
        resolution: TaskResolution,
    ) -> Result<StepApplied, StoreError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let row = sqlx::query("SELECT * FROM durable_activity_tasks WHERE handle = $1 FOR UPDATE")
            .bind(handle)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?
            .ok_or(StoreError::TaskNotFound(handle))?;
        let task = task_from_row(&row)?;

        if task.status.is_terminal() {
            return Ok(StepApplied::Superseded);
        }
        if let Some(worker) = worker_id {
            if task.locked_by.as_deref() != Some(worker) || task.status != TaskStatus::Running {
                return Ok(StepApplied::Superseded);
            }
        }

        let (status, result, err, body) = match resolution {
            TaskResolution::Completed { result } => (
                TaskStatus::Completed,
                Some(result.clone()),
                None,
                EventBody::ActivityCompleted {
                    scheduled_pos: task.scheduled_event_pos,
                    result,
                },
            ),
            TaskResolution::TimerFired => (
                TaskStatus::Completed,
                None,
                None,
                EventBody::TimerFired {
                    scheduled_pos: task.scheduled_event_pos,
                },
            ),
            TaskResolution::Failed { error } => (
                TaskStatus::Failed,
                None,
                Some(error.clone()),
                EventBody::ActivityFailed {
                    scheduled_pos: task.scheduled_event_pos,
                    error,
                },
            ),
            TaskResolution::TimedOut { error } => (
                TaskStatus::TimedOut,
                None,
                Some(error.clone()),
                EventBody::ActivityTimedOut {
                    scheduled_pos: task.scheduled_event_pos,
                    error,
                },
            ),
        };

        let error_json = err
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        sqlx::query(
            r#"
            UPDATE durable_activity_tasks
            SET status = $2, result = $3, error = $4, finished_at = $5,
                locked_by = NULL, locked_until = NULL
            WHERE handle = $1
            "#,
        )
        .bind(handle)
        .bind(status.as_str())
        .bind(&result)
        .bind(&error_json)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        let execution = lock_execution(&mut tx, task.execution_id).await?;
        if !execution.status.is_terminal() {
            let pos = next_pos(&mut tx, task.execution_id).await?;
            insert_event(&mut tx, task.execution_id, pos, &body).await?;
            sqlx::query("UPDATE durable_executions SET next_wakeup_at = $2 WHERE id = $1")
                .bind(task.execution_id)
                .bind(now)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        }

        tx.commit().await.map_err(db_err)?;
        debug!(handle, status = %status, "task resolved");
        Ok(StepApplied::Applied)
    }

    async fn retry_task(
        &self,
        handle: i64,
        worker_id: Option<&str>,
        after_time: DateTime<Utc>,
        error: Option<EngineError>,
    ) -> Result<StepApplied, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let row = sqlx::query("SELECT * FROM durable_activity_tasks WHERE handle = $1 FOR UPDATE")
            .bind(handle)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?
            .ok_or(StoreError::TaskNotFound(handle))?;
        let task = task_from_row(&row)?;

        if task.status.is_terminal() {
            return Ok(StepApplied::Superseded);
        }
        if let Some(worker) = worker_id {
            if task.locked_by.as_deref() != Some(worker) || task.status != TaskStatus::Running {
                return Ok(StepApplied::Superseded);
            }
        }

        let error_json = error
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        sqlx::query(
            r#"
            UPDATE durable_activity_tasks
            SET status = 'queued', attempt = attempt + 1, after_time = $2,
                error = COALESCE($3, error), locked_by = NULL, locked_until = NULL,
                last_heartbeat_at = NULL
            WHERE handle = $1
            "#,
        )
        .bind(handle)
        .bind(after_time)
        .bind(&error_json)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(StepApplied::Applied)
    }

    async fn record_heartbeat(
        &self,
        handle: i64,
        worker_id: &str,
        details: Option<Value>,
        extend_until: DateTime<Utc>,
    ) -> Result<HeartbeatAck, StoreError> {
        let row = sqlx::query(
            r#"
            UPDATE durable_activity_tasks
            SET last_heartbeat_at = $3,
                locked_until = $4,
                heartbeat_details = COALESCE($5, heartbeat_details)
            WHERE handle = $1 AND locked_by = $2 AND status = 'running'
            RETURNING execution_id
            "#,
        )
        .bind(handle)
        .bind(worker_id)
        .bind(Utc::now())
        .bind(extend_until)
        .bind(&details)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        match row {
            Some(row) => {
                let execution_id: Uuid = row.get("execution_id");
                let execution = self.get_execution(execution_id).await?;
                Ok(HeartbeatAck {
                    accepted: true,
                    cancel_requested: execution.status.is_terminal(),
                })
            }
            None => Ok(HeartbeatAck {
                accepted: false,
                cancel_requested: true,
            }),
        }
    }

    async fn expired_tasks(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<(ActivityTask, TimeoutCause)>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM durable_activity_tasks
            WHERE status IN ('queued', 'running')
              AND expires_at IS NOT NULL
              AND expires_at <= $1
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let mut expired = Vec::new();
        for row in &rows {
            expired.push((task_from_row(row)?, TimeoutCause::ScheduleToClose));
        }

        let rows = sqlx::query(
            r#"
            SELECT * FROM durable_activity_tasks
            WHERE status = 'running'
              AND heartbeat_timeout_ms IS NOT NULL
              AND last_heartbeat_at IS NOT NULL
              AND last_heartbeat_at + heartbeat_timeout_ms * interval '1 millisecond' <= $1
              AND (expires_at IS NULL OR expires_at > $1)
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        for row in &rows {
            expired.push((task_from_row(row)?, TimeoutCause::Heartbeat));
        }

        expired.truncate(limit);
        Ok(expired)
    }

    async fn expired_executions(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Execution>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM durable_executions
            WHERE status IN ('pending', 'running')
              AND timeout_at IS NOT NULL
              AND timeout_at <= $1
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(execution_from_row).collect()
    }

    async fn release_expired_leases(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE durable_activity_tasks
            SET status = 'queued', locked_by = NULL, locked_until = NULL,
                last_heartbeat_at = NULL
            WHERE status = 'running' AND locked_until IS NOT NULL AND locked_until < $1
            "#,
        )
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("failed to release expired leases: {}", e);
            db_err(e)
        })?;
        Ok(result.rows_affected())
    }

    async fn earliest_wakeup(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT MIN(candidate) AS wakeup FROM (
                SELECT MIN(t.after_time) AS candidate
                FROM durable_activity_tasks t
                JOIN durable_executions e ON e.id = t.execution_id
                WHERE t.status = 'queued' AND e.status IN ('pending', 'running')
                UNION ALL
                SELECT MIN(next_wakeup_at)
                FROM durable_executions
                WHERE status IN ('pending', 'running')
                UNION ALL
                SELECT MIN(timeout_at)
                FROM durable_executions
                WHERE status IN ('pending', 'running')
            ) candidates
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(row.get("wakeup"))
    }

    async fn list_tasks(&self, execution_id: Uuid) -> Result<Vec<ActivityTask>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM durable_activity_tasks WHERE execution_id = $1 ORDER BY handle",
        )
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(task_from_row).collect()
    }
}
