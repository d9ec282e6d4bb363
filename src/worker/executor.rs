//! Isolated activity dispatch.
//!
//! Each leased activity runs in its own spawned task. The containment
//! contract: a deadline (or a sweep on another worker) must be able to
//! forcibly terminate the activity while a normally-completing activity still
//! reports its result. Task abort plus lease-guarded resolution provides
//! both: an aborted future stops at its next await point, and a stale future
//! that lost its lease cannot write a resolution.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, warn};

use crate::activity::{ActivityContext, ActivityFailure};
use crate::engine::registry::Registry;
use crate::error::EngineError;
use crate::persistence::store::{ActivityTask, ExecutionStore, TaskResolution};

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(duration.as_millis() as i64)
}

/// Execute one leased activity task and persist its outcome.
pub(crate) async fn run_activity_task(
    store: Arc<dyn ExecutionStore>,
    registry: Arc<Registry>,
    worker_id: String,
    lease: Duration,
    task: ActivityTask,
) {
    let handle = task.handle;

    let func = match registry.activity(&task.name) {
        Some(entry) => Arc::clone(&entry.func),
        None => {
            let error =
                EngineError::not_registered(format!("unknown activity '{}'", task.name));
            warn!(handle, activity = %task.name, "failing unregistered activity");
            report(
                &store,
                handle,
                &worker_id,
                TaskResolution::Failed { error },
            )
            .await;
            return;
        }
    };

    let ctx = ActivityContext {
        execution_id: task.execution_id,
        task_handle: handle,
        attempt: task.attempt,
        args: task.args.clone(),
        kwargs: task.kwargs.clone(),
        worker_id: worker_id.clone(),
        lease,
        store: Arc::clone(&store),
    };

    let future = (func)(ctx);
    let outcome = match task.expires_at {
        Some(expires_at) => {
            let remaining = (expires_at - Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO);
            match tokio::time::timeout(remaining, future).await {
                Ok(result) => Some(result),
                // Deadline elapsed; the future was dropped at its await point.
                Err(_) => None,
            }
        }
        None => Some(future.await),
    };

    let policy = &task.retry_policy;
    match outcome {
        Some(Ok(result)) => {
            debug!(handle, activity = %task.name, attempt = task.attempt, "activity completed");
            report(
                &store,
                handle,
                &worker_id,
                TaskResolution::Completed { result },
            )
            .await;
        }
        Some(Err(failure)) => {
            let may_retry = failure.retryable
                && policy.retryable_code(failure.code.as_deref())
                && policy.allows_retry(task.attempt);
            if may_retry {
                let after_time = Utc::now() + to_chrono(policy.delay_after(task.attempt));
                debug!(
                    handle,
                    activity = %task.name,
                    attempt = task.attempt,
                    "activity failed, retrying"
                );
                retry(&store, handle, &worker_id, after_time, failure).await;
            } else {
                debug!(
                    handle,
                    activity = %task.name,
                    attempt = task.attempt,
                    "activity failed terminally"
                );
                report(
                    &store,
                    handle,
                    &worker_id,
                    TaskResolution::Failed {
                        error: failure.into_engine_error(),
                    },
                )
                .await;
            }
        }
        None => {
            let error = EngineError::activity_timed_out(format!(
                "activity '{}' exceeded its schedule-to-close deadline",
                task.name
            ));
            if policy.allows_retry(task.attempt) {
                let after_time = Utc::now() + to_chrono(policy.delay_after(task.attempt));
                if let Err(err) = store
                    .retry_task(handle, Some(&worker_id), after_time, Some(error))
                    .await
                {
                    error!(handle, "failed to requeue timed-out activity: {err}");
                }
            } else {
                report(
                    &store,
                    handle,
                    &worker_id,
                    TaskResolution::TimedOut { error },
                )
                .await;
            }
        }
    }
}

async fn report(
    store: &Arc<dyn ExecutionStore>,
    handle: i64,
    worker_id: &str,
    resolution: TaskResolution,
) {
    if let Err(err) = store
        .complete_task(handle, Some(worker_id), resolution)
        .await
    {
        error!(handle, "failed to resolve activity task: {err}");
    }
}

async fn retry(
    store: &Arc<dyn ExecutionStore>,
    handle: i64,
    worker_id: &str,
    after_time: chrono::DateTime<Utc>,
    failure: ActivityFailure,
) {
    if let Err(err) = store
        .retry_task(
            handle,
            Some(worker_id),
            after_time,
            Some(failure.into_engine_error()),
        )
        .await
    {
        error!(handle, "failed to requeue activity task: {err}");
    }
}
