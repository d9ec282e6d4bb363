//! The worker loop: timeout sweeps, task leasing, execution stepping.
//!
//! Multiple workers may run against the same store; leases and row claiming
//! keep them from treading on each other. Within one worker the tick body is
//! sequential, while activity executions run in parallel spawned tasks
//! bounded by a semaphore.

mod executor;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use tokio::task::{AbortHandle, JoinSet};
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

use crate::engine::Engine;
use crate::error::EngineError;
use crate::persistence::store::{
    ExecutionStatus, ExecutionStore, TaskResolution, TimeoutCause,
};
use crate::workflow::event::{EventBody, SLEEP_ACTIVITY};

/// Worker loop configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Unique worker id used for leases.
    pub worker_id: String,

    /// Idle poll interval; the upper bound on each tick's sleep.
    pub tick: Duration,

    /// Maximum tasks / executions handled per tick stage.
    pub batch: usize,

    /// Maximum concurrently running activities.
    pub concurrency: usize,

    /// Lease duration for claimed tasks and stepped executions; heartbeats
    /// extend it.
    pub lease: Duration,

    /// Bound on loop iterations, for testability. `None` runs forever.
    pub iterations: Option<u64>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::now_v7()),
            tick: Duration::from_millis(500),
            batch: 10,
            concurrency: 4,
            lease: Duration::from_secs(60),
            iterations: None,
        }
    }
}

impl WorkerConfig {
    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    pub fn with_batch(mut self, batch: usize) -> Self {
        self.batch = batch.max(1);
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn with_iterations(mut self, iterations: u64) -> Self {
        self.iterations = Some(iterations);
        self
    }
}

/// What one tick did.
#[derive(Debug, Default, Clone, Copy)]
pub struct TickReport {
    pub leases_released: u64,
    pub tasks_timed_out: usize,
    pub executions_timed_out: usize,
    pub activities_started: usize,
    pub timers_fired: usize,
    pub executions_stepped: usize,
}

impl TickReport {
    pub fn progressed(&self) -> bool {
        self.leases_released > 0
            || self.tasks_timed_out > 0
            || self.executions_timed_out > 0
            || self.activities_started > 0
            || self.timers_fired > 0
            || self.executions_stepped > 0
    }
}

/// Polls the store and drives tasks and executions to completion.
pub struct Worker<S: ExecutionStore> {
    engine: Engine<S>,
    config: WorkerConfig,
    permits: Arc<Semaphore>,
    inflight: tokio::sync::Mutex<JoinSet<()>>,
    aborts: Arc<parking_lot::Mutex<HashMap<i64, AbortHandle>>>,
}

impl<S: ExecutionStore> Worker<S> {
    pub fn new(engine: Engine<S>, config: WorkerConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.concurrency));
        Self {
            engine,
            config,
            permits,
            inflight: tokio::sync::Mutex::new(JoinSet::new()),
            aborts: Arc::new(parking_lot::Mutex::new(HashMap::new())),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    /// Run the loop until the configured iteration bound (forever without
    /// one), then wait for in-flight activities to finish.
    pub async fn run(&self) -> Result<(), EngineError> {
        info!(worker_id = %self.config.worker_id, "worker started");
        let mut ticks: u64 = 0;
        loop {
            match self.tick().await {
                Ok(report) => {
                    if report.progressed() {
                        debug!(?report, "tick progressed");
                    }
                }
                Err(err) => {
                    error!("tick failed: {err}");
                }
            }

            ticks += 1;
            if let Some(limit) = self.config.iterations {
                if ticks >= limit {
                    break;
                }
            }

            let sleep = self.next_sleep().await;
            if !sleep.is_zero() {
                tokio::time::sleep(sleep).await;
            }
        }
        self.drain().await;
        info!(worker_id = %self.config.worker_id, "worker stopped");
        Ok(())
    }

    /// Wait for all in-flight activity tasks to finish.
    pub async fn drain(&self) {
        let mut inflight = self.inflight.lock().await;
        while inflight.join_next().await.is_some() {}
    }

    /// One pass over the four loop stages: sweeps, due tasks, runnable
    /// executions. Public so embedders and tests can drive the loop manually.
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn tick(&self) -> Result<TickReport, EngineError> {
        let store = self.engine.store();
        let now = Utc::now();
        let mut report = TickReport::default();

        // Crashed workers' claims go back to the queue first so this tick can
        // pick them up.
        report.leases_released = store.release_expired_leases(now).await?;

        report.tasks_timed_out = self.sweep_task_timeouts(now).await?;
        report.executions_timed_out = self.sweep_execution_timeouts(now).await?;

        let (activities, timers) = self.run_due_tasks(now).await?;
        report.activities_started = activities;
        report.timers_fired = timers;

        report.executions_stepped = self.step_runnable(now).await?;

        self.reap_finished().await;
        Ok(report)
    }

    async fn sweep_task_timeouts(&self, now: DateTime<Utc>) -> Result<usize, EngineError> {
        let store = self.engine.store();
        let expired = store.expired_tasks(now, self.config.batch).await?;
        let count = expired.len();

        for (task, cause) in expired {
            // Kill the local future if this worker is still running it.
            if let Some(handle) = self.aborts.lock().remove(&task.handle) {
                handle.abort();
            }

            let error = match cause {
                TimeoutCause::ScheduleToClose => EngineError::activity_timed_out(format!(
                    "activity '{}' exceeded its schedule-to-close deadline",
                    task.name
                )),
                TimeoutCause::Heartbeat => EngineError::activity_timed_out(format!(
                    "activity '{}' missed its heartbeat deadline",
                    task.name
                )),
            };

            if task.retry_policy.allows_retry(task.attempt) {
                let delay = task.retry_policy.delay_after(task.attempt);
                let after_time =
                    now + chrono::Duration::milliseconds(delay.as_millis() as i64);
                store
                    .retry_task(task.handle, None, after_time, Some(error))
                    .await?;
            } else {
                store
                    .complete_task(task.handle, None, TaskResolution::TimedOut { error })
                    .await?;
            }
        }
        Ok(count)
    }

    async fn sweep_execution_timeouts(&self, now: DateTime<Utc>) -> Result<usize, EngineError> {
        let store = self.engine.store();
        let expired = store.expired_executions(now, self.config.batch).await?;
        let count = expired.len();

        for execution in expired {
            let error = EngineError::workflow_timed_out(format!(
                "workflow '{}' exceeded its deadline",
                execution.workflow_name
            ));
            let outcome = store
                .finalize_execution(
                    execution.id,
                    EventBody::WorkflowTimedOut {
                        error: error.clone(),
                    },
                    ExecutionStatus::TimedOut,
                    error,
                    true,
                )
                .await?;
            for child in outcome.children {
                self.engine
                    .cancel_workflow(child, Some("parent timed out".into()), true)
                    .await?;
            }
        }
        Ok(count)
    }

    async fn run_due_tasks(&self, now: DateTime<Utc>) -> Result<(usize, usize), EngineError> {
        let store = self.engine.store();
        let slots = self.permits.available_permits();
        // Timer tasks resolve inline, so lease a batch even with no executor
        // slots free.
        let limit = self.config.batch.min(slots.max(1));
        let locked_until =
            now + chrono::Duration::milliseconds(self.config.lease.as_millis() as i64);
        let leased = store
            .lease_due_tasks(now, &self.config.worker_id, locked_until, limit)
            .await?;

        let mut activities = 0;
        let mut timers = 0;
        for task in leased {
            if task.name == SLEEP_ACTIVITY {
                store
                    .complete_task(
                        task.handle,
                        Some(&self.config.worker_id),
                        TaskResolution::TimerFired,
                    )
                    .await?;
                timers += 1;
                continue;
            }

            let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() else {
                // No executor slot after all; the lease expires and the task
                // is re-queued.
                break;
            };

            let store: Arc<dyn ExecutionStore> = Arc::clone(store) as Arc<dyn ExecutionStore>;
            let registry = Arc::clone(self.engine.registry());
            let worker_id = self.config.worker_id.clone();
            let lease = self.config.lease;
            let aborts = Arc::clone(&self.aborts);
            let handle_key = task.handle;

            let mut inflight = self.inflight.lock().await;
            let abort = inflight.spawn(async move {
                let _permit = permit;
                executor::run_activity_task(store, registry, worker_id, lease, task).await;
                aborts.lock().remove(&handle_key);
            });
            drop(inflight);
            self.aborts.lock().insert(handle_key, abort);
            activities += 1;
        }
        Ok((activities, timers))
    }

    async fn step_runnable(&self, now: DateTime<Utc>) -> Result<usize, EngineError> {
        let store = self.engine.store();
        let retry_at =
            now + chrono::Duration::milliseconds(self.config.lease.as_millis() as i64);
        let runnable = store
            .fetch_runnable(now, self.config.batch, retry_at)
            .await?;

        let mut stepped = 0;
        for execution in runnable {
            match self.engine.step_workflow(execution.id).await {
                Ok(report) => {
                    debug!(execution_id = %execution.id, ?report, "stepped execution");
                    stepped += 1;
                }
                Err(err) => {
                    error!(execution_id = %execution.id, "step failed: {err}");
                }
            }
        }
        Ok(stepped)
    }

    /// Reap finished activity tasks so the join set does not grow unbounded.
    async fn reap_finished(&self) {
        let mut inflight = self.inflight.lock().await;
        while inflight.try_join_next().is_some() {}
    }

    /// Sleep until the nearest due time, clamped to `[0, tick]`.
    async fn next_sleep(&self) -> Duration {
        let wakeup = match self.engine.store().earliest_wakeup().await {
            Ok(wakeup) => wakeup,
            Err(err) => {
                error!("failed to compute next wakeup: {err}");
                return self.config.tick;
            }
        };
        match wakeup {
            Some(at) => {
                let now = Utc::now();
                if at <= now {
                    Duration::ZERO
                } else {
                    (at - now)
                        .to_std()
                        .unwrap_or(self.config.tick)
                        .min(self.config.tick)
                }
            }
            None => self.config.tick,
        }
    }
}
