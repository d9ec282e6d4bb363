//! End-to-end engine tests over the in-memory store.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};

use durable::prelude::*;
use durable::{EventKind, HistoryEvent};

fn base_registry() -> Registry {
    let mut registry = Registry::new();

    registry.register_activity("add", |ctx: ActivityContext| async move {
        let a = ctx.arg(0).as_i64().unwrap_or(0);
        let b = ctx.arg(1).as_i64().unwrap_or(0);
        Ok(json!(a + b))
    });
    registry.register_activity("echo", |ctx: ActivityContext| async move { Ok(ctx.arg(0)) });

    registry.register_workflow("add_flow", |ctx, input| {
        let v = ctx.run_activity("add", vec![input["a"].clone(), input["b"].clone()])?;
        Ok(json!({"value": v}))
    });
    registry.register_workflow("timer_flow", |ctx, _input| {
        ctx.sleep(Duration::from_millis(150))?;
        Ok(json!("ok"))
    });
    registry.register_workflow("signal_flow", |ctx, _input| {
        let payload = ctx.wait_signal("go")?;
        Ok(payload)
    });
    registry.register_workflow("cancel_flow", |ctx, _input| {
        ctx.sleep(Duration::from_secs(3600))?;
        ctx.run_activity("echo", vec![json!("x")])?;
        Ok(json!(null))
    });

    registry
}

fn engine_with(registry: Registry) -> Engine<InMemoryStore> {
    Engine::new(Arc::new(InMemoryStore::new()), registry)
}

fn test_worker(engine: &Engine<InMemoryStore>) -> Worker<InMemoryStore> {
    Worker::new(
        engine.clone(),
        WorkerConfig::default()
            .with_tick(Duration::from_millis(10))
            .with_batch(50),
    )
}

/// Tick the worker until the execution is terminal, draining spawned
/// activities between ticks.
async fn run_until_terminal(
    engine: &Engine<InMemoryStore>,
    id: uuid::Uuid,
    max_ticks: u32,
) -> durable::persistence::Execution {
    let worker = test_worker(engine);
    for _ in 0..max_ticks {
        worker.tick().await.expect("tick");
        worker.drain().await;
        let execution = engine.store().get_execution(id).await.expect("execution");
        if execution.status.is_terminal() {
            return execution;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("execution {id} did not reach a terminal status");
}

fn kinds(events: &[HistoryEvent]) -> Vec<EventKind> {
    events.iter().map(|e| e.kind()).collect()
}

fn assert_dense_positions(events: &[HistoryEvent]) {
    for (i, event) in events.iter().enumerate() {
        assert_eq!(event.pos, i as i64, "positions must be dense");
    }
}

#[tokio::test]
async fn linear_two_step_workflow() {
    let engine = engine_with(base_registry());

    let id = engine
        .start_workflow("add_flow", json!({"a": 2, "b": 3}), None)
        .await
        .unwrap();
    let execution = run_until_terminal(&engine, id, 50).await;

    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.result, Some(json!({"value": 5})));

    let (_, events) = engine.store().snapshot(id).await.unwrap();
    assert_eq!(
        kinds(&events),
        vec![
            EventKind::WorkflowStarted,
            EventKind::ActivityScheduled,
            EventKind::ActivityCompleted,
            EventKind::WorkflowCompleted,
        ]
    );
    assert_dense_positions(&events);
}

#[tokio::test]
async fn durable_timer_survives_worker_crash() {
    let engine = engine_with(base_registry());
    let started = Instant::now();

    let id = engine
        .start_workflow("timer_flow", json!({}), None)
        .await
        .unwrap();

    // First worker schedules the timer, then "crashes".
    {
        let worker = test_worker(&engine);
        worker.tick().await.unwrap();
        worker.drain().await;
    }
    let execution = engine.store().get_execution(id).await.unwrap();
    assert!(!execution.status.is_terminal());

    tokio::time::sleep(Duration::from_millis(200)).await;

    // A fresh worker resumes from the store and finishes the run.
    let execution = run_until_terminal(&engine, id, 50).await;
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.result, Some(json!("ok")));
    assert!(started.elapsed() >= Duration::from_millis(150));

    let (_, events) = engine.store().snapshot(id).await.unwrap();
    let timer_scheduled = events
        .iter()
        .filter(|e| e.kind() == EventKind::TimerScheduled)
        .count();
    let timer_fired = events
        .iter()
        .filter(|e| e.kind() == EventKind::TimerFired)
        .count();
    assert_eq!(timer_scheduled, 1, "timer must be scheduled exactly once");
    assert_eq!(timer_fired, 1, "timer must fire exactly once");
}

#[tokio::test]
async fn flaky_activity_retries_to_success() {
    let failures = Arc::new(AtomicU32::new(0));
    let mut registry = base_registry();
    {
        let failures = Arc::clone(&failures);
        registry.register_activity_with(
            "flaky",
            move |_ctx: ActivityContext| {
                let failures = Arc::clone(&failures);
                async move {
                    if failures.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(ActivityFailure::retryable("transient"))
                    } else {
                        Ok(json!("ok"))
                    }
                }
            },
            ActivityOptions::default().with_retry(
                RetryPolicy::exponential()
                    .with_initial_interval(Duration::from_millis(10))
                    .with_max_attempts(3)
                    .with_jitter(0.0),
            ),
        );
    }
    registry.register_workflow("flaky_flow", |ctx, _input| {
        let v = ctx.run_activity("flaky", vec![])?;
        Ok(v)
    });

    let engine = engine_with(registry);
    let id = engine
        .start_workflow("flaky_flow", json!({}), None)
        .await
        .unwrap();
    let execution = run_until_terminal(&engine, id, 100).await;

    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.result, Some(json!("ok")));

    let (_, events) = engine.store().snapshot(id).await.unwrap();
    // Retries append no events; one schedule, one terminal resolution.
    assert_eq!(
        kinds(&events),
        vec![
            EventKind::WorkflowStarted,
            EventKind::ActivityScheduled,
            EventKind::ActivityCompleted,
            EventKind::WorkflowCompleted,
        ]
    );

    let tasks = engine.store().list_tasks(id).await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].attempt, 3);
    assert_eq!(tasks[0].status, TaskStatus::Completed);
}

#[tokio::test]
async fn signal_wait_and_delivery() {
    let engine = engine_with(base_registry());
    let id = engine
        .start_workflow("signal_flow", json!({}), None)
        .await
        .unwrap();

    let worker = test_worker(&engine);
    worker.tick().await.unwrap();

    let (execution, events) = engine.store().snapshot(id).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Pending);
    assert!(
        execution.next_wakeup_at.is_none(),
        "signal waiters park without a wakeup"
    );
    assert!(events.iter().any(|e| e.kind() == EventKind::SignalWait));

    engine
        .signal_workflow(id, "go", json!({"x": 1}))
        .await
        .unwrap();

    let execution = run_until_terminal(&engine, id, 50).await;
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.result, Some(json!({"x": 1})));
}

#[tokio::test]
async fn cancellation_during_sleep() {
    let engine = engine_with(base_registry());
    let id = engine
        .start_workflow("cancel_flow", json!({}), None)
        .await
        .unwrap();

    let worker = test_worker(&engine);
    worker.tick().await.unwrap();

    engine
        .cancel_workflow(id, Some("stop".into()), true)
        .await
        .unwrap();

    let (execution, events) = engine.store().snapshot(id).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Canceled);
    assert!(events.iter().any(|e| e.kind() == EventKind::WorkflowCanceled));

    let tasks = engine.store().list_tasks(id).await.unwrap();
    assert_eq!(tasks.len(), 1, "only the sleep task was ever scheduled");
    assert_eq!(tasks[0].status, TaskStatus::Canceled);

    // Further ticks must not resurrect the execution.
    worker.tick().await.unwrap();
    worker.drain().await;
    let execution = engine.store().get_execution(id).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Canceled);

    // Cancel is idempotent on terminal executions.
    engine.cancel_workflow(id, None, true).await.unwrap();
}

#[tokio::test]
async fn nondeterministic_code_change_fails_execution() {
    let store = Arc::new(InMemoryStore::new());

    // Version one schedules an activity first.
    let mut registry_v1 = Registry::new();
    registry_v1.register_activity("echo", |ctx: ActivityContext| async move { Ok(ctx.arg(0)) });
    registry_v1.register_workflow("wf", |ctx, _input| {
        ctx.run_activity("echo", vec![json!(1)])?;
        let payload = ctx.wait_signal("never")?;
        Ok(payload)
    });
    let engine_v1 = Engine::new(Arc::clone(&store), registry_v1);

    let id = engine_v1.start_workflow("wf", json!({}), None).await.unwrap();
    let worker = test_worker(&engine_v1);
    worker.tick().await.unwrap();
    worker.drain().await;

    let (_, events) = store.snapshot(id).await.unwrap();
    assert!(events.iter().any(|e| e.kind() == EventKind::ActivityScheduled));

    // Version two starts with a timer instead; replaying the recorded
    // history against it must fail, not corrupt state.
    let mut registry_v2 = Registry::new();
    registry_v2.register_activity("echo", |ctx: ActivityContext| async move { Ok(ctx.arg(0)) });
    registry_v2.register_workflow("wf", |ctx, _input| {
        ctx.sleep(Duration::from_secs(1))?;
        Ok(json!(null))
    });
    let engine_v2 = Engine::new(Arc::clone(&store), registry_v2);

    let execution = run_until_terminal(&engine_v2, id, 50).await;
    assert_eq!(execution.status, ExecutionStatus::Failed);
    let error = execution.error.expect("failure recorded");
    assert_eq!(error.kind, ErrorKind::Nondeterminism);
}

#[tokio::test]
async fn step_is_idempotent_without_external_change() {
    let engine = engine_with(base_registry());
    let id = engine
        .start_workflow("signal_flow", json!({}), None)
        .await
        .unwrap();

    engine.step_workflow(id).await.unwrap();
    let (first_execution, first_events) = engine.store().snapshot(id).await.unwrap();

    engine.step_workflow(id).await.unwrap();
    let (second_execution, second_events) = engine.store().snapshot(id).await.unwrap();

    assert_eq!(first_events, second_events);
    assert_eq!(first_execution.status, second_execution.status);
    assert_dense_positions(&second_events);
}

#[tokio::test]
async fn child_workflow_round_trip() {
    let mut registry = base_registry();
    registry.register_workflow("child_flow", |ctx, input| {
        let v = ctx.run_activity("add", vec![input["n"].clone(), json!(1)])?;
        Ok(v)
    });
    registry.register_workflow("parent_flow", |ctx, input| {
        let r = ctx.run_workflow("child_flow", json!({"n": input["n"]}))?;
        Ok(json!({"child": r}))
    });

    let engine = engine_with(registry);
    let id = engine
        .start_workflow("parent_flow", json!({"n": 41}), None)
        .await
        .unwrap();
    let execution = run_until_terminal(&engine, id, 100).await;

    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.result, Some(json!({"child": 42})));

    let (_, events) = engine.store().snapshot(id).await.unwrap();
    assert!(events.iter().any(|e| e.kind() == EventKind::ChildScheduled));
    assert!(events.iter().any(|e| e.kind() == EventKind::ChildCompleted));
}

#[tokio::test]
async fn child_failure_propagates_to_parent() {
    let mut registry = base_registry();
    registry.register_activity("boom", |_ctx: ActivityContext| async move {
        Err(ActivityFailure::non_retryable("exploded"))
    });
    registry.register_workflow("bad_child", |ctx, _input| {
        let v = ctx.run_activity("boom", vec![])?;
        Ok(v)
    });
    registry.register_workflow("parent_of_bad", |ctx, _input| {
        let r = ctx.run_workflow("bad_child", json!({}))?;
        Ok(r)
    });

    let engine = engine_with(registry);
    let id = engine
        .start_workflow("parent_of_bad", json!({}), None)
        .await
        .unwrap();
    let execution = run_until_terminal(&engine, id, 100).await;

    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(execution.error.unwrap().kind, ErrorKind::ActivityFailed);
}

#[tokio::test]
async fn workflow_timeout_is_enforced() {
    let mut registry = base_registry();
    registry.register_workflow_with(
        "slow_flow",
        |ctx, _input| {
            ctx.sleep(Duration::from_secs(3600))?;
            Ok(json!(null))
        },
        WorkflowOptions::default().with_timeout(Duration::from_millis(50)),
    );

    let engine = engine_with(registry);
    let id = engine
        .start_workflow("slow_flow", json!({}), None)
        .await
        .unwrap();
    let execution = run_until_terminal(&engine, id, 100).await;

    assert_eq!(execution.status, ExecutionStatus::TimedOut);
    assert_eq!(execution.error.unwrap().kind, ErrorKind::WorkflowTimedOut);

    let (_, events) = engine.store().snapshot(id).await.unwrap();
    assert!(events
        .iter()
        .any(|e| e.kind() == EventKind::WorkflowTimedOut));

    let tasks = engine.store().list_tasks(id).await.unwrap();
    assert!(tasks.iter().all(|t| t.status == TaskStatus::Canceled));
}

#[tokio::test]
async fn activity_failure_surfaces_through_wait() {
    let mut registry = base_registry();
    registry.register_activity("boom", |_ctx: ActivityContext| async move {
        Err(ActivityFailure::non_retryable("exploded"))
    });
    registry.register_workflow("boom_flow", |ctx, _input| {
        let v = ctx.run_activity("boom", vec![])?;
        Ok(v)
    });

    let engine = engine_with(registry);
    let id = engine
        .start_workflow("boom_flow", json!({}), None)
        .await
        .unwrap();
    run_until_terminal(&engine, id, 50).await;

    let err = engine.wait_workflow(id, None).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::ActivityFailed);
    assert!(err.message.contains("exploded"));
}

#[tokio::test]
async fn unknown_workflow_fails_at_first_step() {
    let engine = engine_with(base_registry());
    let id = engine
        .start_workflow("ghost", json!({}), None)
        .await
        .unwrap();
    let execution = run_until_terminal(&engine, id, 50).await;

    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(execution.error.unwrap().kind, ErrorKind::NotRegistered);
}

#[tokio::test]
async fn unknown_activity_fails_the_workflow() {
    let mut registry = base_registry();
    registry.register_workflow("missing_activity_flow", |ctx, _input| {
        let v = ctx.run_activity("not_a_real_activity", vec![])?;
        Ok(v)
    });

    let engine = engine_with(registry);
    let id = engine
        .start_workflow("missing_activity_flow", json!({}), None)
        .await
        .unwrap();
    let execution = run_until_terminal(&engine, id, 50).await;

    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(execution.error.unwrap().kind, ErrorKind::NotRegistered);
}

#[tokio::test]
async fn signal_to_terminal_execution_is_noop() {
    let engine = engine_with(base_registry());
    let id = engine
        .start_workflow("add_flow", json!({"a": 1, "b": 1}), None)
        .await
        .unwrap();
    run_until_terminal(&engine, id, 50).await;

    let (_, before) = engine.store().snapshot(id).await.unwrap();
    engine.signal_workflow(id, "go", json!({})).await.unwrap();
    let (execution, after) = engine.store().snapshot(id).await.unwrap();

    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(before, after);
}

#[tokio::test]
async fn status_query_reports_pending_work() {
    let engine = engine_with(base_registry());
    let id = engine
        .start_workflow("cancel_flow", json!({}), None)
        .await
        .unwrap();

    let worker = test_worker(&engine);
    worker.tick().await.unwrap();

    let status = engine.query_workflow(id, "status", json!({})).await.unwrap();
    assert_eq!(status["workflow_name"], json!("cancel_flow"));
    assert_eq!(status["status"], json!("pending"));
    assert_eq!(status["pending_activities"], json!(1));
    assert_eq!(status["result"], Value::Null);
}

#[tokio::test]
async fn custom_query_runs_against_snapshot() {
    let mut registry = base_registry();
    registry.register_query("signal_flow", "history", |snapshot, _payload| {
        Ok(json!({"events": snapshot.events.len()}))
    });

    let engine = engine_with(registry);
    let id = engine
        .start_workflow("signal_flow", json!({}), None)
        .await
        .unwrap();
    let worker = test_worker(&engine);
    worker.tick().await.unwrap();

    let result = engine.query_workflow(id, "history", json!({})).await.unwrap();
    assert_eq!(result, json!({"events": 2}));

    let err = engine
        .query_workflow(id, "unknown_query", json!({}))
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::NotRegistered);
}

#[tokio::test]
async fn versioned_workflow_keeps_recorded_branch() {
    let store = Arc::new(InMemoryStore::new());

    let mut registry_v1 = Registry::new();
    registry_v1.register_activity("echo", |ctx: ActivityContext| async move { Ok(ctx.arg(0)) });
    registry_v1.register_workflow("versioned", |ctx, _input| {
        let v = ctx.get_version("change", 1)?;
        let r = if v == 1 {
            ctx.run_activity("echo", vec![json!("v1")])?
        } else {
            ctx.run_activity("echo", vec![json!("v2")])?
        };
        ctx.wait_signal("go")?;
        Ok(r)
    });
    let engine_v1 = Engine::new(Arc::clone(&store), registry_v1);

    let first = engine_v1
        .start_workflow("versioned", json!({}), None)
        .await
        .unwrap();
    let worker = test_worker(&engine_v1);
    for _ in 0..5 {
        worker.tick().await.unwrap();
        worker.drain().await;
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    // Deploy version two of the same workflow over the same store.
    let mut registry_v2 = Registry::new();
    registry_v2.register_activity("echo", |ctx: ActivityContext| async move { Ok(ctx.arg(0)) });
    registry_v2.register_workflow("versioned", |ctx, _input| {
        let v = ctx.get_version("change", 2)?;
        let r = if v == 1 {
            ctx.run_activity("echo", vec![json!("v1")])?
        } else {
            ctx.run_activity("echo", vec![json!("v2")])?
        };
        ctx.wait_signal("go")?;
        Ok(r)
    });
    let engine_v2 = Engine::new(Arc::clone(&store), registry_v2);

    // The in-flight execution keeps its recorded version across the deploy.
    engine_v2.signal_workflow(first, "go", json!({})).await.unwrap();
    let execution = run_until_terminal(&engine_v2, first, 50).await;
    assert_eq!(execution.result, Some(json!("v1")));

    // New executions take the new branch.
    let second = engine_v2
        .start_workflow("versioned", json!({}), None)
        .await
        .unwrap();
    let worker = test_worker(&engine_v2);
    for _ in 0..5 {
        worker.tick().await.unwrap();
        worker.drain().await;
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    engine_v2.signal_workflow(second, "go", json!({})).await.unwrap();
    let execution = run_until_terminal(&engine_v2, second, 50).await;
    assert_eq!(execution.result, Some(json!("v2")));
}

#[tokio::test]
async fn heartbeat_timeout_requeues_then_exhausts() {
    let mut registry = base_registry();
    registry.register_activity_with(
        "silent",
        |_ctx: ActivityContext| async move {
            // Never heartbeats, never finishes within the test window.
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(json!(null))
        },
        ActivityOptions::default()
            .with_heartbeat(Duration::from_millis(20))
            .with_retry(RetryPolicy::no_retry()),
    );
    registry.register_workflow("silent_flow", |ctx, _input| {
        let v = ctx.run_activity("silent", vec![])?;
        Ok(v)
    });

    let engine = engine_with(registry);
    let id = engine
        .start_workflow("silent_flow", json!({}), None)
        .await
        .unwrap();

    let worker = test_worker(&engine);
    // Schedule, then dispatch the activity.
    worker.tick().await.unwrap();
    worker.tick().await.unwrap();
    tokio::time::sleep(Duration::from_millis(40)).await;

    // The sweep observes the missed heartbeat and fails the task; the
    // workflow sees the structured timeout.
    let execution = run_until_terminal(&engine, id, 50).await;
    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(execution.error.unwrap().kind, ErrorKind::ActivityTimedOut);

    let tasks = engine.store().list_tasks(id).await.unwrap();
    assert_eq!(tasks[0].status, TaskStatus::TimedOut);
}
