//! The replay core: the per-step context passed to workflow bodies.
//!
//! Every operation follows the same two-phase rule. Replay phase: if the next
//! recorded command event matches the operation, consume it and return the
//! recorded outcome. Record phase: buffer the schedule event and its side
//! effect, then yield back to the scheduler via [`Interrupt::Pause`].
//!
//! The context never touches the store; all writes are buffered and committed
//! by the scheduler as one atomic batch when the body yields.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::engine::registry::Registry;
use crate::error::EngineError;
use crate::persistence::store::{Execution, NewExecution, NewTask, ParentLink};
use crate::retry::RetryPolicy;
use crate::workflow::event::{EventBody, EventKind, HistoryEvent, SLEEP_ACTIVITY};

/// Control-flow sentinel raised by context operations.
///
/// Propagate it with `?`; it unwinds the workflow body back to the scheduler
/// without running further code.
#[derive(Debug, Clone, PartialEq)]
pub enum Interrupt {
    /// Work was scheduled or is still pending; the execution parks until a
    /// resolution event arrives.
    Pause,

    /// Structured failure; becomes the WORKFLOW_FAILED terminal event unless
    /// the body catches it.
    Failed(EngineError),
}

impl From<EngineError> for Interrupt {
    fn from(err: EngineError) -> Self {
        Self::Failed(err)
    }
}

/// Writes buffered during one step, handed to the scheduler at yield.
#[derive(Debug, Default)]
pub struct PendingWrites {
    pub events: Vec<EventBody>,
    pub tasks: Vec<NewTask>,
    pub children: Vec<NewExecution>,
}

/// The only legal side-effect surface inside a workflow body.
pub struct WorkflowContext {
    execution: Execution,
    history: Vec<HistoryEvent>,
    /// Index of the next history entry the command cursor has not passed.
    cursor: usize,
    /// Position the next buffered event will take.
    next_pos: i64,
    pending: PendingWrites,
    /// Positions of SIGNAL_RECEIVED events already claimed by a wait.
    consumed_signals: HashSet<i64>,
    registry: Arc<Registry>,
    /// Wall clock captured at step start; only consulted in record phases,
    /// which commit exactly once.
    now: DateTime<Utc>,
}

impl WorkflowContext {
    pub(crate) fn new(
        execution: Execution,
        history: Vec<HistoryEvent>,
        registry: Arc<Registry>,
        now: DateTime<Utc>,
    ) -> Self {
        let next_pos = history.len() as i64;
        Self {
            execution,
            history,
            cursor: 0,
            next_pos,
            pending: PendingWrites::default(),
            consumed_signals: HashSet::new(),
            registry,
            now,
        }
    }

    /// Id of the execution being replayed.
    pub fn execution_id(&self) -> Uuid {
        self.execution.id
    }

    pub(crate) fn into_pending(self) -> PendingWrites {
        self.pending
    }

    fn bump_pos(&mut self) -> i64 {
        let pos = self.next_pos;
        self.next_pos += 1;
        pos
    }

    /// Advance the cursor to the next command event and consume it, verifying
    /// the kind. `None` means history is exhausted: the operation is in its
    /// record phase.
    fn replay_command(&mut self, expected: EventKind) -> Result<Option<HistoryEvent>, Interrupt> {
        while self.cursor < self.history.len() && !self.history[self.cursor].body.is_command() {
            self.cursor += 1;
        }
        if self.cursor >= self.history.len() {
            return Ok(None);
        }
        let event = self.history[self.cursor].clone();
        if event.kind() != expected {
            return Err(Interrupt::Failed(EngineError::nondeterminism(format!(
                "replay expected {} at pos {}, history has {}",
                expected,
                event.pos,
                event.kind()
            ))));
        }
        self.cursor += 1;
        Ok(Some(event))
    }

    /// Find the resolution event paired with a schedule position.
    fn find_resolution(&self, handle: i64) -> Option<&HistoryEvent> {
        self.history
            .iter()
            .find(|e| e.body.resolved_pos() == Some(handle))
    }

    // =========================================================================
    // Activities
    // =========================================================================

    /// Schedule an activity and wait for its result.
    ///
    /// Returns the recorded result on replay; re-raises the recorded failure
    /// for FAILED / TIMED_OUT resolutions.
    pub fn run_activity(&mut self, name: &str, args: Vec<Value>) -> Result<Value, Interrupt> {
        let handle = self.start_activity(name, args)?;
        self.wait_activity(handle)
    }

    /// Schedule an activity without waiting; the returned handle is the
    /// position of the schedule event and is stable across replays.
    pub fn start_activity(&mut self, name: &str, args: Vec<Value>) -> Result<i64, Interrupt> {
        self.start_activity_with(name, args, serde_json::Map::new())
    }

    /// Schedule an activity with keyword arguments.
    pub fn start_activity_with(
        &mut self,
        name: &str,
        args: Vec<Value>,
        kwargs: serde_json::Map<String, Value>,
    ) -> Result<i64, Interrupt> {
        if let Some(event) = self.replay_command(EventKind::ActivityScheduled)? {
            if let EventBody::ActivityScheduled { name: recorded, .. } = &event.body {
                if recorded != name {
                    return Err(Interrupt::Failed(EngineError::nondeterminism(format!(
                        "replay expected activity '{}' at pos {}, history has '{}'",
                        name, event.pos, recorded
                    ))));
                }
            }
            return Ok(event.pos);
        }

        let pos = self.bump_pos();
        let (retry_policy, expires_at, heartbeat_timeout) = match self.registry.activity(name) {
            Some(entry) => (
                entry.retry_policy.clone(),
                entry.timeout.map(|t| self.now + to_chrono(t)),
                entry.heartbeat_timeout,
            ),
            // Unknown activities are scheduled anyway and fail at dispatch.
            None => (RetryPolicy::no_retry(), None, None),
        };

        self.pending.events.push(EventBody::ActivityScheduled {
            name: name.to_string(),
            args: args.clone(),
            kwargs: kwargs.clone(),
        });
        self.pending.tasks.push(NewTask {
            name: name.to_string(),
            args,
            kwargs,
            after_time: self.now,
            expires_at,
            heartbeat_timeout,
            retry_policy,
            scheduled_event_pos: pos,
        });
        Ok(pos)
    }

    /// Wait for the terminal event paired with an activity handle.
    pub fn wait_activity(&mut self, handle: i64) -> Result<Value, Interrupt> {
        match self.find_resolution(handle).map(|e| e.body.clone()) {
            Some(EventBody::ActivityCompleted { result, .. }) => Ok(result),
            Some(EventBody::TimerFired { .. }) => Ok(Value::Null),
            Some(
                EventBody::ActivityFailed { error, .. }
                | EventBody::ActivityTimedOut { error, .. },
            ) => Err(Interrupt::Failed(error)),
            _ => Err(Interrupt::Pause),
        }
    }

    // =========================================================================
    // Timers
    // =========================================================================

    /// Durable sleep, modeled as a reserved `__sleep__` task with an
    /// earliest-run time.
    pub fn sleep(&mut self, duration: Duration) -> Result<(), Interrupt> {
        if let Some(event) = self.replay_command(EventKind::TimerScheduled)? {
            return self.wait_activity(event.pos).map(|_| ());
        }

        let pos = self.bump_pos();
        let fire_at = self.now + to_chrono(duration);
        self.pending.events.push(EventBody::TimerScheduled {
            duration_ms: duration.as_millis() as u64,
            fire_at,
        });
        self.pending.tasks.push(NewTask {
            name: SLEEP_ACTIVITY.to_string(),
            args: vec![Value::from(duration.as_secs_f64())],
            kwargs: serde_json::Map::new(),
            after_time: fire_at,
            expires_at: None,
            heartbeat_timeout: None,
            retry_policy: RetryPolicy::no_retry(),
            scheduled_event_pos: pos,
        });
        Err(Interrupt::Pause)
    }

    // =========================================================================
    // Signals
    // =========================================================================

    /// Park until a matching SIGNAL_RECEIVED exists at or after this wait's
    /// position. Each wait claims a distinct signal event, in arrival order.
    pub fn wait_signal(&mut self, name: &str) -> Result<Value, Interrupt> {
        if let Some(wait) = self.replay_command(EventKind::SignalWait)? {
            if let EventBody::SignalWait { name: recorded } = &wait.body {
                if recorded != name {
                    return Err(Interrupt::Failed(EngineError::nondeterminism(format!(
                        "replay expected wait for signal '{}' at pos {}, history has '{}'",
                        name, wait.pos, recorded
                    ))));
                }
            }
            let claimed = self.history.iter().find_map(|e| {
                if e.pos < wait.pos || self.consumed_signals.contains(&e.pos) {
                    return None;
                }
                match &e.body {
                    EventBody::SignalReceived { name: n, payload } if n == name => {
                        Some((e.pos, payload.clone()))
                    }
                    _ => None,
                }
            });
            return match claimed {
                Some((pos, payload)) => {
                    self.consumed_signals.insert(pos);
                    Ok(payload)
                }
                None => Err(Interrupt::Pause),
            };
        }

        self.bump_pos();
        self.pending.events.push(EventBody::SignalWait {
            name: name.to_string(),
        });
        Err(Interrupt::Pause)
    }

    // =========================================================================
    // Child workflows
    // =========================================================================

    /// Start a child workflow and wait for its result.
    pub fn run_workflow(&mut self, name: &str, input: Value) -> Result<Value, Interrupt> {
        let handle = self.start_workflow(name, input)?;
        self.wait_workflow(handle)
    }

    /// Start a child workflow without waiting. The child is a fresh execution
    /// with `parent_id` set; its id is fixed by the CHILD_SCHEDULED event.
    pub fn start_workflow(&mut self, name: &str, input: Value) -> Result<i64, Interrupt> {
        if let Some(event) = self.replay_command(EventKind::ChildScheduled)? {
            if let EventBody::ChildScheduled { workflow_name, .. } = &event.body {
                if workflow_name != name {
                    return Err(Interrupt::Failed(EngineError::nondeterminism(format!(
                        "replay expected child workflow '{}' at pos {}, history has '{}'",
                        name, event.pos, workflow_name
                    ))));
                }
            }
            return Ok(event.pos);
        }

        let pos = self.bump_pos();
        let child_id = Uuid::now_v7();
        let timeout_at = self
            .registry
            .workflow(name)
            .and_then(|w| w.timeout)
            .map(|t| self.now + to_chrono(t));

        self.pending.events.push(EventBody::ChildScheduled {
            child_id,
            workflow_name: name.to_string(),
            input: input.clone(),
        });
        self.pending.children.push(NewExecution {
            id: child_id,
            workflow_name: name.to_string(),
            input,
            timeout_at,
            parent: Some(ParentLink {
                execution_id: self.execution.id,
                handle: pos,
            }),
        });
        Ok(pos)
    }

    /// Wait for the terminal event paired with a child workflow handle.
    pub fn wait_workflow(&mut self, handle: i64) -> Result<Value, Interrupt> {
        match self.find_resolution(handle).map(|e| e.body.clone()) {
            Some(EventBody::ChildCompleted { result, .. }) => Ok(result),
            Some(EventBody::ChildFailed { error, .. }) => Err(Interrupt::Failed(error)),
            _ => Err(Interrupt::Pause),
        }
    }

    // =========================================================================
    // Versioning
    // =========================================================================

    /// Branch on code evolution while preserving determinism for in-flight
    /// executions: the first call records `version`, replays return the
    /// recorded value.
    pub fn get_version(&mut self, change_id: &str, version: i32) -> Result<i32, Interrupt> {
        if let Some(event) = self.replay_command(EventKind::VersionMarker)? {
            if let EventBody::VersionMarker {
                change_id: recorded,
                version: recorded_version,
            } = &event.body
            {
                if recorded != change_id {
                    return Err(Interrupt::Failed(EngineError::nondeterminism(format!(
                        "replay expected version marker '{}' at pos {}, history has '{}'",
                        change_id, event.pos, recorded
                    ))));
                }
                return Ok(*recorded_version);
            }
        }

        self.bump_pos();
        self.pending.events.push(EventBody::VersionMarker {
            change_id: change_id.to_string(),
            version,
        });
        Ok(version)
    }

    /// Patch toggle: records `true` on first execution, replays return the
    /// recorded boolean.
    pub fn patched(&mut self, change_id: &str) -> Result<bool, Interrupt> {
        self.record_patch(change_id, true)
    }

    /// Record `false` so executions started after the deprecation take the
    /// non-patched branch.
    pub fn deprecate_patch(&mut self, change_id: &str) -> Result<(), Interrupt> {
        self.record_patch(change_id, false).map(|_| ())
    }

    fn record_patch(&mut self, change_id: &str, active: bool) -> Result<bool, Interrupt> {
        if let Some(event) = self.replay_command(EventKind::PatchMarker)? {
            if let EventBody::PatchMarker {
                change_id: recorded,
                active: recorded_active,
            } = &event.body
            {
                if recorded != change_id {
                    return Err(Interrupt::Failed(EngineError::nondeterminism(format!(
                        "replay expected patch marker '{}' at pos {}, history has '{}'",
                        change_id, event.pos, recorded
                    ))));
                }
                return Ok(*recorded_active);
            }
        }

        self.bump_pos();
        self.pending.events.push(EventBody::PatchMarker {
            change_id: change_id.to_string(),
            active,
        });
        Ok(active)
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(duration.as_millis() as i64)
}
