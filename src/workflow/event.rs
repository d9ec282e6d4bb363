//! History events for persistence
//!
//! Events form the append-only log for an execution. They are used for:
//! - Persisting workflow progress
//! - Replaying workflows after recovery
//! - Auditing and debugging
//!
//! Events are immutable once written. Within an execution, `pos` is a dense
//! sequence (`0..n-1`) equal to commit order; during replay the context reads
//! events in `pos` order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::EngineError;

/// The reserved activity name backing durable timers.
pub const SLEEP_ACTIVITY: &str = "__sleep__";

/// Event classification, used for replay matching and the `kind` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    WorkflowStarted,
    WorkflowCompleted,
    WorkflowFailed,
    WorkflowTimedOut,
    WorkflowCanceled,
    ActivityScheduled,
    ActivityCompleted,
    ActivityFailed,
    ActivityTimedOut,
    TimerScheduled,
    TimerFired,
    SignalWait,
    SignalReceived,
    ChildScheduled,
    ChildCompleted,
    ChildFailed,
    VersionMarker,
    PatchMarker,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WorkflowStarted => "workflow_started",
            Self::WorkflowCompleted => "workflow_completed",
            Self::WorkflowFailed => "workflow_failed",
            Self::WorkflowTimedOut => "workflow_timed_out",
            Self::WorkflowCanceled => "workflow_canceled",
            Self::ActivityScheduled => "activity_scheduled",
            Self::ActivityCompleted => "activity_completed",
            Self::ActivityFailed => "activity_failed",
            Self::ActivityTimedOut => "activity_timed_out",
            Self::TimerScheduled => "timer_scheduled",
            Self::TimerFired => "timer_fired",
            Self::SignalWait => "signal_wait",
            Self::SignalReceived => "signal_received",
            Self::ChildScheduled => "child_scheduled",
            Self::ChildCompleted => "child_completed",
            Self::ChildFailed => "child_failed",
            Self::VersionMarker => "version_marker",
            Self::PatchMarker => "patch_marker",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of a history event.
///
/// `scheduled_pos` on resolution events points back at the `pos` of the
/// schedule event they resolve; that pair is the checkpoint pinning one
/// deterministic decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventBody {
    WorkflowStarted {
        input: Value,
    },
    WorkflowCompleted {
        result: Value,
    },
    WorkflowFailed {
        error: EngineError,
    },
    WorkflowTimedOut {
        error: EngineError,
    },
    WorkflowCanceled {
        reason: Option<String>,
    },

    ActivityScheduled {
        name: String,
        args: Vec<Value>,
        kwargs: serde_json::Map<String, Value>,
    },
    ActivityCompleted {
        scheduled_pos: i64,
        result: Value,
    },
    ActivityFailed {
        scheduled_pos: i64,
        error: EngineError,
    },
    ActivityTimedOut {
        scheduled_pos: i64,
        error: EngineError,
    },

    TimerScheduled {
        duration_ms: u64,
        fire_at: DateTime<Utc>,
    },
    TimerFired {
        scheduled_pos: i64,
    },

    SignalWait {
        name: String,
    },
    SignalReceived {
        name: String,
        payload: Value,
    },

    ChildScheduled {
        child_id: Uuid,
        workflow_name: String,
        input: Value,
    },
    ChildCompleted {
        scheduled_pos: i64,
        child_id: Uuid,
        result: Value,
    },
    ChildFailed {
        scheduled_pos: i64,
        child_id: Uuid,
        error: EngineError,
    },

    VersionMarker {
        change_id: String,
        version: i32,
    },
    PatchMarker {
        change_id: String,
        active: bool,
    },
}

impl EventBody {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::WorkflowStarted { .. } => EventKind::WorkflowStarted,
            Self::WorkflowCompleted { .. } => EventKind::WorkflowCompleted,
            Self::WorkflowFailed { .. } => EventKind::WorkflowFailed,
            Self::WorkflowTimedOut { .. } => EventKind::WorkflowTimedOut,
            Self::WorkflowCanceled { .. } => EventKind::WorkflowCanceled,
            Self::ActivityScheduled { .. } => EventKind::ActivityScheduled,
            Self::ActivityCompleted { .. } => EventKind::ActivityCompleted,
            Self::ActivityFailed { .. } => EventKind::ActivityFailed,
            Self::ActivityTimedOut { .. } => EventKind::ActivityTimedOut,
            Self::TimerScheduled { .. } => EventKind::TimerScheduled,
            Self::TimerFired { .. } => EventKind::TimerFired,
            Self::SignalWait { .. } => EventKind::SignalWait,
            Self::SignalReceived { .. } => EventKind::SignalReceived,
            Self::ChildScheduled { .. } => EventKind::ChildScheduled,
            Self::ChildCompleted { .. } => EventKind::ChildCompleted,
            Self::ChildFailed { .. } => EventKind::ChildFailed,
            Self::VersionMarker { .. } => EventKind::VersionMarker,
            Self::PatchMarker { .. } => EventKind::PatchMarker,
        }
    }

    /// Whether this event is part of the deterministic command stream a
    /// workflow body produces, as opposed to events appended externally
    /// (resolutions, signals, terminals).
    pub fn is_command(&self) -> bool {
        matches!(
            self,
            Self::ActivityScheduled { .. }
                | Self::TimerScheduled { .. }
                | Self::SignalWait { .. }
                | Self::ChildScheduled { .. }
                | Self::VersionMarker { .. }
                | Self::PatchMarker { .. }
        )
    }

    /// Whether this is a terminal workflow event.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::WorkflowCompleted { .. }
                | Self::WorkflowFailed { .. }
                | Self::WorkflowTimedOut { .. }
                | Self::WorkflowCanceled { .. }
        )
    }

    /// The schedule position this event resolves, if it is a resolution.
    pub fn resolved_pos(&self) -> Option<i64> {
        match self {
            Self::ActivityCompleted { scheduled_pos, .. }
            | Self::ActivityFailed { scheduled_pos, .. }
            | Self::ActivityTimedOut { scheduled_pos, .. }
            | Self::TimerFired { scheduled_pos }
            | Self::ChildCompleted { scheduled_pos, .. }
            | Self::ChildFailed { scheduled_pos, .. } => Some(*scheduled_pos),
            _ => None,
        }
    }
}

/// A row of the append-only event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEvent {
    /// Monotonically increasing storage id.
    pub id: i64,
    pub execution_id: Uuid,
    /// Dense per-execution sequence; the replay cursor.
    pub pos: i64,
    pub body: EventBody,
    pub created_at: DateTime<Utc>,
}

impl HistoryEvent {
    pub fn kind(&self) -> EventKind {
        self.body.kind()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn event_serialization() {
        let body = EventBody::WorkflowStarted {
            input: json!({"order_id": "123"}),
        };

        let json = serde_json::to_string(&body).unwrap();
        assert!(json.contains("\"type\":\"workflow_started\""));

        let parsed: EventBody = serde_json::from_str(&json).unwrap();
        assert_eq!(body, parsed);
    }

    #[test]
    fn resolution_serialization() {
        let body = EventBody::ActivityCompleted {
            scheduled_pos: 1,
            result: json!({"status": "ok"}),
        };

        let json = serde_json::to_string(&body).unwrap();
        let parsed: EventBody = serde_json::from_str(&json).unwrap();
        assert_eq!(body, parsed);
    }

    #[test]
    fn command_classification() {
        assert!(EventBody::ActivityScheduled {
            name: "send_email".into(),
            args: vec![],
            kwargs: serde_json::Map::new(),
        }
        .is_command());
        assert!(EventBody::SignalWait { name: "go".into() }.is_command());

        assert!(!EventBody::SignalReceived {
            name: "go".into(),
            payload: json!({}),
        }
        .is_command());
        assert!(!EventBody::ActivityCompleted {
            scheduled_pos: 1,
            result: json!(null),
        }
        .is_command());
    }

    #[test]
    fn terminal_classification() {
        assert!(EventBody::WorkflowCompleted { result: json!({}) }.is_terminal());
        assert!(EventBody::WorkflowCanceled { reason: None }.is_terminal());
        assert!(!EventBody::WorkflowStarted { input: json!({}) }.is_terminal());
    }

    #[test]
    fn resolved_pos_extraction() {
        let body = EventBody::TimerFired { scheduled_pos: 4 };
        assert_eq!(body.resolved_pos(), Some(4));
        assert_eq!(EventBody::SignalWait { name: "x".into() }.resolved_pos(), None);
    }

    #[test]
    fn kind_strings_are_stable() {
        assert_eq!(EventKind::WorkflowStarted.as_str(), "workflow_started");
        assert_eq!(EventKind::PatchMarker.as_str(), "patch_marker");
    }
}
