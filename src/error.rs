//! Structured error taxonomy shared by history payloads, store rows, and the
//! public API.

use serde::{Deserialize, Serialize};

/// Machine-readable failure classification.
///
/// Every failure the engine persists or surfaces carries one of these kinds;
/// the set is closed so callers can match on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Name lookup failed at step or dispatch time.
    NotRegistered,

    /// Payload was not JSON-round-trippable.
    Serialization,

    /// Activity body raised after its retry budget was exhausted.
    ActivityFailed,

    /// Schedule-to-close or heartbeat deadline exceeded.
    ActivityTimedOut,

    /// Execution-level timeout.
    WorkflowTimedOut,

    /// User-initiated cancellation.
    Canceled,

    /// Replay observed history that does not match the workflow body.
    Nondeterminism,

    /// Unhandled engine error.
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::NotRegistered => "NOT_REGISTERED",
            Self::Serialization => "SERIALIZATION",
            Self::ActivityFailed => "ACTIVITY_FAILED",
            Self::ActivityTimedOut => "ACTIVITY_TIMED_OUT",
            Self::WorkflowTimedOut => "WORKFLOW_TIMED_OUT",
            Self::Canceled => "CANCELED",
            Self::Nondeterminism => "NONDETERMINISM",
            Self::Internal => "INTERNAL",
        };
        f.write_str(s)
    }
}

/// Structured engine failure: `{kind, message, details?}`.
///
/// This is what `WORKFLOW_FAILED` / `ACTIVITY_FAILED` event payloads carry,
/// what `Execution::error` stores, and what `wait_workflow` returns for
/// non-completed terminals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl EngineError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
        }
    }

    pub fn not_registered(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotRegistered, message)
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Serialization, message)
    }

    pub fn activity_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ActivityFailed, message)
    }

    pub fn activity_timed_out(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ActivityTimedOut, message)
    }

    pub fn workflow_timed_out(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::WorkflowTimedOut, message)
    }

    pub fn canceled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Canceled, message)
    }

    pub fn nondeterminism(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Nondeterminism, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    /// Attach a detail object.
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for EngineError {}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_kind() {
        let err = EngineError::activity_timed_out("heartbeat deadline exceeded");
        assert_eq!(err.to_string(), "ACTIVITY_TIMED_OUT: heartbeat deadline exceeded");
    }

    #[test]
    fn round_trips_through_json() {
        let err = EngineError::activity_failed("boom")
            .with_details(serde_json::json!({"attempt": 3}));
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("\"ACTIVITY_FAILED\""));
        let parsed: EngineError = serde_json::from_str(&json).unwrap();
        assert_eq!(err, parsed);
    }

    #[test]
    fn details_omitted_when_absent() {
        let err = EngineError::canceled("stop");
        let json = serde_json::to_string(&err).unwrap();
        assert!(!json.contains("details"));
    }
}
