//! Activity-side types: failures, execution context, handler signatures.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{EngineError, ErrorKind};
use crate::persistence::store::{ExecutionStore, HeartbeatAck};

/// Error type for activity failures
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActivityFailure {
    /// Error message
    pub message: String,

    /// Failure code for programmatic handling; matched against
    /// `RetryPolicy::non_retryable_codes`.
    pub code: Option<String>,

    /// Whether this failure is retryable. Non-retryable failures resolve the
    /// task immediately regardless of remaining retry budget.
    pub retryable: bool,

    /// Additional details (for debugging)
    pub details: Option<Value>,
}

impl ActivityFailure {
    /// Create a new retryable failure
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            retryable: true,
            details: None,
        }
    }

    /// Create a non-retryable failure
    pub fn non_retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            retryable: false,
            details: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    /// The structured error recorded in the ACTIVITY_FAILED event.
    pub fn into_engine_error(self) -> EngineError {
        let mut err = EngineError::new(ErrorKind::ActivityFailed, self.message);
        if let Some(details) = self.details {
            err = err.with_details(details);
        }
        err
    }
}

impl std::fmt::Display for ActivityFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for ActivityFailure {}

impl From<anyhow::Error> for ActivityFailure {
    fn from(err: anyhow::Error) -> Self {
        Self::retryable(err.to_string())
    }
}

/// Context provided to activities during execution
///
/// Carries the task's arguments and attempt information, and lets
/// long-running activities send heartbeats and observe cancellation.
///
/// # Example
///
/// ```ignore
/// registry.register_activity("export", |ctx: ActivityContext| async move {
///     for chunk in 0..100 {
///         let ack = ctx.heartbeat(Some(json!({"chunk": chunk}))).await?;
///         if ack.cancel_requested {
///             return Err(ActivityFailure::non_retryable("canceled"));
///         }
///         // ... do work
///     }
///     Ok(json!({"chunks": 100}))
/// });
/// ```
pub struct ActivityContext {
    pub execution_id: Uuid,

    /// Task queue handle of this invocation.
    pub task_handle: i64,

    /// Current attempt number (1-based).
    pub attempt: u32,

    /// Positional arguments.
    pub args: Vec<Value>,

    /// Keyword arguments.
    pub kwargs: serde_json::Map<String, Value>,

    pub(crate) worker_id: String,
    pub(crate) lease: std::time::Duration,
    pub(crate) store: Arc<dyn ExecutionStore>,
}

impl ActivityContext {
    /// Positional argument by index.
    pub fn arg(&self, index: usize) -> Value {
        self.args.get(index).cloned().unwrap_or(Value::Null)
    }

    /// Keyword argument by name.
    pub fn kwarg(&self, name: &str) -> Value {
        self.kwargs.get(name).cloned().unwrap_or(Value::Null)
    }

    /// Record a heartbeat, optionally with progress details.
    ///
    /// The returned ack reports whether the heartbeat was accepted (the task
    /// is still running under this worker's lease) and whether cancellation
    /// of the owning execution was requested.
    pub async fn heartbeat(&self, details: Option<Value>) -> Result<HeartbeatAck, EngineError> {
        let extend_until = chrono::Utc::now()
            + chrono::Duration::milliseconds(self.lease.as_millis() as i64);
        let ack = self
            .store
            .record_heartbeat(self.task_handle, &self.worker_id, details, extend_until)
            .await?;
        Ok(ack)
    }
}

impl std::fmt::Debug for ActivityContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivityContext")
            .field("execution_id", &self.execution_id)
            .field("task_handle", &self.task_handle)
            .field("attempt", &self.attempt)
            .finish_non_exhaustive()
    }
}

/// Result of one activity invocation.
pub type ActivityResult = Result<Value, ActivityFailure>;

/// Type-erased activity handler.
pub type ActivityFn = Arc<
    dyn Fn(ActivityContext) -> Pin<Box<dyn Future<Output = ActivityResult> + Send>> + Send + Sync,
>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_failure() {
        let failure = ActivityFailure::retryable("timeout");
        assert!(failure.retryable);
        assert_eq!(failure.to_string(), "timeout");
    }

    #[test]
    fn non_retryable_failure() {
        let failure = ActivityFailure::non_retryable("invalid input");
        assert!(!failure.retryable);
    }

    #[test]
    fn failure_with_code() {
        let failure = ActivityFailure::retryable("connection refused").with_code("CONNECTION");
        assert_eq!(failure.code.as_deref(), Some("CONNECTION"));
    }

    #[test]
    fn conversion_keeps_details() {
        let failure = ActivityFailure::retryable("boom")
            .with_details(serde_json::json!({"host": "db-1"}));
        let err = failure.into_engine_error();
        assert_eq!(err.kind, ErrorKind::ActivityFailed);
        assert_eq!(err.details, Some(serde_json::json!({"host": "db-1"})));
    }

    #[test]
    fn anyhow_conversion_is_retryable() {
        let failure: ActivityFailure = anyhow::anyhow!("transient").into();
        assert!(failure.retryable);
    }
}
