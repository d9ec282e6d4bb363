//! Registry mapping names to workflow, activity, and query implementations.
//!
//! Process-wide, populated at startup, effectively immutable afterwards.
//! Name collisions are a configuration bug and are fatal at registration.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::activity::{ActivityContext, ActivityFn, ActivityResult};
use crate::error::EngineError;
use crate::persistence::store::{ActivityTask, Execution};
use crate::retry::RetryPolicy;
use crate::workflow::context::{Interrupt, WorkflowContext};
use crate::workflow::event::{HistoryEvent, SLEEP_ACTIVITY};

/// Type-erased workflow body.
pub type WorkflowFn =
    Arc<dyn Fn(&mut WorkflowContext, Value) -> Result<Value, Interrupt> + Send + Sync>;

/// Read-only query handler.
pub type QueryFn = Arc<dyn Fn(&QuerySnapshot, Value) -> Result<Value, EngineError> + Send + Sync>;

/// Consistent read handed to query handlers; never mutated.
#[derive(Debug, Clone)]
pub struct QuerySnapshot {
    pub execution: Execution,
    pub events: Vec<HistoryEvent>,
    pub tasks: Vec<ActivityTask>,
}

/// Registration options for a workflow.
#[derive(Debug, Clone, Default)]
pub struct WorkflowOptions {
    /// Execution deadline measured from start, enforced by the worker sweep.
    pub timeout: Option<Duration>,
}

impl WorkflowOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Registration options for an activity.
#[derive(Debug, Clone)]
pub struct ActivityOptions {
    /// Schedule-to-close deadline.
    pub timeout: Option<Duration>,

    /// Workers must heartbeat within this interval while running.
    pub heartbeat_timeout: Option<Duration>,

    pub retry_policy: RetryPolicy,
}

impl Default for ActivityOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            heartbeat_timeout: None,
            retry_policy: RetryPolicy::default(),
        }
    }
}

impl ActivityOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_heartbeat(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = Some(timeout);
        self
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }
}

/// A registered workflow.
pub struct WorkflowEntry {
    pub func: WorkflowFn,
    pub timeout: Option<Duration>,
}

impl fmt::Debug for WorkflowEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowEntry")
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// A registered activity.
pub struct ActivityEntry {
    pub func: ActivityFn,
    pub timeout: Option<Duration>,
    pub heartbeat_timeout: Option<Duration>,
    pub retry_policy: RetryPolicy,
}

/// Registry of workflow bodies, activity handlers, and query handlers.
#[derive(Default)]
pub struct Registry {
    workflows: HashMap<String, WorkflowEntry>,
    activities: HashMap<String, ActivityEntry>,
    queries: HashMap<(String, String), QueryFn>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a workflow body with default options.
    ///
    /// # Panics
    ///
    /// Panics when the name is already registered.
    pub fn register_workflow<F>(&mut self, name: &str, func: F) -> &mut Self
    where
        F: Fn(&mut WorkflowContext, Value) -> Result<Value, Interrupt> + Send + Sync + 'static,
    {
        self.register_workflow_with(name, func, WorkflowOptions::default())
    }

    /// Register a workflow body with options.
    pub fn register_workflow_with<F>(
        &mut self,
        name: &str,
        func: F,
        options: WorkflowOptions,
    ) -> &mut Self
    where
        F: Fn(&mut WorkflowContext, Value) -> Result<Value, Interrupt> + Send + Sync + 'static,
    {
        if self.workflows.contains_key(name) {
            panic!("workflow '{name}' is already registered");
        }
        self.workflows.insert(
            name.to_string(),
            WorkflowEntry {
                func: Arc::new(func),
                timeout: options.timeout,
            },
        );
        self
    }

    /// Register an activity handler with default options.
    ///
    /// # Panics
    ///
    /// Panics when the name is already registered or reserved.
    pub fn register_activity<F, Fut>(&mut self, name: &str, func: F) -> &mut Self
    where
        F: Fn(ActivityContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ActivityResult> + Send + 'static,
    {
        self.register_activity_with(name, func, ActivityOptions::default())
    }

    /// Register an activity handler with options.
    pub fn register_activity_with<F, Fut>(
        &mut self,
        name: &str,
        func: F,
        options: ActivityOptions,
    ) -> &mut Self
    where
        F: Fn(ActivityContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ActivityResult> + Send + 'static,
    {
        if name == SLEEP_ACTIVITY {
            panic!("activity name '{SLEEP_ACTIVITY}' is reserved for timers");
        }
        if self.activities.contains_key(name) {
            panic!("activity '{name}' is already registered");
        }
        let func: ActivityFn = Arc::new(move |ctx| Box::pin(func(ctx)));
        self.activities.insert(
            name.to_string(),
            ActivityEntry {
                func,
                timeout: options.timeout,
                heartbeat_timeout: options.heartbeat_timeout,
                retry_policy: options.retry_policy,
            },
        );
        self
    }

    /// Register a read-only query handler for a workflow.
    ///
    /// # Panics
    ///
    /// Panics when the `(workflow, query)` pair is already registered.
    pub fn register_query<F>(&mut self, workflow_name: &str, query_name: &str, func: F) -> &mut Self
    where
        F: Fn(&QuerySnapshot, Value) -> Result<Value, EngineError> + Send + Sync + 'static,
    {
        let key = (workflow_name.to_string(), query_name.to_string());
        if self.queries.contains_key(&key) {
            panic!("query '{query_name}' for workflow '{workflow_name}' is already registered");
        }
        self.queries.insert(key, Arc::new(func));
        self
    }

    pub fn workflow(&self, name: &str) -> Option<&WorkflowEntry> {
        self.workflows.get(name)
    }

    pub fn activity(&self, name: &str) -> Option<&ActivityEntry> {
        self.activities.get(name)
    }

    pub fn query(&self, workflow_name: &str, query_name: &str) -> Option<&QueryFn> {
        self.queries
            .get(&(workflow_name.to_string(), query_name.to_string()))
    }

    /// Structured lookup failure for a missing workflow.
    pub fn require_workflow(&self, name: &str) -> Result<&WorkflowEntry, EngineError> {
        self.workflow(name)
            .ok_or_else(|| EngineError::not_registered(format!("unknown workflow '{name}'")))
    }

    pub fn workflow_names(&self) -> impl Iterator<Item = &str> {
        self.workflows.keys().map(|s| s.as_str())
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("workflows", &self.workflows.keys().collect::<Vec<_>>())
            .field("activities", &self.activities.keys().collect::<Vec<_>>())
            .field("queries", &self.queries.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn register_and_lookup() {
        let mut registry = Registry::new();
        registry.register_workflow("wf", |_ctx, _input| Ok(json!(null)));
        registry.register_activity("act", |_ctx| async move { Ok(json!(1)) });
        registry.register_query("wf", "history", |snap, _| Ok(json!(snap.events.len())));

        assert!(registry.workflow("wf").is_some());
        assert!(registry.activity("act").is_some());
        assert!(registry.query("wf", "history").is_some());
        assert!(registry.workflow("missing").is_none());
    }

    #[test]
    fn missing_workflow_is_structured_failure() {
        let registry = Registry::new();
        let err = registry.require_workflow("ghost").unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::NotRegistered);
    }

    #[test]
    #[should_panic(expected = "already registered")]
    fn workflow_collision_is_fatal() {
        let mut registry = Registry::new();
        registry.register_workflow("wf", |_ctx, _input| Ok(json!(null)));
        registry.register_workflow("wf", |_ctx, _input| Ok(json!(null)));
    }

    #[test]
    #[should_panic(expected = "reserved")]
    fn sleep_name_is_reserved() {
        let mut registry = Registry::new();
        registry.register_activity(SLEEP_ACTIVITY, |_ctx| async move { Ok(json!(null)) });
    }

    #[test]
    fn activity_options_flow_through() {
        let mut registry = Registry::new();
        registry.register_activity_with(
            "slow",
            |_ctx| async move { Ok(json!(null)) },
            ActivityOptions::default()
                .with_timeout(Duration::from_secs(30))
                .with_heartbeat(Duration::from_secs(5)),
        );

        let entry = registry.activity("slow").unwrap();
        assert_eq!(entry.timeout, Some(Duration::from_secs(30)));
        assert_eq!(entry.heartbeat_timeout, Some(Duration::from_secs(5)));
    }
}
