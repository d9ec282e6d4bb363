//! # Durable Execution Engine
//!
//! Durable execution of long-running business workflows on top of a
//! relational database. A workflow is an ordinary procedure that calls
//! side-effecting activities and timers; if the host process crashes between
//! any two such calls, the workflow resumes from the next unfinished step
//! with no duplicated side effects and no lost progress.
//!
//! Durability comes from replay: on every resumption the workflow body is
//! re-executed from its start against an append-only event log, and each
//! context operation returns its recorded result instead of re-performing the
//! side effect.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Engine                                │
//! │        (start / wait / signal / cancel / query)              │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │              Scheduler + WorkflowContext                     │
//! │   (replays bodies against history, buffers atomic commits)  │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    ExecutionStore                            │
//! │    (PostgreSQL or in-memory: executions, events, tasks)     │
//! └─────────────────────────────────────────────────────────────┘
//!                              ▲
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Worker                                │
//! │  (leases due tasks, runs activities, steps runnable runs)   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use durable::prelude::*;
//! use serde_json::json;
//!
//! let mut registry = Registry::new();
//! registry.register_workflow("onboard", |ctx, input| {
//!     let user = input["user_id"].clone();
//!     ctx.run_activity("send_welcome_email", vec![user.clone()])?;
//!     ctx.sleep(std::time::Duration::from_secs(3600))?;
//!     let clicked = ctx.run_activity("confirm_clicked", vec![user])?;
//!     Ok(json!({"ok": true, "clicked": clicked}))
//! });
//! registry.register_activity("send_welcome_email", |ctx| async move {
//!     // ... send the email
//!     Ok(json!({"sent": true}))
//! });
//!
//! let engine = Engine::new(Arc::new(InMemoryStore::new()), registry);
//! let worker = Worker::new(engine.clone(), WorkerConfig::default());
//! ```

pub mod activity;
pub mod cli;
pub mod engine;
pub mod error;
pub mod persistence;
pub mod retry;
pub mod worker;
pub mod workflow;

/// Prelude for common imports
pub mod prelude {
    pub use crate::activity::{ActivityContext, ActivityFailure, ActivityResult};
    pub use crate::engine::{
        ActivityOptions, Engine, QuerySnapshot, Registry, StepReport, WorkflowOptions,
    };
    pub use crate::error::{EngineError, ErrorKind};
    pub use crate::persistence::{
        ExecutionStatus, ExecutionStore, InMemoryStore, PostgresStore, StoreError, TaskStatus,
    };
    pub use crate::retry::{BackoffStrategy, RetryPolicy};
    pub use crate::worker::{Worker, WorkerConfig};
    pub use crate::workflow::{EventBody, EventKind, Interrupt, WorkflowContext};
}

// Re-export key types at crate root
pub use activity::{ActivityContext, ActivityFailure, ActivityResult};
pub use engine::{ActivityOptions, Engine, QuerySnapshot, Registry, StepReport, WorkflowOptions};
pub use error::{EngineError, ErrorKind};
pub use persistence::{
    ExecutionStatus, ExecutionStore, InMemoryStore, PostgresStore, StoreError, TaskStatus,
};
pub use retry::{BackoffStrategy, RetryPolicy};
pub use worker::{TickReport, Worker, WorkerConfig};
pub use workflow::{EventBody, EventKind, HistoryEvent, Interrupt, WorkflowContext};
