//! Workflow primitives: the event log model and the replay context.

pub mod context;
pub mod event;

pub use context::{Interrupt, PendingWrites, WorkflowContext};
pub use event::{EventBody, EventKind, HistoryEvent, SLEEP_ACTIVITY};
