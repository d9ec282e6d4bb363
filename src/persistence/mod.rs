//! Persistence layer: the store contract and its implementations.

pub mod memory;
pub mod postgres;
pub mod store;

pub use memory::InMemoryStore;
pub use postgres::PostgresStore;
pub use store::{
    ActivityTask, Execution, ExecutionStatus, ExecutionStore, FinalizeOutcome, HeartbeatAck,
    NewExecution, NewTask, ParentLink, StepApplied, StepCommit, StepOutcome, StoreError,
    TaskResolution, TaskStatus, TimeoutCause,
};
