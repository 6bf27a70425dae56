//! Task store, workers and the operations that tie them together.

pub mod coordinator;
pub mod heartbeat;
pub mod store;
#[cfg(feature = "sqlite")]
pub mod sqlite_store;
pub mod worker;

pub use coordinator::Coordinator;
pub use heartbeat::HeartbeatEmitter;
pub use store::{
    truncate_error, Expansion, FailOutcome, GracePeriods, ReclaimReport, SkipReason, TaskError,
    TaskStore, MAX_ERROR_LEN,
};
#[cfg(feature = "sqlite")]
pub use sqlite_store::SqliteTaskStore;
pub use worker::{Worker, WorkerBuilder};
