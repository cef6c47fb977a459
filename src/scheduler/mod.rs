//! Task scheduler — prioritized execution over a fixed worker pool.
//!
//! Core components:
//! - `task` — Task types, priorities, the executor seam and task lifecycle
//! - `queue` — Five FIFO queues with eviction and backpressure
//! - `worker` — Worker slots (Idle ↔ Busy) and per-worker counters
//! - `history` — Bounded record of finished attempts
//! - `engine` — Dispatch, completion, retry and watchdog reclamation

pub mod engine;
pub mod history;
pub mod queue;
pub mod task;
pub mod worker;

pub use engine::{Lifecycle, Scheduler};
pub use history::CompletedTaskRecord;
pub use task::{
    Priority, TaskContext, TaskExecutor, TaskHandle, TaskId, TaskOutcome, TaskPayload, TaskSpec,
    TaskState,
};
pub use worker::{WorkerSlot, WorkerStatus};
