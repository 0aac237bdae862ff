//! Prioritized asynchronous follow-up work.
//!
//! Non-critical work (logging, business sync, cleanup) is enqueued on a
//! strict-priority queue and executed by a fixed set of consumer workers.
//! The queue is in-memory and best-effort: nothing survives a restart.

mod heap;
mod manager;
mod task;

pub use heap::PriorityQueue;
pub use manager::{AsyncManagerStats, AsyncTaskManager, NoopExecutor, TaskExecutor};
pub use task::{
    AsyncTask, LogLevel, TaskCallback, TaskKind, TaskResult, PRIORITY_BUSINESS, PRIORITY_CLEANUP,
    PRIORITY_CRITICAL, PRIORITY_LOG,
};
