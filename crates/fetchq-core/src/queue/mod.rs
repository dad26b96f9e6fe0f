//! Persistent download queue.
//!
//! `QueueManager` owns the task table behind one lock. A drive loop ticks the
//! scheduler (retry wake-ups, aging, conditions, admission), hands admitted
//! tasks to async workers that run the blocking engine, and writes an atomic
//! JSON snapshot after every state change so a crash loses at most the
//! in-flight transfer, never a task.

mod condition;
mod error;
mod manager;
mod persist;
mod schedule;
mod table;
mod task;
mod worker;

pub use condition::{evaluate_all, Condition, ConditionStatus, SchedulingContext};
pub use error::QueueError;
pub use manager::{EnqueueRequest, QueueManager, QueueManagerBuilder, RunSummary};
pub use persist::{config_fingerprint, QueueSnapshot, SNAPSHOT_SCHEMA_VERSION};
pub use table::HistoryEntry;
pub use task::{Denial, Task, TaskId, TaskState};
