use crate::queue::{TaskId, TaskState};

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("task {0} not found")]
    NotFound(TaskId),
    #[error("cannot {op} task {id} in state {from}")]
    InvalidTransition {
        id: TaskId,
        from: TaskState,
        op: &'static str,
    },
    #[error("invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("denied by policy [{code}]: {reason}")]
    Denied { code: String, reason: String },
    #[error("unsafe destination: {0}")]
    UnsafePath(String),
    /// The snapshot could not be written; the in-memory change is not durable.
    #[error("queue snapshot write failed: {0}")]
    Persistence(#[source] std::io::Error),
    /// The snapshot on disk is unreadable or has an unknown schema version.
    #[error("queue snapshot invalid: {0}")]
    Snapshot(String),
    #[error("worker failed: {0}")]
    Worker(String),
}
