//! Cooperative interruption for running downloads.
//!
//! Each download attempt carries a `CancelToken`. Engines poll it at chunk
//! boundaries; the queue (or a CLI signal handler) requests pause, cancel or
//! timeout through `TaskControl`, which maps task ids to live tokens.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, RwLock};

use crate::error::{FetchError, InterruptReason};

const NONE: u8 = 0;

fn encode(reason: InterruptReason) -> u8 {
    match reason {
        InterruptReason::Paused => 1,
        InterruptReason::TimedOut => 2,
        InterruptReason::Cancelled => 3,
    }
}

fn decode(v: u8) -> Option<InterruptReason> {
    match v {
        1 => Some(InterruptReason::Paused),
        2 => Some(InterruptReason::TimedOut),
        3 => Some(InterruptReason::Cancelled),
        _ => None,
    }
}

/// Shared interruption flag for one download attempt. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    state: Arc<AtomicU8>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request an interruption. A stronger reason replaces a weaker one, never the reverse.
    pub fn request(&self, reason: InterruptReason) {
        self.state.fetch_max(encode(reason), Ordering::AcqRel);
    }

    pub fn cancel(&self) {
        self.request(InterruptReason::Cancelled);
    }

    pub fn reason(&self) -> Option<InterruptReason> {
        decode(self.state.load(Ordering::Acquire))
    }

    pub fn is_interrupted(&self) -> bool {
        self.state.load(Ordering::Acquire) != NONE
    }

    /// Err(Interrupted) once any interruption was requested.
    pub fn check(&self) -> Result<(), FetchError> {
        match self.reason() {
            Some(r) => Err(FetchError::Interrupted(r)),
            None => Ok(()),
        }
    }
}

/// Registry of task id -> live cancel token.
#[derive(Debug, Default)]
pub struct TaskControl {
    tasks: RwLock<HashMap<u64, CancelToken>>,
}

impl TaskControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a starting task; returns the token to pass to the download.
    pub fn register(&self, task_id: u64) -> CancelToken {
        let token = CancelToken::new();
        self.tasks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(task_id, token.clone());
        token
    }

    /// Unregister a task (call when its attempt finishes, success or failure).
    pub fn unregister(&self, task_id: u64) {
        self.tasks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&task_id);
    }

    /// Signal a running task. Returns false when the task has no live attempt.
    pub fn request(&self, task_id: u64, reason: InterruptReason) -> bool {
        match self
            .tasks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&task_id)
        {
            Some(token) => {
                token.request(reason);
                true
            }
            None => false,
        }
    }

    /// Signal every running task (used on shutdown).
    pub fn request_all(&self, reason: InterruptReason) {
        for token in self
            .tasks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
        {
            token.request(reason);
        }
    }

    pub fn active_count(&self) -> usize {
        self.tasks.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}
