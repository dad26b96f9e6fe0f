//! Task model and state machine.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use crate::downloader::{DownloadOutcome, ModePreference};
use crate::queue::Condition;
use crate::security::RiskLabel;

pub type TaskId = u64;

/// Task lifecycle.
///
/// `PENDING -> STARTING -> DOWNLOADING -> {COMPLETED | FAILED | RETRY_WAIT | CANCELLED}`,
/// `DOWNLOADING -> PAUSED -> PENDING`, `RETRY_WAIT -> PENDING`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Pending,
    Starting,
    Downloading,
    Paused,
    RetryWait,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled
        )
    }

    /// Holds a worker slot.
    pub fn is_active(self) -> bool {
        matches!(self, TaskState::Starting | TaskState::Downloading)
    }

    pub fn can_transition_to(self, next: TaskState) -> bool {
        use TaskState::*;
        match self {
            // FAILED from PENDING: unsatisfiable scheduling condition.
            Pending => matches!(next, Starting | Paused | Cancelled | Failed),
            // FAILED from STARTING: denied by policy before the transfer began.
            Starting => matches!(next, Downloading | Paused | Cancelled | Failed),
            Downloading => matches!(next, Completed | Failed | RetryWait | Cancelled | Paused),
            Paused => matches!(next, Pending | Cancelled),
            RetryWait => matches!(next, Pending | Paused | Cancelled),
            Completed | Failed | Cancelled => false,
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Pending => "PENDING",
            TaskState::Starting => "STARTING",
            TaskState::Downloading => "DOWNLOADING",
            TaskState::Paused => "PAUSED",
            TaskState::RetryWait => "RETRY_WAIT",
            TaskState::Completed => "COMPLETED",
            TaskState::Failed => "FAILED",
            TaskState::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}

/// Structured policy denial kept on the task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Denial {
    pub code: String,
    pub reason: String,
}

/// One requested transfer. Owned by the queue manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub url: String,
    pub destination: PathBuf,
    pub host: Option<String>,
    pub priority: i32,
    /// `priority` plus the aging boost, capped.
    pub effective_priority: i32,
    pub state: TaskState,
    pub mode: ModePreference,
    pub connections_requested: Option<usize>,
    pub attempt: u32,
    pub max_attempts: u32,
    /// Unix millis; set while in RETRY_WAIT.
    pub next_eligible_at: Option<u64>,
    /// Percent complete, 0-100.
    pub progress: f64,
    /// Bytes per second over the current attempt.
    pub speed: f64,
    pub bytes_done: u64,
    pub total_size: Option<u64>,
    pub last_error: Option<String>,
    pub denial: Option<Denial>,
    pub expected_sha256: Option<String>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    pub risk: Option<RiskLabel>,
    #[serde(default)]
    pub quarantined: bool,
    pub outcome: Option<DownloadOutcome>,
    /// Unix millis.
    pub created_at: u64,
    pub updated_at: u64,
    /// Unix millis of the last aging step (or of entering PENDING).
    pub last_aged_at: u64,
}

impl Task {
    /// Moves to `next`, refusing transitions outside the state machine.
    pub(crate) fn transition(&mut self, next: TaskState, now_ms: u64) -> bool {
        if !self.state.can_transition_to(next) {
            tracing::debug!(task_id = self.id, from = %self.state, to = %next, "rejected transition");
            return false;
        }
        tracing::debug!(task_id = self.id, from = %self.state, to = %next, "task transition");
        self.state = next;
        self.updated_at = now_ms;
        if next == TaskState::Pending {
            self.last_aged_at = now_ms;
            self.next_eligible_at = None;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use TaskState::*;

    #[test]
    fn terminal_states_are_final() {
        for t in [Completed, Failed, Cancelled] {
            assert!(t.is_terminal());
            for n in [Pending, Starting, Downloading, Paused, RetryWait, Completed, Failed, Cancelled] {
                assert!(!t.can_transition_to(n));
            }
        }
    }

    #[test]
    fn main_path_is_allowed() {
        assert!(Pending.can_transition_to(Starting));
        assert!(Starting.can_transition_to(Downloading));
        assert!(Downloading.can_transition_to(Completed));
        assert!(Downloading.can_transition_to(RetryWait));
        assert!(RetryWait.can_transition_to(Pending));
        assert!(Downloading.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Pending));
    }

    #[test]
    fn shortcuts_are_rejected() {
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Pending.can_transition_to(Downloading));
        assert!(!Paused.can_transition_to(Downloading));
        assert!(!RetryWait.can_transition_to(Completed));
    }

    #[test]
    fn serde_uses_screaming_case() {
        assert_eq!(serde_json::to_string(&RetryWait).unwrap(), "\"RETRY_WAIT\"");
        assert_eq!(RetryWait.to_string(), "RETRY_WAIT");
    }
}
