//! Machine-readable batch report.
//!
//! One item per task with a final status and reason. A task is reported
//! `COMPLETED` only when its artifact was committed to the destination.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::queue::{Task, TaskId, TaskState};
use crate::storage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ItemStatus {
    Completed,
    Failed,
    Cancelled,
    Denied,
    /// Not finished yet (pending, paused, waiting for a retry).
    Incomplete,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemReport {
    pub task_id: TaskId,
    pub url: String,
    pub destination: Option<PathBuf>,
    pub status: ItemStatus,
    pub reason: Option<String>,
    /// Policy code for DENIED items.
    pub code: Option<String>,
    pub sha256: Option<String>,
    pub bytes: Option<u64>,
    pub attempts: u32,
}

impl ItemReport {
    pub fn from_task(task: &Task) -> Self {
        let (status, reason, code) = match task.state {
            TaskState::Completed => (ItemStatus::Completed, None, None),
            TaskState::Failed => match &task.denial {
                Some(d) => (ItemStatus::Denied, Some(d.reason.clone()), Some(d.code.clone())),
                None => (ItemStatus::Failed, task.last_error.clone(), None),
            },
            TaskState::Cancelled => (
                ItemStatus::Cancelled,
                Some(task.last_error.clone().unwrap_or_else(|| "cancelled".to_string())),
                None,
            ),
            other => (ItemStatus::Incomplete, Some(other.to_string()), None),
        };
        Self {
            task_id: task.id,
            url: task.url.clone(),
            destination: Some(task.destination.clone()),
            status,
            reason,
            code,
            sha256: task.outcome.as_ref().map(|o| o.sha256.clone()),
            bytes: task.outcome.as_ref().map(|o| o.total_size),
            attempts: task.attempt,
        }
    }

    /// Item for a request the policy refused at enqueue time.
    pub fn denied(task_id: TaskId, url: &str, code: &str, reason: &str) -> Self {
        Self {
            task_id,
            url: url.to_string(),
            destination: None,
            status: ItemStatus::Denied,
            reason: Some(reason.to_string()),
            code: Some(code.to_string()),
            sha256: None,
            bytes: None,
            attempts: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchReport {
    /// Unix seconds.
    pub generated_at: u64,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub denied: usize,
    pub incomplete: usize,
    pub items: Vec<ItemReport>,
}

impl BatchReport {
    pub fn from_items(mut items: Vec<ItemReport>) -> Self {
        items.sort_by_key(|i| i.task_id);
        let count = |s: ItemStatus| items.iter().filter(|i| i.status == s).count();
        Self {
            generated_at: storage::unix_timestamp(),
            completed: count(ItemStatus::Completed),
            failed: count(ItemStatus::Failed),
            cancelled: count(ItemStatus::Cancelled),
            denied: count(ItemStatus::Denied),
            incomplete: count(ItemStatus::Incomplete),
            items,
        }
    }

    pub fn all_completed(&self) -> bool {
        self.items.iter().all(|i| i.status == ItemStatus::Completed)
    }

    pub fn to_json_pretty(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_and_ordering() {
        let items = vec![
            ItemReport::denied(3, "http://h/c", "HOST_BLOCKED", "blocked"),
            ItemReport {
                task_id: 1,
                url: "http://h/a".into(),
                destination: None,
                status: ItemStatus::Completed,
                reason: None,
                code: None,
                sha256: Some("ab".into()),
                bytes: Some(2),
                attempts: 1,
            },
        ];
        let r = BatchReport::from_items(items);
        assert_eq!(r.items[0].task_id, 1);
        assert_eq!(r.completed, 1);
        assert_eq!(r.denied, 1);
        assert!(!r.all_completed());
        let json = r.to_json_pretty().unwrap();
        assert!(json.contains("\"DENIED\""));
        assert!(json.contains("HOST_BLOCKED"));
    }
}
