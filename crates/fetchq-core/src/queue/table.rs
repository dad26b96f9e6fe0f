//! In-memory task table guarded by the manager's single lock.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};

use crate::progress::ProgressHandle;
use crate::queue::{QueueSnapshot, Task, TaskId};
use crate::report::ItemReport;

/// A finished task (or refused request) mirrored into the history list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Unix millis.
    pub finished_at: u64,
    #[serde(flatten)]
    pub item: ItemReport,
}

#[derive(Debug, Default)]
pub(crate) struct TaskTable {
    pub tasks: BTreeMap<TaskId, Task>,
    pub history: VecDeque<HistoryEntry>,
    pub next_id: TaskId,
    /// Progress of running attempts; not persisted.
    pub live: HashMap<TaskId, ProgressHandle>,
}

impl TaskTable {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            ..Self::default()
        }
    }

    pub fn allocate_id(&mut self) -> TaskId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn push_history(&mut self, entry: HistoryEntry, limit: usize) {
        self.history.push_back(entry);
        while self.history.len() > limit {
            self.history.pop_front();
        }
    }

    /// Mirrors a terminal task into history.
    pub fn record_finished(&mut self, id: TaskId, now_ms: u64, limit: usize) {
        if let Some(task) = self.tasks.get(&id) {
            if task.state.is_terminal() {
                let item = ItemReport::from_task(task);
                self.push_history(
                    HistoryEntry {
                        finished_at: now_ms,
                        item,
                    },
                    limit,
                );
            }
        }
    }

    pub fn to_snapshot(&self, fingerprint: &str, now_ms: u64) -> QueueSnapshot {
        QueueSnapshot {
            schema_version: super::persist::SNAPSHOT_SCHEMA_VERSION,
            config_fingerprint: fingerprint.to_string(),
            saved_at: now_ms,
            next_id: self.next_id,
            tasks: self.tasks.values().cloned().collect(),
            history: self.history.iter().cloned().collect(),
        }
    }

    pub fn from_snapshot(snapshot: QueueSnapshot) -> Self {
        let max_id = snapshot.tasks.iter().map(|t| t.id).max().unwrap_or(0);
        Self {
            next_id: snapshot.next_id.max(max_id + 1),
            tasks: snapshot.tasks.into_iter().map(|t| (t.id, t)).collect(),
            history: snapshot.history.into_iter().collect(),
            live: HashMap::new(),
        }
    }
}
