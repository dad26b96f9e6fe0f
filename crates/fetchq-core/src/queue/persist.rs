//! Queue snapshot: versioned JSON of the whole task table, written atomically
//! after every state change, plus the recovery rules applied on load.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::checksum;
use crate::config::QueueConfig;
use crate::queue::{HistoryEntry, QueueError, Task, TaskId, TaskState};
use crate::storage;

pub const SNAPSHOT_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub schema_version: u32,
    pub config_fingerprint: String,
    /// Unix millis.
    pub saved_at: u64,
    pub next_id: TaskId,
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
}

impl QueueSnapshot {
    /// `Ok(None)` when no snapshot exists. Unknown schema versions are errors.
    pub fn load(path: &Path) -> Result<Option<Self>, QueueError> {
        let data = match fs::read(path) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(QueueError::Snapshot(format!("{}: {}", path.display(), e))),
        };
        let snapshot: Self = serde_json::from_slice(&data)
            .map_err(|e| QueueError::Snapshot(format!("{}: {}", path.display(), e)))?;
        if snapshot.schema_version != SNAPSHOT_SCHEMA_VERSION {
            return Err(QueueError::Snapshot(format!(
                "{}: schema version {} (expected {})",
                path.display(),
                snapshot.schema_version,
                SNAPSHOT_SCHEMA_VERSION
            )));
        }
        Ok(Some(snapshot))
    }

    pub fn save(&self, path: &Path) -> Result<(), QueueError> {
        storage::write_json_atomic(path, self).map_err(QueueError::Persistence)
    }

    /// Applies crash-recovery rules; returns how many tasks were rewritten.
    ///
    /// STARTING/DOWNLOADING become PAUSED (never resumed without a fresh probe);
    /// RETRY_WAIT becomes PENDING with its backoff deadline cleared.
    pub fn recover(&mut self, now_ms: u64) -> usize {
        let mut rewritten = 0;
        for task in &mut self.tasks {
            let next = match task.state {
                TaskState::Starting | TaskState::Downloading => TaskState::Paused,
                TaskState::RetryWait => TaskState::Pending,
                _ => continue,
            };
            tracing::info!(task_id = task.id, from = %task.state, to = %next, "recovered task state");
            task.state = next;
            task.next_eligible_at = None;
            task.speed = 0.0;
            task.updated_at = now_ms;
            if next == TaskState::Pending {
                task.last_aged_at = now_ms;
            }
            rewritten += 1;
        }
        rewritten
    }
}

/// SHA-256 of the serialized `[queue]` section.
pub fn config_fingerprint(cfg: &QueueConfig) -> String {
    match toml::to_string(cfg) {
        Ok(s) => checksum::sha256_bytes(s.as_bytes()),
        Err(e) => {
            tracing::debug!(error = %e, "could not serialize queue config for fingerprint");
            String::new()
        }
    }
}
