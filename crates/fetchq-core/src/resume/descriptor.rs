use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::FetchError;
use crate::probe::ServerCapability;
use crate::segmenter::Segment;
use crate::storage;

/// Current on-disk schema of resume state files.
pub const SCHEMA_VERSION: u32 = 1;

/// Persisted state of one segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentRecord {
    pub id: usize,
    pub start: u64,
    /// Inclusive.
    pub end: u64,
    pub part_path: PathBuf,
    pub bytes_written: u64,
    pub completed: bool,
}

impl SegmentRecord {
    pub fn segment(&self) -> Segment {
        Segment {
            index: self.id,
            start: self.start,
            end: self.end,
        }
    }
}

/// Segmented-download resume state, stored next to the destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeDescriptor {
    pub schema_version: u32,
    pub url: String,
    pub total_size: u64,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub segments: Vec<SegmentRecord>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl ResumeDescriptor {
    /// Fresh descriptor for a new plan; part files are laid out next to `dest`.
    pub fn new(
        url: &str,
        total_size: u64,
        cap: &ServerCapability,
        plan: &[Segment],
        dest: &Path,
    ) -> Self {
        let now = storage::unix_timestamp();
        Self {
            schema_version: SCHEMA_VERSION,
            url: url.to_string(),
            total_size,
            etag: cap.etag.clone(),
            last_modified: cap.last_modified.clone(),
            segments: plan
                .iter()
                .map(|s| SegmentRecord {
                    id: s.index,
                    start: s.start,
                    end: s.end,
                    part_path: storage::part_path(dest, s.index),
                    bytes_written: 0,
                    completed: false,
                })
                .collect(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn load(path: &Path) -> Result<Option<Self>, FetchError> {
        super::load_versioned(path, |d: &Self| d.schema_version)
    }

    /// Atomically writes the descriptor, bumping `updated_at`.
    pub fn save(&mut self, path: &Path) -> Result<(), FetchError> {
        self.updated_at = storage::unix_timestamp();
        storage::write_json_atomic(path, self)?;
        Ok(())
    }

    pub fn bytes_written(&self) -> u64 {
        self.segments.iter().map(|s| s.bytes_written).sum()
    }

    pub fn record_progress(&mut self, id: usize, bytes_written: u64, completed: bool) {
        if let Some(rec) = self.segments.iter_mut().find(|s| s.id == id) {
            rec.bytes_written = bytes_written;
            rec.completed = completed;
        }
    }
}
