//! `fetchq remove <id>` – remove a task; optionally delete its partial files with --delete-files.

use anyhow::Result;
use fetchq_core::queue::QueueManager;
use fetchq_core::storage;
use std::path::{Path, PathBuf};

/// Resume state and partial data that may sit next to `dest`.
fn leftovers(dest: &Path) -> Vec<PathBuf> {
    let mut out = vec![
        storage::temp_path(dest),
        storage::single_record_path(dest),
        storage::descriptor_path(dest),
        storage::merge_path(dest),
    ];
    if let Ok(Some(desc)) = fetchq_core::resume::ResumeDescriptor::load(&storage::descriptor_path(dest)) {
        out.extend(desc.segments.into_iter().map(|s| s.part_path));
    }
    out
}

/// Removes the task from the queue. The final file is never deleted.
pub fn run_remove(queue: &QueueManager, id: u64, delete_files: bool) -> Result<()> {
    let paths = if delete_files {
        queue.get(id).map(|t| leftovers(&t.destination)).unwrap_or_default()
    } else {
        Vec::new()
    };

    queue.remove(id)?;
    for path in paths {
        match storage::remove_if_exists(&path) {
            Ok(()) => tracing::debug!(path = %path.display(), "deleted file"),
            Err(e) => tracing::warn!(path = %path.display(), "could not delete file: {}", e),
        }
    }
    println!("Removed task {id}");
    Ok(())
}
