//! On-disk layout and file lifecycle.
//!
//! Every download keeps its working files next to the destination:
//! part files per segment, a merge temp, a `.part` temp for single streams and
//! the JSON resume state. JSON state is always written through a temp file and
//! a rename so readers never see a torn document. Stale state is archived with
//! a timestamp suffix instead of being overwritten.

mod builder;
mod writer;

pub use builder::StorageWriterBuilder;
pub use writer::StorageWriter;

use serde::Serialize;
use std::ffi::OsString;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Temporary file suffix used by the single-stream engine before atomic rename.
pub const TEMP_SUFFIX: &str = ".part";

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut o: OsString = path.as_os_str().to_owned();
    o.push(suffix);
    PathBuf::from(o)
}

/// Single-stream temp file: `file.iso` -> `file.iso.part`.
pub fn temp_path(final_path: &Path) -> PathBuf {
    with_suffix(final_path, TEMP_SUFFIX)
}

/// Part file for segment `index`: `file.iso` -> `file.iso.part3`.
pub fn part_path(final_path: &Path, index: usize) -> PathBuf {
    with_suffix(final_path, &format!("{}{}", TEMP_SUFFIX, index))
}

/// Temp output of the sequential merge.
pub fn merge_path(final_path: &Path) -> PathBuf {
    with_suffix(final_path, ".merge")
}

/// Resume descriptor of the segmented engine.
pub fn descriptor_path(final_path: &Path) -> PathBuf {
    with_suffix(final_path, ".state")
}

/// Resume record of the single-stream engine.
pub fn single_record_path(final_path: &Path) -> PathBuf {
    with_suffix(final_path, ".resume")
}

/// Current time as Unix seconds.
pub fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Current time as Unix milliseconds.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Serializes `value` as pretty JSON to `path` via `path.tmp` + fsync + rename.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let data = serde_json::to_vec_pretty(value).map_err(io::Error::other)?;
    let tmp = with_suffix(path, ".tmp");
    {
        let mut f = fs::File::create(&tmp)?;
        f.write_all(&data)?;
        f.sync_all()?;
    }
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    Ok(())
}

/// Renames `path` to `path.<unix-ts>.stale` (adding a counter if taken).
/// Returns the archive path, or None if `path` did not exist.
pub fn archive_stale(path: &Path) -> io::Result<Option<PathBuf>> {
    if !path.exists() {
        return Ok(None);
    }
    let ts = unix_timestamp();
    let mut target = with_suffix(path, &format!(".{}.stale", ts));
    let mut n = 1;
    while target.exists() {
        target = with_suffix(path, &format!(".{}-{}.stale", ts, n));
        n += 1;
    }
    fs::rename(path, &target)?;
    Ok(Some(target))
}

/// Removes a file, treating "not found" as success.
pub fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Length of a file on disk, 0 if it does not exist.
pub fn file_len(path: &Path) -> io::Result<u64> {
    match fs::metadata(path) {
        Ok(m) => Ok(m.len()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e),
    }
}
