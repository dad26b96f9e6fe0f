//! Single-stream engine: one GET into `<dest>.part`, optionally continued
//! with `Range: bytes=N-` when the `.resume` record still matches the server.

use std::cell::{Cell, RefCell};
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::Path;
use std::str;
use std::time::{Duration, Instant};

use crate::checksum;
use crate::control::CancelToken;
use crate::error::FetchError;
use crate::http::{parse_status_line, HttpOptions};
use crate::probe::ServerCapability;
use crate::progress::ProgressHandle;
use crate::resume::{self, SingleStreamRecord};
use crate::storage;

use super::{DownloadOutcome, TransferMode};

pub(super) struct SingleRequest<'a> {
    pub url: &'a str,
    pub dest: &'a Path,
    pub cap: &'a ServerCapability,
    pub expected_sha256: Option<&'a str>,
    pub allow_resume: bool,
    pub checkpoint_interval: Duration,
    pub http: &'a HttpOptions,
}

pub(super) fn run(
    req: &SingleRequest<'_>,
    token: &CancelToken,
    progress: &ProgressHandle,
) -> Result<DownloadOutcome, FetchError> {
    let temp = storage::temp_path(req.dest);
    let record_path = storage::single_record_path(req.dest);

    let offset = resume_point(req, &temp, &record_path)?;
    let mut record = SingleStreamRecord::new(req.url, req.cap);
    record.bytes_written = offset;
    record.save(&record_path)?;

    progress.set_total(req.cap.content_length);
    progress.begin(offset, 1);
    if offset > 0 {
        tracing::info!(url = req.url, offset, "resuming single-stream download");
    }

    let mut file = OpenOptions::new().create(true).append(true).open(&temp)?;
    if offset == 0 {
        file.set_len(0)?;
    }

    let status: Cell<Option<u32>> = Cell::new(None);
    let body_started = Cell::new(false);
    let unexpected: Cell<Option<u32>> = Cell::new(None);
    let restarted = Cell::new(false);
    let written = Cell::new(offset);
    let io_error: RefCell<Option<io::Error>> = RefCell::new(None);
    let mut last_checkpoint = Instant::now();

    let mut easy = curl::easy::Easy::new();
    easy.url(req.url)?;
    req.http.apply(&mut easy, &["Accept-Encoding: identity"])?;
    if offset > 0 {
        easy.range(&format!("{}-", offset))?;
    }
    easy.progress(true)?;

    let result = {
        let mut transfer = easy.transfer();
        transfer.header_function(|data| {
            if let Ok(line) = str::from_utf8(data) {
                if let Some(code) = parse_status_line(line) {
                    status.set(Some(code));
                }
            }
            true
        })?;
        transfer.write_function(|data| {
            if token.is_interrupted() {
                return Ok(0);
            }
            if !body_started.get() {
                body_started.set(true);
                let code = status.get().unwrap_or(0);
                let accepted = if offset > 0 {
                    code == 206 || code == 200
                } else {
                    (200..300).contains(&code) && code != 206
                };
                if !accepted {
                    unexpected.set(Some(code));
                    return Ok(0);
                }
                if offset > 0 && code == 200 {
                    // Range ignored: the body starts at byte 0.
                    tracing::warn!(url = req.url, offset, "server ignored range; restarting from zero");
                    if let Err(e) = file.set_len(0) {
                        *io_error.borrow_mut() = Some(e);
                        return Ok(0);
                    }
                    restarted.set(true);
                    written.set(0);
                    progress.begin(0, 1);
                }
            }
            if let Err(e) = file.write_all(data) {
                *io_error.borrow_mut() = Some(e);
                return Ok(0);
            }
            written.set(written.get() + data.len() as u64);
            progress.add_bytes(data.len() as u64);
            if last_checkpoint.elapsed() >= req.checkpoint_interval {
                record.bytes_written = written.get();
                if let Err(e) = record.save(&record_path) {
                    tracing::warn!(path = %record_path.display(), error = %e, "checkpoint failed");
                }
                last_checkpoint = Instant::now();
            }
            Ok(data.len())
        })?;
        transfer.progress_function(|_, _, _, _| !token.is_interrupted())?;
        transfer.perform()
    };

    if let Some(e) = io_error.into_inner() {
        return Err(FetchError::Storage(e));
    }
    file.sync_data()?;
    drop(file);

    record.bytes_written = storage::file_len(&temp)?;
    if let Some(reason) = token.reason() {
        record.save(&record_path)?;
        return Err(FetchError::Interrupted(reason));
    }
    if let Some(code) = unexpected.get() {
        record.save(&record_path)?;
        return Err(if code >= 300 {
            FetchError::Http { status: code }
        } else {
            FetchError::ProtocolViolation(format!("unexpected status {} for single stream", code))
        });
    }
    if let Err(e) = result {
        record.save(&record_path)?;
        return Err(FetchError::from_curl(&e));
    }
    let code = easy.response_code()?;
    if !(200..300).contains(&code) {
        record.save(&record_path)?;
        return Err(FetchError::Http { status: code });
    }

    let on_disk = record.bytes_written;
    if let Some(total) = req.cap.content_length {
        if on_disk < total {
            record.save(&record_path)?;
            return Err(FetchError::Transport(format!(
                "short transfer ({} of {} bytes)",
                on_disk, total
            )));
        }
        if on_disk > total {
            discard(&temp, &record_path);
            return Err(FetchError::Integrity(format!(
                "received {} bytes, expected {}",
                on_disk, total
            )));
        }
    }

    let sha256 = checksum::sha256_path(&temp)?;
    if let Some(expected) = req.expected_sha256 {
        if !checksum::digest_matches(&sha256, expected) {
            discard(&temp, &record_path);
            return Err(FetchError::Integrity(format!(
                "sha256 mismatch: expected {}, got {}",
                expected.trim().to_ascii_lowercase(),
                sha256
            )));
        }
    }
    if let Some(reason) = token.reason() {
        record.save(&record_path)?;
        return Err(FetchError::Interrupted(reason));
    }

    std::fs::rename(&temp, req.dest)?;
    if let Err(e) = storage::remove_if_exists(&record_path) {
        tracing::warn!(path = %record_path.display(), error = %e, "could not remove resume record");
    }

    let resumed_from = if restarted.get() { 0 } else { offset };
    Ok(DownloadOutcome {
        mode: TransferMode::Single,
        connections_used: 1,
        total_size: on_disk,
        bytes_transferred: progress.snapshot().session_bytes,
        resumed_from,
        sha256,
        destination: req.dest.to_path_buf(),
    })
}

/// Byte offset to continue from, or 0 after archiving state that no longer applies.
fn resume_point(
    req: &SingleRequest<'_>,
    temp: &Path,
    record_path: &Path,
) -> Result<u64, FetchError> {
    let record = match SingleStreamRecord::load(record_path) {
        Ok(r) => r,
        Err(FetchError::ResumeStateInvalid(reason)) => {
            tracing::warn!(path = %record_path.display(), %reason, "unreadable resume record");
            archive_record(record_path);
            None
        }
        Err(e) => return Err(e),
    };
    let Some(record) = record else {
        return Ok(0);
    };

    if !req.allow_resume || !req.cap.supports_range {
        tracing::info!(url = req.url, "single-stream resume not possible; restarting from zero");
        archive_record(record_path);
        return Ok(0);
    }
    if let Err(e) = resume::validate_remote(
        req.url,
        &record.url,
        record.total_size,
        record.etag.as_deref(),
        record.last_modified.as_deref(),
        req.cap,
    ) {
        tracing::warn!(url = req.url, error = %e, "resume record rejected; restarting from zero");
        archive_record(record_path);
        return Ok(0);
    }

    let on_disk = storage::file_len(temp)?;
    match record.total_size {
        Some(total) if on_disk > total => {
            tracing::warn!(on_disk, total, "temp file larger than the resource; restarting from zero");
            archive_record(record_path);
            Ok(0)
        }
        Some(total) if total > 0 && on_disk == total => {
            // Complete but never committed. `bytes=total-` is unsatisfiable, so re-fetch the last byte.
            truncate(temp, total - 1)?;
            Ok(total - 1)
        }
        _ => Ok(on_disk),
    }
}

fn truncate(path: &Path, len: u64) -> Result<(), FetchError> {
    OpenOptions::new().write(true).open(path)?.set_len(len)?;
    Ok(())
}

fn archive_record(record_path: &Path) {
    match storage::archive_stale(record_path) {
        Ok(Some(to)) => tracing::info!(to = %to.display(), "archived stale resume record"),
        Ok(None) => {}
        Err(e) => tracing::warn!(path = %record_path.display(), error = %e, "could not archive resume record"),
    }
}

fn discard(temp: &Path, record_path: &Path) {
    for p in [temp, record_path] {
        if let Err(e) = storage::remove_if_exists(p) {
            tracing::warn!(path = %p.display(), error = %e, "could not remove temp state");
        }
    }
}
