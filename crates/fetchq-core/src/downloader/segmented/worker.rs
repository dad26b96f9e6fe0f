//! One segment: HTTP Range GET appended to the segment's part file.

use std::cell::{Cell, RefCell};
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::str;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::control::CancelToken;
use crate::error::FetchError;
use crate::http::{parse_status_line, HttpOptions};
use crate::progress::ProgressHandle;
use crate::resume::SegmentRecord;
use crate::storage;

/// Shared state of a segment between its worker thread and the coordinator.
#[derive(Debug)]
pub(super) struct SegmentSlot {
    /// Bytes present in the part file.
    written: AtomicU64,
    /// Unix millis of the last received chunk.
    last_activity: AtomicU64,
    /// Set by the coordinator to stop this worker (stall or shutdown).
    abort: AtomicBool,
}

impl SegmentSlot {
    pub(super) fn new(on_disk: u64) -> Self {
        Self {
            written: AtomicU64::new(on_disk),
            last_activity: AtomicU64::new(storage::unix_millis()),
            abort: AtomicBool::new(false),
        }
    }

    /// Prepares the slot for a fresh attempt starting at `on_disk`.
    pub(super) fn reset(&self, on_disk: u64) {
        self.written.store(on_disk, Ordering::Release);
        self.abort.store(false, Ordering::Release);
        self.touch();
    }

    fn touch(&self) {
        self.last_activity
            .store(storage::unix_millis(), Ordering::Release);
    }

    pub(super) fn written(&self) -> u64 {
        self.written.load(Ordering::Acquire)
    }

    pub(super) fn idle_millis(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.last_activity.load(Ordering::Acquire))
    }

    pub(super) fn abort(&self) {
        self.abort.store(true, Ordering::Release);
    }

    pub(super) fn is_aborted(&self) -> bool {
        self.abort.load(Ordering::Acquire)
    }
}

/// Fetches the rest of `rec` starting `offset` bytes in, appending to its part file.
///
/// Any status other than 206 stops the transfer before a byte is written and
/// is a protocol violation, which ends the segmented attempt.
pub(super) fn fetch_segment(
    url: &str,
    rec: &SegmentRecord,
    offset: u64,
    http: &HttpOptions,
    slot: &SegmentSlot,
    token: &CancelToken,
    progress: &ProgressHandle,
) -> Result<(), FetchError> {
    let seg = rec.segment();
    let remaining = seg.len().saturating_sub(offset);
    if remaining == 0 {
        return Ok(());
    }

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&rec.part_path)?;

    let status: Cell<Option<u32>> = Cell::new(None);
    let unexpected: Cell<Option<u32>> = Cell::new(None);
    let overflow = Cell::new(false);
    let received = Cell::new(0u64);
    let io_error: RefCell<Option<io::Error>> = RefCell::new(None);

    let mut easy = curl::easy::Easy::new();
    easy.url(url)?;
    http.apply(&mut easy, &["Accept-Encoding: identity"])?;
    easy.range(&seg.range_from(offset))?;
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
            if token.is_interrupted() || slot.is_aborted() {
                return Ok(0);
            }
            let code = status.get().unwrap_or(0);
            if code != 206 {
                unexpected.set(Some(code));
                return Ok(0);
            }
            let len = data.len() as u64;
            if received.get() + len > remaining {
                overflow.set(true);
                return Ok(0);
            }
            if let Err(e) = file.write_all(data) {
                *io_error.borrow_mut() = Some(e);
                return Ok(0);
            }
            received.set(received.get() + len);
            slot.written.fetch_add(len, Ordering::AcqRel);
            slot.touch();
            progress.add_bytes(len);
            Ok(data.len())
        })?;
        transfer.progress_function(|_, _, _, _| !(token.is_interrupted() || slot.is_aborted()))?;
        transfer.perform()
    };

    if let Some(e) = io_error.into_inner() {
        return Err(FetchError::Storage(e));
    }
    token.check()?;
    if let Some(code) = unexpected.get() {
        return Err(unexpected_status(seg.index, code));
    }
    if slot.is_aborted() {
        return Err(FetchError::Timeout(format!(
            "segment {} stalled after {} bytes",
            seg.index,
            offset + received.get()
        )));
    }
    if overflow.get() {
        return Err(FetchError::Integrity(format!(
            "segment {}: server sent more than the {} bytes requested",
            seg.index, remaining
        )));
    }
    if let Err(e) = result {
        return Err(FetchError::from_curl(&e));
    }

    let code = easy.response_code()?;
    if code != 206 {
        return Err(unexpected_status(seg.index, code));
    }
    if received.get() != remaining {
        return Err(FetchError::Transport(format!(
            "segment {}: short transfer ({} of {} bytes)",
            seg.index,
            received.get(),
            remaining
        )));
    }
    file.sync_data()?;
    Ok(())
}

fn unexpected_status(index: usize, code: u32) -> FetchError {
    FetchError::ProtocolViolation(format!(
        "segment {}: expected 206 Partial Content, got {}",
        index, code
    ))
}
