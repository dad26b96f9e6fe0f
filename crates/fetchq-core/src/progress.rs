//! Progress reporting for downloads (bytes done, ETA, rate).
//!
//! Engines feed a shared `ProgressHandle`; the queue mirrors its snapshots into
//! task progress/speed and the CLI renders them.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

/// Snapshot of download progress for one transfer (CLI-friendly).
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressStats {
    /// Bytes present for the artifact, including bytes resumed from disk.
    pub bytes_done: u64,
    /// Total file size in bytes, when known.
    pub total_bytes: Option<u64>,
    /// Bytes fetched in this session only.
    pub session_bytes: u64,
    /// Elapsed time since the transfer started (seconds).
    pub elapsed_secs: f64,
    pub segments_done: usize,
    pub segment_count: usize,
}

impl ProgressStats {
    /// Session download rate in bytes per second (0 if elapsed is 0).
    pub fn bytes_per_sec(&self) -> f64 {
        if self.elapsed_secs <= 0.0 {
            return 0.0;
        }
        self.session_bytes as f64 / self.elapsed_secs
    }

    /// Estimated seconds remaining (None if the total or the rate is unknown).
    pub fn eta_secs(&self) -> Option<f64> {
        let total = self.total_bytes?;
        let remaining = total.saturating_sub(self.bytes_done);
        if remaining == 0 {
            return Some(0.0);
        }
        let rate = self.bytes_per_sec();
        if rate <= 0.0 {
            return None;
        }
        Some(remaining as f64 / rate)
    }

    /// Fraction complete in [0.0, 1.0]; 0 when the total is unknown.
    pub fn fraction(&self) -> f64 {
        match self.total_bytes {
            Some(0) => 1.0,
            Some(total) => (self.bytes_done as f64 / total as f64).min(1.0),
            None => 0.0,
        }
    }
}

#[derive(Debug)]
struct Inner {
    started: Instant,
    total: Option<u64>,
    baseline: u64,
    session: u64,
    segments_done: usize,
    segment_count: usize,
}

/// Lock-protected progress counter shared between an engine and its observers.
#[derive(Debug, Clone)]
pub struct ProgressHandle {
    inner: Arc<Mutex<Inner>>,
}

impl Default for ProgressHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressHandle {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                started: Instant::now(),
                total: None,
                baseline: 0,
                session: 0,
                segments_done: 0,
                segment_count: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_total(&self, total: Option<u64>) {
        self.lock().total = total;
    }

    /// Starts a (re)counted transfer with `already_on_disk` bytes resumed.
    pub fn begin(&self, already_on_disk: u64, segment_count: usize) {
        let mut g = self.lock();
        g.started = Instant::now();
        g.baseline = already_on_disk;
        g.session = 0;
        g.segments_done = 0;
        g.segment_count = segment_count;
    }

    pub fn add_bytes(&self, n: u64) {
        self.lock().session += n;
    }

    pub fn segment_done(&self) {
        self.lock().segments_done += 1;
    }

    pub fn snapshot(&self) -> ProgressStats {
        let g = self.lock();
        ProgressStats {
            bytes_done: g.baseline + g.session,
            total_bytes: g.total,
            session_bytes: g.session,
            elapsed_secs: g.started.elapsed().as_secs_f64(),
            segments_done: g.segments_done,
            segment_count: g.segment_count,
        }
    }
}
