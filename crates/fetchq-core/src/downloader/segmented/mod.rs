//! Segmented engine: N concurrent range requests into part files, then merge.
//!
//! The coordinator owns the resume descriptor. Workers only append to their
//! own part file and bump their slot; the coordinator checkpoints the
//! descriptor, detects stalls, requeues failed segments within the
//! per-segment retry budget, and aborts everything on a protocol violation
//! or an interrupt. All worker threads are joined before it returns.

mod merge;
mod worker;

use std::path::Path;
use std::sync::mpsc;
use std::time::{Duration, Instant};

use crate::config::EngineConfig;
use crate::control::CancelToken;
use crate::error::FetchError;
use crate::http::HttpOptions;
use crate::probe::ServerCapability;
use crate::progress::ProgressHandle;
use crate::resume::{self, ResumeDescriptor, SegmentRecord};
use crate::retry::classify;
use crate::segmenter::plan_segments;
use crate::storage;

use super::{DownloadOutcome, TransferMode};
use worker::SegmentSlot;

const TICK: Duration = Duration::from_millis(100);

pub(super) struct SegmentedRequest<'a> {
    pub url: &'a str,
    pub dest: &'a Path,
    pub cap: &'a ServerCapability,
    pub total: u64,
    pub connections: usize,
    pub expected_sha256: Option<&'a str>,
    pub allow_resume: bool,
    pub cfg: &'a EngineConfig,
    pub http: &'a HttpOptions,
}

pub(super) fn run(
    req: &SegmentedRequest<'_>,
    token: &CancelToken,
    progress: &ProgressHandle,
) -> Result<DownloadOutcome, FetchError> {
    let desc_path = storage::descriptor_path(req.dest);
    let (mut desc, offsets) = prepare(req, &desc_path)?;
    let resumed_from: u64 = offsets.iter().sum();
    let connections_used = desc.segments.len();

    progress.set_total(Some(req.total));
    progress.begin(resumed_from, desc.segments.len());
    for (rec, off) in desc.segments.iter().zip(&offsets) {
        if *off == rec.end - rec.start + 1 {
            progress.segment_done();
        }
    }
    if resumed_from > 0 {
        tracing::info!(
            url = req.url,
            resumed_from,
            total = req.total,
            "resuming segmented download"
        );
    }

    let http = req.http.per_connection(connections_used);
    let result = transfer(req, &http, &mut desc, &desc_path, &offsets, token, progress);

    // Whatever happened, the descriptor must reflect the bytes on disk.
    for rec in desc.segments.iter_mut() {
        let on_disk = storage::file_len(&rec.part_path).unwrap_or(rec.bytes_written);
        rec.bytes_written = on_disk.min(rec.end - rec.start + 1);
    }
    let saved = desc.save(&desc_path);
    result?;
    saved?;

    let sha256 = merge::merge_parts(req.dest, &desc, req.expected_sha256, token)?;
    for rec in &desc.segments {
        if let Err(e) = storage::remove_if_exists(&rec.part_path) {
            tracing::warn!(path = %rec.part_path.display(), error = %e, "could not remove part file");
        }
    }
    if let Err(e) = storage::remove_if_exists(&desc_path) {
        tracing::warn!(path = %desc_path.display(), error = %e, "could not remove descriptor");
    }

    let snapshot = progress.snapshot();
    Ok(DownloadOutcome {
        mode: TransferMode::Multi,
        connections_used,
        total_size: req.total,
        bytes_transferred: snapshot.session_bytes,
        resumed_from,
        sha256,
        destination: req.dest.to_path_buf(),
    })
}

/// Loads and validates an existing descriptor, or archives stale state and plans afresh.
/// Returns the descriptor plus the resume offset of every segment.
fn prepare(
    req: &SegmentedRequest<'_>,
    desc_path: &Path,
) -> Result<(ResumeDescriptor, Vec<u64>), FetchError> {
    let existing = match ResumeDescriptor::load(desc_path) {
        Ok(d) => d,
        Err(FetchError::ResumeStateInvalid(reason)) => {
            tracing::warn!(path = %desc_path.display(), %reason, "unreadable resume descriptor");
            archive(desc_path, &[]);
            None
        }
        Err(e) => return Err(e),
    };

    if let Some(desc) = existing {
        if !req.allow_resume {
            tracing::info!(url = req.url, "resume not allowed; discarding segmented state");
            archive(desc_path, &desc.segments);
        } else {
            match reusable_offsets(req, &desc) {
                Ok(offsets) => return Ok((desc, offsets)),
                Err(e) => {
                    tracing::warn!(url = req.url, error = %e, "resume descriptor rejected; restarting from zero");
                    archive(desc_path, &desc.segments);
                }
            }
        }
    }

    let plan = plan_segments(req.total, req.connections, req.cfg.segment_size);
    let mut desc = ResumeDescriptor::new(req.url, req.total, req.cap, &plan, req.dest);
    for rec in &desc.segments {
        if let Err(e) = storage::archive_stale(&rec.part_path) {
            return Err(e.into());
        }
    }
    desc.save(desc_path)?;
    tracing::debug!(
        url = req.url,
        total = req.total,
        segments = desc.segments.len(),
        "planned segmented download"
    );
    let offsets = vec![0; desc.segments.len()];
    Ok((desc, offsets))
}

fn reusable_offsets(
    req: &SegmentedRequest<'_>,
    desc: &ResumeDescriptor,
) -> Result<Vec<u64>, FetchError> {
    resume::validate_remote(
        req.url,
        &desc.url,
        Some(desc.total_size),
        desc.etag.as_deref(),
        desc.last_modified.as_deref(),
        req.cap,
    )?;
    resume::validate_layout(desc)?;
    let mut offsets = Vec::with_capacity(desc.segments.len());
    for rec in &desc.segments {
        if rec.part_path != storage::part_path(req.dest, rec.id) {
            return Err(FetchError::ResumeStateInvalid(format!(
                "segment {} part file {} is not next to the destination",
                rec.id,
                rec.part_path.display()
            )));
        }
        let on_disk = storage::file_len(&rec.part_path)?;
        offsets.push(resume::resume_offset(rec, on_disk)?);
    }
    Ok(offsets)
}

/// Archives the descriptor and any part files it names.
fn archive(desc_path: &Path, segments: &[SegmentRecord]) {
    for path in std::iter::once(desc_path).chain(segments.iter().map(|s| s.part_path.as_path())) {
        match storage::archive_stale(path) {
            Ok(Some(to)) => tracing::info!(from = %path.display(), to = %to.display(), "archived stale resume state"),
            Ok(None) => {}
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "could not archive stale resume state"),
        }
    }
}

/// Runs workers until every segment is complete or the attempt fails.
fn transfer(
    req: &SegmentedRequest<'_>,
    http: &HttpOptions,
    desc: &mut ResumeDescriptor,
    desc_path: &Path,
    offsets: &[u64],
    token: &CancelToken,
    progress: &ProgressHandle,
) -> Result<(), FetchError> {
    let records: Vec<SegmentRecord> = desc.segments.clone();
    let slots: Vec<SegmentSlot> = offsets.iter().map(|o| SegmentSlot::new(*o)).collect();
    let stall_ms = req.cfg.stall_timeout().as_millis() as u64;
    let checkpoint_every = req.cfg.checkpoint_interval();
    let url = req.url;

    std::thread::scope(|scope| {
        let (tx, rx) = mpsc::channel::<(usize, Result<(), FetchError>)>();
        let spawn = |id: usize, offset: u64| {
            let tx = tx.clone();
            let rec = &records[id];
            let slot = &slots[id];
            scope.spawn(move || {
                let res = worker::fetch_segment(url, rec, offset, http, slot, token, progress);
                let _ = tx.send((id, res));
            });
        };

        let mut active = vec![false; records.len()];
        let mut attempts = vec![0u32; records.len()];
        let mut pending = 0usize;
        for (id, rec) in records.iter().enumerate() {
            if offsets[id] < rec.end - rec.start + 1 {
                active[id] = true;
                pending += 1;
                spawn(id, offsets[id]);
            } else {
                desc.record_progress(id, offsets[id], true);
            }
        }

        let mut failure: Option<FetchError> = None;
        let mut last_checkpoint = Instant::now();
        while pending > 0 {
            match rx.recv_timeout(TICK) {
                Ok((id, Ok(()))) => {
                    active[id] = false;
                    pending -= 1;
                    desc.record_progress(id, records[id].end - records[id].start + 1, true);
                    progress.segment_done();
                    tracing::debug!(segment = id, "segment complete");
                    if let Err(e) = desc.save(desc_path) {
                        failure = Some(e);
                        break;
                    }
                    last_checkpoint = Instant::now();
                }
                Ok((id, Err(e))) => {
                    active[id] = false;
                    pending -= 1;
                    if let Some(reason) = token.reason() {
                        failure = Some(FetchError::Interrupted(reason));
                        break;
                    }
                    if matches!(e, FetchError::ProtocolViolation(_)) {
                        tracing::warn!(segment = id, error = %e, "server stopped honoring ranges");
                        failure = Some(e);
                        break;
                    }
                    if classify(&e).is_retryable() && attempts[id] < req.cfg.segment_retries {
                        attempts[id] += 1;
                        let on_disk = match storage::file_len(&records[id].part_path)
                            .map_err(FetchError::from)
                            .and_then(|n| resume::resume_offset(&records[id], n).map_err(FetchError::from))
                        {
                            Ok(n) => n,
                            Err(err) => {
                                failure = Some(err);
                                break;
                            }
                        };
                        tracing::warn!(
                            segment = id,
                            attempt = attempts[id],
                            offset = on_disk,
                            error = %e,
                            "requeueing segment"
                        );
                        slots[id].reset(on_disk);
                        active[id] = true;
                        pending += 1;
                        spawn(id, on_disk);
                    } else {
                        tracing::warn!(segment = id, error = %e, "segment failed; retries exhausted");
                        failure = Some(e);
                        break;
                    }
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {}
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }

            if let Some(reason) = token.reason() {
                failure = Some(FetchError::Interrupted(reason));
                break;
            }

            let now_ms = storage::unix_millis();
            for (id, slot) in slots.iter().enumerate() {
                if active[id] && !slot.is_aborted() && slot.idle_millis(now_ms) > stall_ms {
                    tracing::warn!(segment = id, idle_ms = slot.idle_millis(now_ms), "segment stalled");
                    slot.abort();
                }
            }

            if last_checkpoint.elapsed() >= checkpoint_every {
                for (id, slot) in slots.iter().enumerate() {
                    if active[id] {
                        desc.record_progress(id, slot.written(), false);
                    }
                }
                if let Err(e) = desc.save(desc_path) {
                    tracing::warn!(path = %desc_path.display(), error = %e, "checkpoint failed");
                }
                last_checkpoint = Instant::now();
            }
        }

        if failure.is_some() {
            for slot in &slots {
                slot.abort();
            }
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    })
}
