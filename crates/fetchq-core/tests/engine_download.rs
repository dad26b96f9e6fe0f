//! Integration tests: the download engine against a local range server.

mod common;

use std::fs;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use common::range_server::{self, RangeServerOptions};
use fetchq_core::checksum::sha256_bytes;
use fetchq_core::config::EngineConfig;
use fetchq_core::control::CancelToken;
use fetchq_core::downloader::{DownloadJob, Downloader, Engine, TransferMode};
use fetchq_core::probe::ServerCapability;
use fetchq_core::progress::ProgressHandle;
use fetchq_core::resume::{ResumeDescriptor, SingleStreamRecord};
use fetchq_core::segmenter::plan_segments;
use fetchq_core::{storage, FetchError, InterruptReason};
use tempfile::tempdir;

fn body(len: usize) -> Vec<u8> {
    (0u8..251).cycle().take(len).collect()
}

fn engine() -> Engine {
    Engine::new(EngineConfig {
        min_multi_size: 1024,
        segment_size: 1024,
        max_connections: 4,
        stall_timeout_secs: 0.5,
        segment_retries: 3,
        checkpoint_interval_secs: 0.1,
        connect_timeout_secs: 5,
        ..EngineConfig::default()
    })
}

fn slow() -> RangeServerOptions {
    RangeServerOptions {
        chunk_delay: Some(Duration::from_millis(20)),
        chunk_size: 1024,
        ..RangeServerOptions::default()
    }
}

/// Cancels `token` once at least `bytes` arrived in this attempt.
fn cancel_after(token: &CancelToken, progress: &ProgressHandle, bytes: u64) -> thread::JoinHandle<()> {
    let token = token.clone();
    let progress = progress.clone();
    thread::spawn(move || {
        let deadline = Instant::now() + Duration::from_secs(10);
        while progress.snapshot().session_bytes < bytes && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        token.cancel();
    })
}

fn stale_files(dir: &Path) -> usize {
    fs::read_dir(dir)
        .unwrap()
        .flatten()
        .filter(|e| e.file_name().to_string_lossy().ends_with(".stale"))
        .count()
}

#[test]
fn multi_connection_download_matches_digest() {
    let data = body(64 * 1024);
    let server = range_server::start(data.clone(), "image.iso");
    let dir = tempdir().unwrap();
    let dest = dir.path().join("image.iso");

    let mut job = DownloadJob::new(server.url.clone(), &dest);
    job.expected_sha256 = Some(sha256_bytes(&data));
    let outcome = engine()
        .download(&job, &CancelToken::new(), &ProgressHandle::new())
        .expect("download");

    assert_eq!(outcome.mode, TransferMode::Multi);
    assert_eq!(outcome.connections_used, 4);
    assert_eq!(outcome.total_size, data.len() as u64);
    assert_eq!(outcome.resumed_from, 0);
    assert_eq!(outcome.sha256, sha256_bytes(&data));
    assert_eq!(fs::read(&dest).unwrap(), data);
    assert!(!storage::descriptor_path(&dest).exists());
    for i in 0..4 {
        assert!(!storage::part_path(&dest, i).exists());
    }
}

#[test]
fn server_without_ranges_uses_one_connection() {
    let data = body(32 * 1024);
    let opts = RangeServerOptions {
        support_ranges: false,
        head_allowed: false,
        ..RangeServerOptions::default()
    };
    let server = range_server::start_with_options(data.clone(), "plain.bin", opts);
    let dir = tempdir().unwrap();
    let dest = dir.path().join("plain.bin");

    let outcome = engine()
        .download(
            &DownloadJob::new(server.url.clone(), &dest),
            &CancelToken::new(),
            &ProgressHandle::new(),
        )
        .expect("download");
    assert_eq!(outcome.mode, TransferMode::Single);
    assert_eq!(outcome.connections_used, 1);
    assert_eq!(fs::read(&dest).unwrap(), data);
    assert!(!storage::single_record_path(&dest).exists());
}

#[test]
fn small_file_uses_single_stream() {
    let data = body(512);
    let server = range_server::start(data.clone(), "small.txt");
    let dir = tempdir().unwrap();
    let dest = dir.path().join("small.txt");

    let outcome = engine()
        .download(
            &DownloadJob::new(server.url.clone(), &dest),
            &CancelToken::new(),
            &ProgressHandle::new(),
        )
        .expect("download");
    assert_eq!(outcome.mode, TransferMode::Single);
    assert_eq!(fs::read(&dest).unwrap(), data);
}

#[test]
fn cancel_keeps_resume_state_and_no_final_file() {
    let data = body(64 * 1024);
    let server = range_server::start_with_options(data, "big.bin", slow());
    let dir = tempdir().unwrap();
    let dest = dir.path().join("big.bin");

    let token = CancelToken::new();
    let progress = ProgressHandle::new();
    let canceller = cancel_after(&token, &progress, 4096);
    let err = engine()
        .download(&DownloadJob::new(server.url.clone(), &dest), &token, &progress)
        .unwrap_err();
    canceller.join().unwrap();

    assert!(matches!(
        err,
        FetchError::Interrupted(InterruptReason::Cancelled)
    ));
    assert!(!dest.exists());
    let desc = ResumeDescriptor::load(&storage::descriptor_path(&dest))
        .unwrap()
        .expect("descriptor kept");
    assert!(desc.bytes_written() > 0);
    assert!(desc.bytes_written() < 64 * 1024);
}

#[test]
fn resume_transfers_only_missing_bytes() {
    let data = body(64 * 1024);
    let server = range_server::start_with_options(data.clone(), "resume.bin", slow());
    let dir = tempdir().unwrap();
    let dest = dir.path().join("resume.bin");
    let job = DownloadJob::new(server.url.clone(), &dest);

    let token = CancelToken::new();
    let progress = ProgressHandle::new();
    let canceller = cancel_after(&token, &progress, 8192);
    assert!(engine().download(&job, &token, &progress).is_err());
    canceller.join().unwrap();
    let served_first = server.body_bytes_served();

    let outcome = engine()
        .download(&job, &CancelToken::new(), &ProgressHandle::new())
        .expect("resumed download");
    assert_eq!(fs::read(&dest).unwrap(), data);
    assert!(outcome.resumed_from > 0);
    assert_eq!(outcome.resumed_from + outcome.bytes_transferred, data.len() as u64);
    let served_second = server.body_bytes_served() - served_first;
    assert!(served_second < data.len() as u64);
}

#[test]
fn mismatched_descriptor_is_archived_and_restarted() {
    let data = body(64 * 1024);
    let server = range_server::start(data.clone(), "changed.bin");
    let dir = tempdir().unwrap();
    let dest = dir.path().join("changed.bin");

    // Descriptor written for a different remote size.
    let old_cap = ServerCapability {
        supports_range: true,
        content_length: Some(10_000),
        ..ServerCapability::default()
    };
    let plan = plan_segments(10_000, 4, 1024);
    let mut desc = ResumeDescriptor::new(&server.url, 10_000, &old_cap, &plan, &dest);
    desc.save(&storage::descriptor_path(&dest)).unwrap();
    fs::write(storage::part_path(&dest, 0), vec![0xAA; 100]).unwrap();

    let outcome = engine()
        .download(
            &DownloadJob::new(server.url.clone(), &dest),
            &CancelToken::new(),
            &ProgressHandle::new(),
        )
        .expect("download");
    assert_eq!(outcome.resumed_from, 0);
    assert_eq!(fs::read(&dest).unwrap(), data);
    assert!(stale_files(dir.path()) >= 2, "descriptor and part archived");
}

#[test]
fn range_violation_falls_back_to_single_stream() {
    let data = body(64 * 1024);
    let opts = RangeServerOptions {
        ranges_only_for_probe: true,
        ..RangeServerOptions::default()
    };
    let server = range_server::start_with_options(data.clone(), "liar.bin", opts);
    let dir = tempdir().unwrap();
    let dest = dir.path().join("liar.bin");

    let outcome = engine()
        .download(
            &DownloadJob::new(server.url.clone(), &dest),
            &CancelToken::new(),
            &ProgressHandle::new(),
        )
        .expect("fallback download");
    assert_eq!(outcome.mode, TransferMode::Single);
    assert_eq!(fs::read(&dest).unwrap(), data);
}

#[test]
fn server_error_on_segment_falls_back_to_single_stream() {
    let data = body(64 * 1024);
    let opts = RangeServerOptions {
        fail_ranges_with: Some(503),
        ..RangeServerOptions::default()
    };
    let server = range_server::start_with_options(data.clone(), "busy.bin", opts);
    let dir = tempdir().unwrap();
    let dest = dir.path().join("busy.bin");

    let outcome = engine()
        .download(
            &DownloadJob::new(server.url.clone(), &dest),
            &CancelToken::new(),
            &ProgressHandle::new(),
        )
        .expect("fallback download");
    assert_eq!(outcome.mode, TransferMode::Single);
    assert_eq!(outcome.connections_used, 1);
    assert_eq!(fs::read(&dest).unwrap(), data);
}

#[test]
fn digest_mismatch_leaves_no_artifact() {
    let data = body(64 * 1024);
    let server = range_server::start(data, "bad.bin");
    let dir = tempdir().unwrap();
    let dest = dir.path().join("bad.bin");

    let mut job = DownloadJob::new(server.url.clone(), &dest);
    job.expected_sha256 = Some("00".repeat(32));
    let err = engine()
        .download(&job, &CancelToken::new(), &ProgressHandle::new())
        .unwrap_err();
    assert!(matches!(err, FetchError::Integrity(_)), "got {err}");
    assert!(!dest.exists());
    assert!(!storage::merge_path(&dest).exists());
}

#[test]
fn single_stream_restarts_when_range_is_ignored() {
    let data = body(4 * 1024);
    let opts = RangeServerOptions {
        ranges_only_for_probe: true,
        ..RangeServerOptions::default()
    };
    let server = range_server::start_with_options(data.clone(), "restart.bin", opts);
    let dir = tempdir().unwrap();
    let dest = dir.path().join("restart.bin");

    // A previous attempt left 1000 bytes of garbage and a matching record.
    let cap = ServerCapability {
        supports_range: true,
        content_length: Some(data.len() as u64),
        ..ServerCapability::default()
    };
    let mut record = SingleStreamRecord::new(&server.url, &cap);
    record.bytes_written = 1000;
    record.save(&storage::single_record_path(&dest)).unwrap();
    fs::write(storage::temp_path(&dest), vec![0xEE; 1000]).unwrap();

    let mut job = DownloadJob::new(server.url.clone(), &dest);
    job.max_connections = Some(1);
    let outcome = engine()
        .download(&job, &CancelToken::new(), &ProgressHandle::new())
        .expect("download");
    assert_eq!(outcome.mode, TransferMode::Single);
    assert_eq!(fs::read(&dest).unwrap(), data);
    assert!(!storage::temp_path(&dest).exists());
}

#[test]
fn stalled_segment_is_requeued() {
    let data = body(64 * 1024);
    let opts = RangeServerOptions {
        stall_first_range: true,
        ..RangeServerOptions::default()
    };
    let server = range_server::start_with_options(data.clone(), "stall.bin", opts);
    let dir = tempdir().unwrap();
    let dest = dir.path().join("stall.bin");

    let started = Instant::now();
    let outcome = engine()
        .download(
            &DownloadJob::new(server.url.clone(), &dest),
            &CancelToken::new(),
            &ProgressHandle::new(),
        )
        .expect("download despite stall");
    assert_eq!(outcome.mode, TransferMode::Multi);
    assert_eq!(fs::read(&dest).unwrap(), data);
    assert!(started.elapsed() < Duration::from_secs(9), "stall detected before the server gave up");
}
