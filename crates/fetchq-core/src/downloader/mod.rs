//! Download engines.
//!
//! `Engine` probes the server, then picks the segmented engine (range support,
//! known size at or above `min_multi_size`, more than one connection) or the
//! single-stream engine. A protocol violation during a segmented transfer
//! falls back to a single stream for the whole file.

mod segmented;
mod single;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::config::EngineConfig;
use crate::control::CancelToken;
use crate::error::FetchError;
use crate::http::HttpOptions;
use crate::probe::{self, ServerCapability};
use crate::progress::ProgressHandle;
use crate::resume::{ResumeDescriptor, SingleStreamRecord};
use crate::storage;

/// Transfer strategy actually used for a download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferMode {
    Multi,
    Single,
}

impl fmt::Display for TransferMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferMode::Multi => write!(f, "multi"),
            TransferMode::Single => write!(f, "single"),
        }
    }
}

/// Strategy requested by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModePreference {
    #[default]
    Auto,
    /// Never split the transfer.
    Single,
    /// Split even below `min_multi_size` when the server allows it.
    Multi,
}

impl std::str::FromStr for ModePreference {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(ModePreference::Auto),
            "single" => Ok(ModePreference::Single),
            "multi" => Ok(ModePreference::Multi),
            other => Err(format!("unknown mode '{}' (expected auto, single or multi)", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DownloadJob {
    pub url: String,
    pub destination: PathBuf,
    /// Overrides `EngineConfig::max_connections`.
    pub max_connections: Option<usize>,
    pub mode: ModePreference,
    pub expected_sha256: Option<String>,
    /// When false, existing resume state is archived and the transfer starts at zero.
    pub allow_resume: bool,
    /// Overrides `EngineConfig::max_bytes_per_sec`.
    pub max_bytes_per_sec: Option<u64>,
}

impl DownloadJob {
    pub fn new(url: impl Into<String>, destination: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            destination: destination.into(),
            max_connections: None,
            mode: ModePreference::Auto,
            expected_sha256: None,
            allow_resume: true,
            max_bytes_per_sec: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadOutcome {
    pub mode: TransferMode,
    pub connections_used: usize,
    pub total_size: u64,
    /// Bytes fetched over the network in this attempt.
    pub bytes_transferred: u64,
    /// Bytes reused from an earlier attempt.
    pub resumed_from: u64,
    pub sha256: String,
    pub destination: PathBuf,
}

/// Anything that can fetch a URL to a path. The queue only talks to this trait.
pub trait Downloader: Send + Sync {
    fn download(
        &self,
        job: &DownloadJob,
        token: &CancelToken,
        progress: &ProgressHandle,
    ) -> Result<DownloadOutcome, FetchError>;

    /// Bytes already on disk for `destination` from an earlier attempt.
    fn existing_progress(&self, destination: &Path) -> u64 {
        existing_progress(destination)
    }
}

/// The HTTP engine: capability probe plus segmented and single-stream transfers.
#[derive(Debug, Clone)]
pub struct Engine {
    cfg: EngineConfig,
    http: HttpOptions,
}

impl Engine {
    pub fn new(cfg: EngineConfig) -> Self {
        let http = HttpOptions::from_engine(&cfg);
        Self { cfg, http }
    }

    /// Engine with custom curl options (extra headers, shorter timeouts in tests).
    pub fn with_http(cfg: EngineConfig, http: HttpOptions) -> Self {
        Self { cfg, http }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.cfg
    }

    fn choose(&self, job: &DownloadJob, cap: &ServerCapability) -> (TransferMode, usize) {
        let connections = job
            .max_connections
            .unwrap_or(self.cfg.max_connections)
            .max(1);
        if job.mode == ModePreference::Single || connections < 2 || !cap.supports_range {
            return (TransferMode::Single, 1);
        }
        match cap.content_length {
            Some(total) if total > 0 => {
                if total >= self.cfg.min_multi_size || job.mode == ModePreference::Multi {
                    (TransferMode::Multi, connections)
                } else {
                    (TransferMode::Single, 1)
                }
            }
            _ => (TransferMode::Single, 1),
        }
    }

    fn run_single(
        &self,
        job: &DownloadJob,
        cap: &ServerCapability,
        http: &HttpOptions,
        token: &CancelToken,
        progress: &ProgressHandle,
    ) -> Result<DownloadOutcome, FetchError> {
        let req = single::SingleRequest {
            url: &job.url,
            dest: &job.destination,
            cap,
            expected_sha256: job.expected_sha256.as_deref(),
            allow_resume: job.allow_resume,
            checkpoint_interval: self.cfg.checkpoint_interval(),
            http,
        };
        let outcome = single::run(&req, token, progress)?;
        cleanup_segmented_state(&job.destination);
        Ok(outcome)
    }
}

impl Downloader for Engine {
    fn download(
        &self,
        job: &DownloadJob,
        token: &CancelToken,
        progress: &ProgressHandle,
    ) -> Result<DownloadOutcome, FetchError> {
        if let Some(parent) = job.destination.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut http = self.http.clone();
        if job.max_bytes_per_sec.is_some() {
            http.max_recv_speed = job.max_bytes_per_sec;
        }

        let cap = probe::probe(&job.url, &http);
        token.check()?;
        let (mode, connections) = self.choose(job, &cap);
        tracing::info!(
            url = %job.url,
            dest = %job.destination.display(),
            %mode,
            connections,
            size = ?cap.content_length,
            ranges = cap.supports_range,
            "starting download"
        );

        if mode == TransferMode::Multi {
            let req = segmented::SegmentedRequest {
                url: &job.url,
                dest: &job.destination,
                cap: &cap,
                total: cap.content_length.unwrap_or(0),
                connections,
                expected_sha256: job.expected_sha256.as_deref(),
                allow_resume: job.allow_resume,
                cfg: &self.cfg,
                http: &http,
            };
            match segmented::run(&req, token, progress) {
                Ok(outcome) => {
                    cleanup_single_state(&job.destination);
                    return Ok(outcome);
                }
                Err(FetchError::ProtocolViolation(reason)) => {
                    tracing::warn!(url = %job.url, %reason, "falling back to a single stream");
                    let mut single_cap = cap.clone();
                    single_cap.supports_range = false;
                    return self.run_single(job, &single_cap, &http, token, progress);
                }
                Err(e) => return Err(e),
            }
        }

        self.run_single(job, &cap, &http, token, progress)
    }
}

/// Bytes on disk from an earlier attempt: the segmented parts if a descriptor
/// exists, otherwise the single-stream temp file.
pub fn existing_progress(destination: &Path) -> u64 {
    if let Ok(Some(desc)) = ResumeDescriptor::load(&storage::descriptor_path(destination)) {
        return desc
            .segments
            .iter()
            .map(|s| storage::file_len(&s.part_path).unwrap_or(0))
            .sum();
    }
    storage::file_len(&storage::temp_path(destination)).unwrap_or(0)
}

fn cleanup_segmented_state(dest: &Path) {
    let desc_path = storage::descriptor_path(dest);
    let desc = match ResumeDescriptor::load(&desc_path) {
        Ok(Some(d)) => d,
        Ok(None) => return,
        Err(e) => {
            tracing::debug!(path = %desc_path.display(), error = %e, "leaving unreadable descriptor");
            return;
        }
    };
    for path in desc
        .segments
        .iter()
        .map(|s| s.part_path.as_path())
        .chain(std::iter::once(desc_path.as_path()))
    {
        if let Err(e) = storage::remove_if_exists(path) {
            tracing::warn!(path = %path.display(), error = %e, "could not remove segmented state");
        }
    }
}

fn cleanup_single_state(dest: &Path) {
    let record_path = storage::single_record_path(dest);
    if let Ok(Some(_)) = SingleStreamRecord::load(&record_path) {
        for path in [storage::temp_path(dest), record_path] {
            if let Err(e) = storage::remove_if_exists(&path) {
                tracing::warn!(path = %path.display(), error = %e, "could not remove single-stream state");
            }
        }
    }
}
