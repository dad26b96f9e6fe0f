//! `fetchq add <url>` – add a task to the queue.

use anyhow::Result;
use clap::Args;
use fetchq_core::downloader::ModePreference;
use fetchq_core::queue::{Condition, EnqueueRequest, QueueManager};
use std::path::PathBuf;

#[derive(Debug, Args)]
pub struct AddArgs {
    /// Direct HTTP/HTTPS URL to download.
    pub url: String,
    /// Destination: absolute, or relative to the configured download dir.
    #[arg(short, long, value_name = "PATH")]
    pub output: Option<PathBuf>,
    /// Higher runs first; waiting tasks age upward over time.
    #[arg(short, long, default_value = "0", allow_negative_numbers = true)]
    pub priority: i32,
    /// Parallel connections for a segmented transfer.
    #[arg(short, long, value_name = "N")]
    pub connections: Option<usize>,
    /// auto, single or multi.
    #[arg(long, default_value = "auto")]
    pub mode: ModePreference,
    /// Expected SHA-256 (hex) of the finished file.
    #[arg(long, value_name = "HEX")]
    pub sha256: Option<String>,
    /// Attempts before the task fails (default from config).
    #[arg(long, value_name = "N")]
    pub max_attempts: Option<u32>,
    /// Start only after this task completed.
    #[arg(long, value_name = "ID")]
    pub after: Vec<u64>,
    /// Do not start before this Unix time (seconds).
    #[arg(long, value_name = "UNIX_SECS")]
    pub not_before: Option<u64>,
    /// Fail instead of downloading if the file is larger than this many bytes.
    #[arg(long, value_name = "BYTES")]
    pub max_size: Option<u64>,
}

impl AddArgs {
    fn into_request(self) -> EnqueueRequest {
        let mut req = EnqueueRequest::new(self.url)
            .priority(self.priority)
            .mode(self.mode);
        if let Some(path) = self.output {
            req = req.destination(path);
        }
        if let Some(n) = self.connections {
            req = req.connections(n);
        }
        if let Some(digest) = self.sha256 {
            req = req.expected_sha256(digest);
        }
        if let Some(n) = self.max_attempts {
            req = req.max_attempts(n);
        }
        for task in self.after {
            req = req.condition(Condition::AfterTask { task });
        }
        if let Some(secs) = self.not_before {
            req = req.condition(Condition::NotBefore {
                at_ms: secs.saturating_mul(1000),
            });
        }
        if let Some(bytes) = self.max_size {
            req = req.condition(Condition::SizeAtMost { bytes });
        }
        req
    }
}

pub fn run_add(queue: &QueueManager, args: AddArgs) -> Result<()> {
    let id = queue.enqueue(args.into_request())?;
    if let Some(task) = queue.get(id) {
        println!("Added task {} -> {}", id, task.destination.display());
        if let Some(risk) = task.risk {
            println!("  warning: flagged as {} (quarantined: {})", risk, task.quarantined);
        }
    }
    Ok(())
}
