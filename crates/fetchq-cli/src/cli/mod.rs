//! CLI for the fetchq download queue.

mod commands;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fetchq_core::config::{self, FetchqConfig};
use fetchq_core::downloader::{Engine, ModePreference};
use fetchq_core::queue::QueueManager;
use std::path::PathBuf;
use std::sync::Arc;

use commands::{
    run_add, run_cancel, run_checksum, run_get, run_pause, run_remove, run_report, run_resume,
    run_scheduler, run_status, AddArgs,
};

/// Top-level CLI for the fetchq download queue.
#[derive(Debug, Parser)]
#[command(name = "fetchq")]
#[command(about = "fetchq: resumable multi-connection downloads with a persistent queue", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: CliCommand,
}

#[derive(Debug, Subcommand)]
pub enum CliCommand {
    /// Download one URL right away, without the queue. Prints the outcome as JSON.
    Get {
        /// Direct HTTP/HTTPS URL to download.
        url: String,
        /// Output path (default: file name from the URL in the current directory).
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
        /// Parallel connections for a segmented transfer.
        #[arg(short, long, value_name = "N")]
        connections: Option<usize>,
        /// auto, single or multi.
        #[arg(long, default_value = "auto")]
        mode: ModePreference,
        /// Expected SHA-256 (hex) of the finished file.
        #[arg(long, value_name = "HEX")]
        sha256: Option<String>,
    },

    /// Add a download task to the queue.
    Add(AddArgs),

    /// Run the scheduler until no task can make progress. Ctrl-C pauses active tasks.
    Run,

    /// Show all tasks in the queue.
    Status,

    /// Pause a queued task by its ID.
    Pause {
        /// Task identifier.
        id: u64,
    },

    /// Resume a paused task by its ID.
    Resume {
        /// Task identifier.
        id: u64,
    },

    /// Cancel a task by its ID. Partial data stays on disk.
    Cancel {
        /// Task identifier.
        id: u64,
    },

    /// Remove a finished or paused task from the queue.
    Remove {
        /// Task identifier.
        id: u64,
        /// Also delete resume state and partial files next to the destination.
        #[arg(long)]
        delete_files: bool,
    },

    /// Print the batch report (per-task outcome) as JSON.
    Report {
        /// Exit with an error unless every task completed.
        #[arg(long)]
        strict: bool,
    },

    /// Compute SHA-256 of a file (e.g. after download).
    Checksum {
        /// Path to the file.
        path: PathBuf,
    },
}

impl CliCommand {
    pub async fn run_from_args() -> Result<()> {
        let cli = Cli::parse();
        let cfg = config::load_or_init().context("load config")?;
        tracing::debug!("loaded config: {:?}", cfg);

        match cli.command {
            CliCommand::Get {
                url,
                output,
                connections,
                mode,
                sha256,
            } => run_get(&cfg, &url, output, connections, mode, sha256).await?,
            CliCommand::Add(args) => run_add(&open_queue(&cfg)?, args)?,
            CliCommand::Run => run_scheduler(&open_queue(&cfg)?).await?,
            CliCommand::Status => run_status(&open_queue(&cfg)?),
            CliCommand::Pause { id } => run_pause(&open_queue(&cfg)?, id)?,
            CliCommand::Resume { id } => run_resume(&open_queue(&cfg)?, id)?,
            CliCommand::Cancel { id } => run_cancel(&open_queue(&cfg)?, id)?,
            CliCommand::Remove { id, delete_files } => {
                run_remove(&open_queue(&cfg)?, id, delete_files)?
            }
            CliCommand::Report { strict } => run_report(&open_queue(&cfg)?, strict)?,
            CliCommand::Checksum { path } => run_checksum(&path)?,
        }

        Ok(())
    }
}

/// Queue backed by the real engine and, when enabled, the on-disk snapshot.
fn open_queue(cfg: &FetchqConfig) -> Result<QueueManager> {
    let snapshot = if cfg.persistence.enabled {
        Some(cfg.persistence.resolve_snapshot_path()?)
    } else {
        None
    };
    let engine = Arc::new(Engine::new(cfg.engine.clone()));
    QueueManager::builder(cfg.queue.clone(), engine)
        .snapshot_path(snapshot)
        .build()
        .context("open queue")
}

#[cfg(test)]
mod tests;
