//! `fetchq get <url>` – one-shot download outside the queue.

use anyhow::{Context, Result};
use fetchq_core::config::FetchqConfig;
use fetchq_core::control::CancelToken;
use fetchq_core::downloader::{DownloadJob, Downloader, Engine, ModePreference};
use fetchq_core::progress::ProgressHandle;
use fetchq_core::security::{filename_from_url, DefaultSecurity, Security, DEFAULT_FILENAME};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

pub async fn run_get(
    cfg: &FetchqConfig,
    url: &str,
    output: Option<PathBuf>,
    connections: Option<usize>,
    mode: ModePreference,
    sha256: Option<String>,
) -> Result<()> {
    let destination = match output {
        Some(path) => path,
        None => {
            let security = DefaultSecurity::default();
            let name = filename_from_url(url)
                .map(|n| security.sanitize_filename(&n))
                .unwrap_or_else(|| DEFAULT_FILENAME.to_string());
            std::env::current_dir()?.join(name)
        }
    };

    let mut job = DownloadJob::new(url, &destination);
    job.max_connections = connections;
    job.mode = mode;
    job.expected_sha256 = sha256;

    let engine = Arc::new(Engine::new(cfg.engine.clone()));
    let token = CancelToken::new();
    let progress = ProgressHandle::new();

    let ctrl_c = {
        let token = token.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("\ninterrupted; partial data kept for resume");
                token.cancel();
            }
        })
    };
    let reporter = {
        let progress = progress.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(500)).await;
                let stats = progress.snapshot();
                let done_mib = stats.bytes_done as f64 / 1_048_576.0;
                let rate_mib = stats.bytes_per_sec() / 1_048_576.0;
                let eta = stats
                    .eta_secs()
                    .map(|s| format!("{:.0}s", s))
                    .unwrap_or_else(|| "?".to_string());
                eprint!(
                    "\r  {:.1} MiB ({:.1}%)  {:.2} MiB/s  ETA {}  ",
                    done_mib,
                    stats.fraction() * 100.0,
                    rate_mib,
                    eta
                );
            }
        })
    };

    let result = {
        let engine = Arc::clone(&engine);
        let token = token.clone();
        let progress = progress.clone();
        tokio::task::spawn_blocking(move || engine.download(&job, &token, &progress))
            .await
            .context("download worker")?
    };
    reporter.abort();
    ctrl_c.abort();
    eprintln!();

    let outcome = result.with_context(|| format!("download {}", url))?;
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(())
}
