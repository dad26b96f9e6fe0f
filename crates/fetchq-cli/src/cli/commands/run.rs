//! `fetchq run` – run the scheduler until the queue is idle.

use anyhow::Result;
use fetchq_core::queue::{QueueManager, TaskState};
use std::time::Duration;

const PROGRESS_INTERVAL: Duration = Duration::from_millis(1000);

pub async fn run_scheduler(queue: &QueueManager) -> Result<()> {
    let reporter = {
        let queue = queue.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(PROGRESS_INTERVAL).await;
                for task in queue.list() {
                    if task.state != TaskState::Downloading {
                        continue;
                    }
                    println!(
                        "  [{}] {:.1}%  {:.2} MiB/s  {}",
                        task.id,
                        task.progress,
                        task.speed / 1_048_576.0,
                        task.destination.display()
                    );
                }
            }
        })
    };

    // Ctrl-C pauses active transfers; their part files stay for the next run.
    let shutdown = async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };
    let summary = queue.run_until_idle_or(shutdown).await?;
    if summary.interrupted {
        println!("Interrupted; active tasks paused.");
    }
    reporter.abort();

    if summary.started == 0 && !summary.interrupted {
        println!("No runnable tasks.");
    } else {
        println!(
            "Started {}, completed {}, failed {}, cancelled {}, paused {}, retries {}",
            summary.started,
            summary.completed,
            summary.failed,
            summary.cancelled,
            summary.paused,
            summary.retries_scheduled
        );
    }
    Ok(())
}
