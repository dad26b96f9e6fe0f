//! `fetchq pause <id>` – pause a queued task.

use anyhow::Result;
use fetchq_core::queue::QueueManager;

pub fn run_pause(queue: &QueueManager, id: u64) -> Result<()> {
    queue.pause(id)?;
    println!("Paused task {id}");
    Ok(())
}
