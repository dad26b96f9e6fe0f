//! `fetchq resume <id>` – move a paused task back to the queue.

use anyhow::Result;
use fetchq_core::queue::QueueManager;

pub fn run_resume(queue: &QueueManager, id: u64) -> Result<()> {
    queue.resume(id)?;
    println!("Resumed task {id}");
    Ok(())
}
