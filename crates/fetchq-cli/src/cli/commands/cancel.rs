//! `fetchq cancel <id>` – cancel a task; resume files stay on disk.

use anyhow::Result;
use fetchq_core::queue::QueueManager;

pub fn run_cancel(queue: &QueueManager, id: u64) -> Result<()> {
    queue.cancel(id)?;
    println!("Cancelled task {id}");
    Ok(())
}
