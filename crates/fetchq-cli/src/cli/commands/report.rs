//! `fetchq report` – per-task outcome as JSON.

use anyhow::{bail, Result};
use fetchq_core::queue::QueueManager;

pub fn run_report(queue: &QueueManager, strict: bool) -> Result<()> {
    let report = queue.report();
    println!("{}", report.to_json_pretty()?);
    if strict && !report.all_completed() {
        bail!(
            "{} failed, {} cancelled, {} denied, {} incomplete",
            report.failed,
            report.cancelled,
            report.denied,
            report.incomplete
        );
    }
    Ok(())
}
