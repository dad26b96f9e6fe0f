//! `fetchq status` – show all tasks.

use fetchq_core::queue::QueueManager;

pub fn run_status(queue: &QueueManager) {
    let tasks = queue.list();
    if tasks.is_empty() {
        println!("No tasks in queue.");
        return;
    }
    println!(
        "{:<6} {:<12} {:<5} {:<8} {:<12} {}",
        "ID", "STATE", "PRIO", "TRIES", "PROGRESS", "URL"
    );
    for t in tasks {
        let progress = match t.total_size {
            Some(_) => format!("{:.1}%", t.progress),
            None => "-".to_string(),
        };
        println!(
            "{:<6} {:<12} {:<5} {:<8} {:<12} {}",
            t.id,
            t.state,
            t.effective_priority,
            format!("{}/{}", t.attempt, t.max_attempts),
            progress,
            t.url
        );
        if let Some(err) = &t.last_error {
            println!("       last error: {}", err);
        }
    }
}
