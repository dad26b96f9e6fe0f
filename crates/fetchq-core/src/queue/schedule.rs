//! One scheduler tick over the task table.
//!
//! Order of work: expired RETRY_WAIT back to PENDING, priority aging,
//! condition evaluation, then admission by effective priority (FIFO on ties)
//! under the global and per-host caps.

use std::cmp::Reverse;
use std::collections::HashMap;

use crate::config::QueueConfig;
use crate::queue::condition::{evaluate_all, ConditionStatus, SchedulingContext};
use crate::queue::table::TaskTable;
use crate::queue::{TaskId, TaskState};
use crate::report::ItemStatus;

#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct TickOutcome {
    /// Tasks moved to STARTING, in admission order.
    pub started: Vec<TaskId>,
    /// Tasks failed because a condition can never hold.
    pub failed: Vec<TaskId>,
    /// Any state transition happened (the snapshot must be written).
    pub changed: bool,
}

pub(crate) fn context(table: &TaskTable, now_ms: u64) -> SchedulingContext {
    let mut states = HashMap::new();
    for entry in &table.history {
        let state = match entry.item.status {
            ItemStatus::Completed => TaskState::Completed,
            ItemStatus::Cancelled => TaskState::Cancelled,
            ItemStatus::Failed | ItemStatus::Denied => TaskState::Failed,
            ItemStatus::Incomplete => continue,
        };
        states.insert(entry.item.task_id, state);
    }
    let mut sizes = HashMap::new();
    for (id, task) in &table.tasks {
        states.insert(*id, task.state);
        if let Some(size) = task.total_size {
            sizes.insert(*id, size);
        }
    }
    SchedulingContext {
        now_ms,
        states,
        sizes,
    }
}

fn apply_aging(table: &mut TaskTable, cfg: &QueueConfig, now_ms: u64) {
    let interval_ms = cfg.aging_interval().as_millis() as u64;
    if interval_ms == 0 || cfg.aging_step == 0 {
        return;
    }
    for task in table.tasks.values_mut() {
        if task.state != TaskState::Pending {
            continue;
        }
        let steps = now_ms.saturating_sub(task.last_aged_at) / interval_ms;
        if steps == 0 {
            continue;
        }
        let cap = task.priority.saturating_add(cfg.aging_max_boost.max(0));
        let boost = cfg.aging_step.saturating_mul(steps.min(i32::MAX as u64) as i32);
        let aged = task.effective_priority.saturating_add(boost).min(cap);
        if aged != task.effective_priority {
            tracing::debug!(task_id = task.id, from = task.effective_priority, to = aged, "priority aged");
        }
        task.effective_priority = aged;
        task.last_aged_at += steps * interval_ms;
    }
}

pub(crate) fn tick(table: &mut TaskTable, cfg: &QueueConfig, now_ms: u64) -> TickOutcome {
    let mut out = TickOutcome::default();

    for task in table.tasks.values_mut() {
        if task.state == TaskState::RetryWait
            && task.next_eligible_at.map_or(true, |at| at <= now_ms)
            && task.transition(TaskState::Pending, now_ms)
        {
            out.changed = true;
        }
    }

    apply_aging(table, cfg, now_ms);

    let ctx = context(table, now_ms);
    let mut ready = Vec::new();
    for task in table.tasks.values_mut() {
        if task.state != TaskState::Pending {
            continue;
        }
        match evaluate_all(&task.conditions, task.id, &ctx) {
            ConditionStatus::Ready => ready.push((Reverse(task.effective_priority), task.created_at, task.id)),
            ConditionStatus::Wait | ConditionStatus::Blocked => {}
            ConditionStatus::Unsatisfiable(reason) => {
                tracing::info!(task_id = task.id, %reason, "scheduling condition can never hold");
                if task.transition(TaskState::Failed, now_ms) {
                    task.last_error = Some(reason);
                    out.failed.push(task.id);
                    out.changed = true;
                }
            }
        }
    }
    ready.sort();

    let mut active = 0usize;
    let mut per_host: HashMap<String, usize> = HashMap::new();
    for task in table.tasks.values().filter(|t| t.state.is_active()) {
        active += 1;
        if let Some(host) = &task.host {
            *per_host.entry(host.clone()).or_default() += 1;
        }
    }

    let max_concurrent = cfg.max_concurrent.max(1);
    for (_, _, id) in ready {
        if active >= max_concurrent {
            break;
        }
        let Some(task) = table.tasks.get_mut(&id) else {
            continue;
        };
        if let (Some(limit), Some(host)) = (cfg.per_host_limit, task.host.as_ref()) {
            if per_host.get(host).copied().unwrap_or(0) >= limit.max(1) {
                continue;
            }
        }
        if task.transition(TaskState::Starting, now_ms) {
            active += 1;
            if let Some(host) = &task.host {
                *per_host.entry(host.clone()).or_default() += 1;
            }
            out.started.push(id);
            out.changed = true;
        }
    }

    out
}

/// True while something may still be scheduled without user action.
pub(crate) fn has_pending_work(table: &TaskTable, now_ms: u64) -> bool {
    let ctx = context(table, now_ms);
    table.tasks.values().any(|t| match t.state {
        TaskState::Starting | TaskState::Downloading | TaskState::RetryWait => true,
        TaskState::Pending => !matches!(
            evaluate_all(&t.conditions, t.id, &ctx),
            ConditionStatus::Blocked
        ),
        _ => false,
    })
}
