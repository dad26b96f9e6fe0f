//! Scheduling conditions.
//!
//! A task is eligible only when every one of its conditions holds against the
//! `SchedulingContext` built once per scheduler tick.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::queue::{TaskId, TaskState};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Condition {
    /// Not before this Unix-millis instant.
    NotBefore { at_ms: u64 },
    /// Only after task `task` completed. Fails if that task failed or was cancelled.
    AfterTask { task: TaskId },
    /// Only while the task's known size is at most `bytes`. Unknown sizes pass.
    SizeAtMost { bytes: u64 },
}

/// Immutable view of the queue used to evaluate conditions.
#[derive(Debug, Clone, Default)]
pub struct SchedulingContext {
    pub now_ms: u64,
    /// State of every task still in the table, plus terminal states from history.
    pub states: HashMap<TaskId, TaskState>,
    /// Known total sizes.
    pub sizes: HashMap<TaskId, u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConditionStatus {
    Ready,
    /// Will hold later without outside action (time, a dependency still running).
    Wait,
    /// Waits on something only a user can unblock (a paused dependency).
    Blocked,
    /// Can never hold; the task fails.
    Unsatisfiable(String),
}

impl ConditionStatus {
    fn rank(&self) -> u8 {
        match self {
            ConditionStatus::Ready => 0,
            ConditionStatus::Wait => 1,
            ConditionStatus::Blocked => 2,
            ConditionStatus::Unsatisfiable(_) => 3,
        }
    }
}

impl Condition {
    pub fn evaluate(&self, task_id: TaskId, ctx: &SchedulingContext) -> ConditionStatus {
        match self {
            Condition::NotBefore { at_ms } => {
                if ctx.now_ms >= *at_ms {
                    ConditionStatus::Ready
                } else {
                    ConditionStatus::Wait
                }
            }
            Condition::AfterTask { task } if *task == task_id => {
                ConditionStatus::Unsatisfiable("task depends on itself".to_string())
            }
            Condition::AfterTask { task } => match ctx.states.get(task) {
                Some(TaskState::Completed) => ConditionStatus::Ready,
                Some(s @ (TaskState::Failed | TaskState::Cancelled)) => {
                    ConditionStatus::Unsatisfiable(format!("dependency task {} ended {}", task, s))
                }
                Some(TaskState::Paused) => ConditionStatus::Blocked,
                Some(_) => ConditionStatus::Wait,
                None => ConditionStatus::Unsatisfiable(format!("dependency task {} not found", task)),
            },
            Condition::SizeAtMost { bytes } => match ctx.sizes.get(&task_id) {
                Some(size) if size > bytes => ConditionStatus::Unsatisfiable(format!(
                    "size {} exceeds limit {}",
                    size, bytes
                )),
                _ => ConditionStatus::Ready,
            },
        }
    }
}

/// Combined status of all conditions; the most restrictive one wins.
pub fn evaluate_all(
    conditions: &[Condition],
    task_id: TaskId,
    ctx: &SchedulingContext,
) -> ConditionStatus {
    conditions
        .iter()
        .map(|c| c.evaluate(task_id, ctx))
        .max_by_key(ConditionStatus::rank)
        .unwrap_or(ConditionStatus::Ready)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> SchedulingContext {
        let mut c = SchedulingContext {
            now_ms: 1_000,
            ..SchedulingContext::default()
        };
        c.states.insert(1, TaskState::Completed);
        c.states.insert(2, TaskState::Failed);
        c.states.insert(3, TaskState::Downloading);
        c.states.insert(4, TaskState::Paused);
        c.sizes.insert(9, 5_000);
        c
    }

    #[test]
    fn time_condition() {
        let c = ctx();
        assert_eq!(Condition::NotBefore { at_ms: 500 }.evaluate(9, &c), ConditionStatus::Ready);
        assert_eq!(Condition::NotBefore { at_ms: 5_000 }.evaluate(9, &c), ConditionStatus::Wait);
    }

    #[test]
    fn dependency_condition() {
        let c = ctx();
        assert_eq!(Condition::AfterTask { task: 1 }.evaluate(9, &c), ConditionStatus::Ready);
        assert_eq!(Condition::AfterTask { task: 3 }.evaluate(9, &c), ConditionStatus::Wait);
        assert_eq!(Condition::AfterTask { task: 4 }.evaluate(9, &c), ConditionStatus::Blocked);
        assert!(matches!(
            Condition::AfterTask { task: 2 }.evaluate(9, &c),
            ConditionStatus::Unsatisfiable(_)
        ));
        assert!(matches!(
            Condition::AfterTask { task: 77 }.evaluate(9, &c),
            ConditionStatus::Unsatisfiable(_)
        ));
    }

    #[test]
    fn size_condition() {
        let c = ctx();
        assert_eq!(Condition::SizeAtMost { bytes: 10_000 }.evaluate(9, &c), ConditionStatus::Ready);
        assert!(matches!(
            Condition::SizeAtMost { bytes: 100 }.evaluate(9, &c),
            ConditionStatus::Unsatisfiable(_)
        ));
        assert_eq!(Condition::SizeAtMost { bytes: 100 }.evaluate(8, &c), ConditionStatus::Ready);
    }

    #[test]
    fn most_restrictive_wins() {
        let c = ctx();
        let conds = vec![
            Condition::NotBefore { at_ms: 0 },
            Condition::AfterTask { task: 3 },
        ];
        assert_eq!(evaluate_all(&conds, 9, &c), ConditionStatus::Wait);
        assert_eq!(evaluate_all(&[], 9, &c), ConditionStatus::Ready);
    }

    #[test]
    fn serde_is_tagged() {
        let json = serde_json::to_string(&Condition::AfterTask { task: 4 }).unwrap();
        assert_eq!(json, r#"{"kind":"after_task","task":4}"#);
    }
}
