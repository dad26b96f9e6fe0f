//! Policy engine collaborator.
//!
//! The queue consults a `PolicyEngine` at four hook points: before a task is
//! admitted, before a worker starts, before a retry and before resuming from
//! existing bytes. Decisions only affect the engine through the documented
//! annotation keys below.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::FetchError;
use crate::queue::{EnqueueRequest, TaskId};

/// Enqueue annotation: overrides the requested priority.
pub const ANNOTATION_PRIORITY: &str = "priority";
/// Enqueue/start annotation: caps connections for the task.
pub const ANNOTATION_MAX_CONNECTIONS: &str = "max_connections";
/// Start annotation: caps the receive rate for the task.
pub const ANNOTATION_MAX_BYTES_PER_SEC: &str = "max_bytes_per_sec";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PolicyAction {
    Allow,
    Deny,
    Modify,
}

impl fmt::Display for PolicyAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyAction::Allow => write!(f, "ALLOW"),
            PolicyAction::Deny => write!(f, "DENY"),
            PolicyAction::Modify => write!(f, "MODIFY"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub action: PolicyAction,
    pub reason: Option<String>,
    pub code: Option<String>,
    pub annotations: BTreeMap<String, String>,
}

impl Decision {
    pub fn allow() -> Self {
        Self {
            action: PolicyAction::Allow,
            reason: None,
            code: None,
            annotations: BTreeMap::new(),
        }
    }

    pub fn deny(code: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            action: PolicyAction::Deny,
            reason: Some(reason.into()),
            code: Some(code.into()),
            annotations: BTreeMap::new(),
        }
    }

    pub fn modify(annotations: BTreeMap<String, String>) -> Self {
        Self {
            action: PolicyAction::Modify,
            reason: None,
            code: None,
            annotations,
        }
    }

    pub fn is_denied(&self) -> bool {
        self.action == PolicyAction::Deny
    }

    /// Numeric annotation, ignored unless the action is MODIFY.
    pub fn annotation_u64(&self, key: &str) -> Option<u64> {
        if self.action != PolicyAction::Modify {
            return None;
        }
        self.annotations.get(key)?.trim().parse().ok()
    }

    pub fn annotation_i32(&self, key: &str) -> Option<i32> {
        if self.action != PolicyAction::Modify {
            return None;
        }
        self.annotations.get(key)?.trim().parse().ok()
    }

    /// Converts a DENY into the error surfaced to callers.
    pub fn into_denied_error(self) -> FetchError {
        FetchError::PolicyDenied {
            code: self.code.unwrap_or_else(|| "DENIED".to_string()),
            reason: self.reason.unwrap_or_else(|| "denied by policy".to_string()),
        }
    }

    pub(crate) fn log(&self, hook: &str, task_id: TaskId) {
        match self.action {
            PolicyAction::Allow => tracing::debug!(hook, task_id, "policy ALLOW"),
            _ => tracing::info!(
                hook,
                task_id,
                action = %self.action,
                code = self.code.as_deref().unwrap_or(""),
                reason = self.reason.as_deref().unwrap_or(""),
                annotations = ?self.annotations,
                "policy decision"
            ),
        }
    }
}

/// Hook points consulted by the queue. Every hook allows by default.
pub trait PolicyEngine: Send + Sync {
    fn check_enqueue(
        &self,
        _task_id: TaskId,
        _url: &str,
        _destination: &Path,
        _opts: &EnqueueRequest,
    ) -> Decision {
        Decision::allow()
    }

    fn check_start(&self, _task_id: TaskId, _url: &str) -> Decision {
        Decision::allow()
    }

    fn check_retry(
        &self,
        _task_id: TaskId,
        _attempt: u32,
        _max_attempts: u32,
        _error: &FetchError,
    ) -> Decision {
        Decision::allow()
    }

    fn check_resume(&self, _task_id: TaskId, _url: &str, _path: &Path, _current_size: u64) -> Decision {
        Decision::allow()
    }
}

/// Policy engine that allows everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl PolicyEngine for AllowAll {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn annotations_only_apply_to_modify() {
        let mut ann = BTreeMap::new();
        ann.insert(ANNOTATION_MAX_CONNECTIONS.to_string(), " 2 ".to_string());
        ann.insert(ANNOTATION_PRIORITY.to_string(), "-5".to_string());
        let d = Decision::modify(ann.clone());
        assert_eq!(d.annotation_u64(ANNOTATION_MAX_CONNECTIONS), Some(2));
        assert_eq!(d.annotation_i32(ANNOTATION_PRIORITY), Some(-5));
        assert_eq!(d.annotation_u64(ANNOTATION_MAX_BYTES_PER_SEC), None);

        let mut allow = Decision::allow();
        allow.annotations = ann;
        assert_eq!(allow.annotation_u64(ANNOTATION_MAX_CONNECTIONS), None);
    }

    #[test]
    fn deny_carries_code_and_reason() {
        let d = Decision::deny("HOST_BLOCKED", "host is blocked");
        assert!(d.is_denied());
        match d.into_denied_error() {
            FetchError::PolicyDenied { code, reason } => {
                assert_eq!(code, "HOST_BLOCKED");
                assert_eq!(reason, "host is blocked");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn allow_all_allows() {
        let p = AllowAll;
        assert_eq!(p.check_start(1, "http://h/x"), Decision::allow());
        assert!(!p
            .check_retry(1, 1, 3, &FetchError::Timeout("t".into()))
            .is_denied());
        assert!(!p.check_resume(1, "http://h/x", Path::new("/tmp/x"), 10).is_denied());
    }
}
