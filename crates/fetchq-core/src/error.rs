//! Error taxonomy shared by the download engines and the queue.
//!
//! Engines return `FetchError`; the queue worker classifies it (see
//! `retry::classify`) to choose between retry, fallback and terminal failure.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Why a transfer stopped before finishing.
///
/// Ordered by precedence: when several are requested for the same attempt,
/// the highest one is reported (a cancel always beats a pause).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterruptReason {
    Paused,
    TimedOut,
    Cancelled,
}

impl fmt::Display for InterruptReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InterruptReason::Paused => write!(f, "paused"),
            InterruptReason::TimedOut => write!(f, "timed out"),
            InterruptReason::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// Connection refused/reset, DNS failure, short read.
    #[error("transport error: {0}")]
    Transport(String),
    /// Connect or read timeout, or a stalled segment.
    #[error("timeout: {0}")]
    Timeout(String),
    /// The request could not be built or sent (bad URL, unsupported scheme).
    #[error("request error: {0}")]
    Request(String),
    #[error("HTTP {status}")]
    Http { status: u32 },
    /// Server broke the range contract (e.g. 200 instead of 206).
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    /// Size or hash mismatch; no artifact is left at the destination.
    #[error("integrity error: {0}")]
    Integrity(String),
    /// Persisted resume state does not match the server or the disk.
    #[error("resume state invalid: {0}")]
    ResumeStateInvalid(String),
    #[error("denied by policy [{code}]: {reason}")]
    PolicyDenied { code: String, reason: String },
    #[error("unsafe path: {0}")]
    UnsafePath(String),
    #[error("download {0}")]
    Interrupted(InterruptReason),
    #[error("storage: {0}")]
    Storage(#[from] std::io::Error),
    #[error("resume state encoding: {0}")]
    Encoding(#[from] serde_json::Error),
}

impl FetchError {
    /// Map a libcurl error onto the taxonomy.
    pub fn from_curl(e: &curl::Error) -> Self {
        use crate::retry::{classify_curl_error, ErrorKind};
        match classify_curl_error(e) {
            ErrorKind::Timeout => FetchError::Timeout(e.to_string()),
            ErrorKind::Connection => FetchError::Transport(e.to_string()),
            _ => FetchError::Request(e.to_string()),
        }
    }

    /// Whether a fresh attempt may succeed (transport, timeout, 5xx, 429).
    pub fn is_retryable(&self) -> bool {
        crate::retry::classify(self).is_retryable()
    }

    pub fn interrupt_reason(&self) -> Option<InterruptReason> {
        match self {
            FetchError::Interrupted(r) => Some(*r),
            _ => None,
        }
    }
}

impl From<curl::Error> for FetchError {
    fn from(e: curl::Error) -> Self {
        FetchError::from_curl(&e)
    }
}
