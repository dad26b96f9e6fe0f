//! Retry and backoff policy.
//!
//! This module encapsulates error classification (timeouts, throttling,
//! connection failures) and exponential backoff decisions so that the queue
//! (task-level retry) and the segment engine (per-segment requeue) share one
//! consistent policy.

mod classify;
mod policy;

pub use classify::{classify, classify_curl_error, classify_http_status};
pub use policy::{Backoff, ErrorKind, RetryDecision, RetryPolicy};
