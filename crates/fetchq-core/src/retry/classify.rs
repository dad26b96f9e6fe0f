//! Classify HTTP status, curl errors and engine errors into retry kinds.

use crate::error::{FetchError, InterruptReason};
use crate::retry::policy::ErrorKind;

/// Classify an HTTP status code for retry decisions.
pub fn classify_http_status(code: u32) -> ErrorKind {
    match code {
        429 | 503 => ErrorKind::Throttled,
        500..=599 => ErrorKind::Http5xx(code as u16),
        _ => ErrorKind::Other,
    }
}

/// Classify a curl error for retry decisions.
pub fn classify_curl_error(e: &curl::Error) -> ErrorKind {
    if e.is_operation_timedout() {
        return ErrorKind::Timeout;
    }
    if e.is_couldnt_connect()
        || e.is_couldnt_resolve_host()
        || e.is_couldnt_resolve_proxy()
        || e.is_read_error()
        || e.is_recv_error()
        || e.is_send_error()
        || e.is_got_nothing()
        || e.is_partial_file()
        || e.is_ssl_connect_error()
    {
        return ErrorKind::Connection;
    }
    ErrorKind::Other
}

/// Classify an engine error. Integrity, protocol, policy and storage failures
/// are never retried; neither are user pauses and cancels.
pub fn classify(e: &FetchError) -> ErrorKind {
    match e {
        FetchError::Transport(_) => ErrorKind::Connection,
        FetchError::Timeout(_) => ErrorKind::Timeout,
        FetchError::Interrupted(InterruptReason::TimedOut) => ErrorKind::Timeout,
        FetchError::Http { status } => classify_http_status(*status),
        FetchError::Request(_)
        | FetchError::ProtocolViolation(_)
        | FetchError::Integrity(_)
        | FetchError::ResumeStateInvalid(_)
        | FetchError::PolicyDenied { .. }
        | FetchError::UnsafePath(_)
        | FetchError::Interrupted(_)
        | FetchError::Storage(_)
        | FetchError::Encoding(_) => ErrorKind::Other,
    }
}
