//! Server capability detection.
//!
//! A HEAD request is sent first as a hint (failures are ignored). The
//! definitive check is a `GET` with `Range: bytes=0-0` and
//! `Accept-Encoding: identity`: range support is declared only for a `206`
//! response that carries `Content-Range`. `Accept-Ranges: bytes` alone is not
//! trusted. When the server answers `200` the body is cut off after 1 KiB so a
//! probe never pulls the whole file.

mod parse;

pub use parse::{parse_content_range, ContentRange, ResponseHead};
pub(crate) use parse::parse_headers;

use std::str;

use crate::error::FetchError;
use crate::http::HttpOptions;

/// Body bytes accepted from a probe before the connection is dropped.
pub const PROBE_BODY_LIMIT: usize = 1024;

/// What the server told us about a resource. Not persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerCapability {
    pub supports_range: bool,
    pub content_length: Option<u64>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub content_type: Option<String>,
}

/// Probes `url`. Never fails: any error degrades to "no range support" so the
/// caller falls back to a single connection.
pub fn probe(url: &str, http: &HttpOptions) -> ServerCapability {
    let hint = match head_request(url, http) {
        Ok(h) => Some(h),
        Err(e) => {
            tracing::debug!(url, error = %e, "HEAD hint failed; relying on range probe");
            None
        }
    };

    match range_probe(url, http) {
        Ok(head) => capability_from(&head, hint.as_ref()),
        Err(e) => {
            tracing::warn!(url, error = %e, "range probe failed; assuming no range support");
            let mut cap = hint
                .as_ref()
                .map(|h| capability_from(h, None))
                .unwrap_or_default();
            cap.supports_range = false;
            cap
        }
    }
}

/// Combines the definitive range probe response with the optional HEAD hint.
fn capability_from(probe: &ResponseHead, hint: Option<&ResponseHead>) -> ServerCapability {
    let status = probe.status.unwrap_or(0);
    let supports_range = status == 206 && probe.content_range.is_some();

    let content_length = if status == 206 {
        probe.content_range.and_then(|r| r.total)
    } else if (200..300).contains(&status) {
        probe.content_length
    } else {
        None
    }
    .or_else(|| hint.and_then(|h| h.content_length));

    ServerCapability {
        supports_range,
        content_length,
        etag: probe.etag.clone().or_else(|| hint.and_then(|h| h.etag.clone())),
        last_modified: probe
            .last_modified
            .clone()
            .or_else(|| hint.and_then(|h| h.last_modified.clone())),
        content_type: probe
            .content_type
            .clone()
            .or_else(|| hint.and_then(|h| h.content_type.clone())),
    }
}

fn head_request(url: &str, http: &HttpOptions) -> Result<ResponseHead, FetchError> {
    let mut headers: Vec<String> = Vec::new();

    let mut easy = curl::easy::Easy::new();
    easy.url(url)?;
    easy.nobody(true)?;
    http.apply(&mut easy, &[])?;
    easy.timeout(http.connect_timeout.saturating_mul(2))?;

    {
        let mut transfer = easy.transfer();
        transfer.header_function(|data| {
            if let Ok(s) = str::from_utf8(data) {
                headers.push(s.trim_end().to_string());
            }
            true
        })?;
        transfer.perform()?;
    }

    let code = easy.response_code()?;
    if !(200..300).contains(&code) {
        return Err(FetchError::Http { status: code });
    }
    Ok(parse_headers(&headers))
}

fn range_probe(url: &str, http: &HttpOptions) -> Result<ResponseHead, FetchError> {
    let mut headers: Vec<String> = Vec::new();
    let mut received = 0usize;
    let mut truncated = false;

    let mut easy = curl::easy::Easy::new();
    easy.url(url)?;
    http.apply(&mut easy, &["Accept-Encoding: identity"])?;
    easy.range("0-0")?;
    easy.timeout(http.connect_timeout.saturating_mul(2))?;

    let result = {
        let mut transfer = easy.transfer();
        transfer.header_function(|data| {
            if let Ok(s) = str::from_utf8(data) {
                headers.push(s.trim_end().to_string());
            }
            true
        })?;
        transfer.write_function(|data| {
            received += data.len();
            if received > PROBE_BODY_LIMIT {
                truncated = true;
                // Returning a short count makes curl drop the connection.
                return Ok(0);
            }
            Ok(data.len())
        })?;
        transfer.perform()
    };

    if let Err(e) = result {
        if !(truncated && e.is_write_error()) {
            return Err(FetchError::from_curl(&e));
        }
        tracing::debug!(url, "range probe got a full body; closed after {} bytes", PROBE_BODY_LIMIT);
    }

    Ok(parse_headers(&headers))
}
