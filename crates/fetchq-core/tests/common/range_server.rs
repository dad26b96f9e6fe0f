//! Minimal HTTP/1.1 server for integration tests.
//!
//! Serves one static body, one request per connection. Range GETs get
//! `206 Partial Content` with `Content-Range`; the options below simulate the
//! misbehaving servers the engines have to survive.

#![allow(dead_code)]

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct RangeServerOptions {
    /// If false, HEAD returns 405 (simulates servers that block HEAD).
    pub head_allowed: bool,
    /// If false, GET ignores Range and always returns 200 with the full body.
    pub support_ranges: bool,
    /// Honour only the `bytes=0-0` probe; every other range gets a 200.
    pub ranges_only_for_probe: bool,
    pub etag: Option<&'static str>,
    /// Body is written in `chunk_size` pieces with this pause between them.
    pub chunk_delay: Option<Duration>,
    pub chunk_size: usize,
    /// The first non-probe range request sends half its body, then hangs.
    pub stall_first_range: bool,
    /// Every non-probe range request is answered with this status and no body.
    pub fail_ranges_with: Option<u16>,
}

impl Default for RangeServerOptions {
    fn default() -> Self {
        Self {
            head_allowed: true,
            support_ranges: true,
            ranges_only_for_probe: false,
            etag: None,
            chunk_delay: None,
            chunk_size: 4096,
            stall_first_range: false,
            fail_ranges_with: None,
        }
    }
}

/// A running server. It lives until the test process exits.
#[derive(Clone)]
pub struct RangeServer {
    pub url: String,
    body_bytes: Arc<AtomicU64>,
    requests: Arc<AtomicUsize>,
}

impl RangeServer {
    /// Body bytes written for non-probe GETs.
    pub fn body_bytes_served(&self) -> u64 {
        self.body_bytes.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

/// Starts a server serving `body` at `http://127.0.0.1:<port>/<name>`.
pub fn start(body: Vec<u8>, name: &str) -> RangeServer {
    start_with_options(body, name, RangeServerOptions::default())
}

pub fn start_with_options(body: Vec<u8>, name: &str, opts: RangeServerOptions) -> RangeServer {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().unwrap().port();
    let body = Arc::new(body);
    let server = RangeServer {
        url: format!("http://127.0.0.1:{}/{}", port, name),
        body_bytes: Arc::new(AtomicU64::new(0)),
        requests: Arc::new(AtomicUsize::new(0)),
    };
    let stalled = Arc::new(AtomicBool::new(false));
    let shared = server.clone();
    thread::spawn(move || {
        for stream in listener.incoming().flatten() {
            let body = Arc::clone(&body);
            let server = shared.clone();
            let stalled = Arc::clone(&stalled);
            thread::spawn(move || handle(stream, &body, opts, &server, &stalled));
        }
    });
    server
}

fn handle(
    mut stream: TcpStream,
    body: &[u8],
    opts: RangeServerOptions,
    server: &RangeServer,
    stalled: &AtomicBool,
) {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(2)));
    let _ = stream.set_write_timeout(Some(Duration::from_secs(5)));
    let mut buf = [0u8; 8192];
    let n = match stream.read(&mut buf) {
        Ok(0) | Err(_) => return,
        Ok(n) => n,
    };
    let request = match std::str::from_utf8(&buf[..n]) {
        Ok(s) => s,
        Err(_) => return,
    };
    server.requests.fetch_add(1, Ordering::SeqCst);
    let (method, range) = parse_request(request);
    let total = body.len() as u64;
    let etag = opts
        .etag
        .map(|e| format!("ETag: \"{}\"\r\n", e))
        .unwrap_or_default();

    if method.eq_ignore_ascii_case("HEAD") {
        if !opts.head_allowed {
            let _ = stream.write_all(b"HTTP/1.1 405 Method Not Allowed\r\nConnection: close\r\n\r\n");
            return;
        }
        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n{}Connection: close\r\n\r\n",
            total, etag
        );
        let _ = stream.write_all(response.as_bytes());
        return;
    }
    if !method.eq_ignore_ascii_case("GET") {
        let _ = stream.write_all(b"HTTP/1.1 405 Method Not Allowed\r\nConnection: close\r\n\r\n");
        return;
    }

    let is_probe = range == Some((0, 0));
    if let (Some(_), Some(code)) = (range, opts.fail_ranges_with) {
        if !is_probe {
            let response = format!(
                "HTTP/1.1 {} Unavailable\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                code
            );
            let _ = stream.write_all(response.as_bytes());
            return;
        }
    }
    let honour_range = opts.support_ranges && (!opts.ranges_only_for_probe || is_probe);
    let (status, content_range, slice) = match range {
        Some((start, end_incl)) if honour_range => {
            let end_incl = end_incl.min(total.saturating_sub(1));
            if start > end_incl || start >= total {
                let response = format!(
                    "HTTP/1.1 416 Range Not Satisfiable\r\nContent-Range: bytes */{}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                    total
                );
                let _ = stream.write_all(response.as_bytes());
                return;
            }
            let slice = &body[start as usize..=end_incl as usize];
            (
                "206 Partial Content",
                format!("Content-Range: bytes {}-{}/{}\r\n", start, end_incl, total),
                slice,
            )
        }
        _ => ("200 OK", String::new(), body),
    };

    let response = format!(
        "HTTP/1.1 {}\r\nContent-Length: {}\r\n{}{}Connection: close\r\n\r\n",
        status,
        slice.len(),
        content_range,
        etag
    );
    if stream.write_all(response.as_bytes()).is_err() {
        return;
    }

    let counts = !is_probe;
    if counts && range.is_some() && opts.stall_first_range && !stalled.swap(true, Ordering::SeqCst) {
        let half = &slice[..slice.len() / 2];
        if stream.write_all(half).is_ok() {
            let _ = stream.flush();
            server.body_bytes.fetch_add(half.len() as u64, Ordering::SeqCst);
        }
        thread::sleep(Duration::from_secs(10));
        return;
    }

    for chunk in slice.chunks(opts.chunk_size.max(1)) {
        if stream.write_all(chunk).is_err() {
            return;
        }
        if counts {
            server.body_bytes.fetch_add(chunk.len() as u64, Ordering::SeqCst);
        }
        if let Some(delay) = opts.chunk_delay {
            let _ = stream.flush();
            thread::sleep(delay);
        }
    }
}

/// Returns (method, optional (start, end_inclusive) for Range: bytes=X-Y).
fn parse_request(request: &str) -> (&str, Option<(u64, u64)>) {
    let mut method = "";
    let mut range = None;
    for line in request.lines() {
        let line = line.trim();
        if line.is_empty() {
            break;
        }
        if method.is_empty() {
            method = line.split_whitespace().next().unwrap_or("");
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("range") {
                let value = value.trim();
                if value.to_lowercase().starts_with("bytes=") {
                    let part = value[6..].trim();
                    if let Some((a, b)) = part.split_once('-') {
                        let start = a.trim().parse::<u64>().unwrap_or(0);
                        let end = b.trim();
                        let end_incl = if end.is_empty() {
                            u64::MAX
                        } else {
                            end.parse::<u64>().unwrap_or(0)
                        };
                        range = Some((start, end_incl));
                    }
                }
            }
        }
    }
    (method, range)
}
