//! Shared libcurl handle setup for probes, segment workers and single streams.

use std::collections::HashMap;
use std::time::Duration;

use crate::config::EngineConfig;

/// Per-handle curl options derived from engine config.
#[derive(Debug, Clone)]
pub struct HttpOptions {
    pub connect_timeout: Duration,
    /// Abort if throughput stays under `low_speed_limit` bytes/s for this long.
    pub low_speed_time: Duration,
    pub low_speed_limit: u32,
    /// Hard cap on a single transfer so a completely stuck connection eventually fails.
    pub max_transfer_time: Duration,
    pub max_recv_speed: Option<u64>,
    pub headers: HashMap<String, String>,
}

impl Default for HttpOptions {
    fn default() -> Self {
        Self::from_engine(&EngineConfig::default())
    }
}

impl HttpOptions {
    pub fn from_engine(cfg: &EngineConfig) -> Self {
        Self {
            connect_timeout: Duration::from_secs(cfg.connect_timeout_secs),
            low_speed_time: Duration::from_secs(cfg.low_speed_time_secs),
            low_speed_limit: 1024,
            max_transfer_time: Duration::from_secs(6 * 3600),
            max_recv_speed: cfg.max_bytes_per_sec,
            headers: HashMap::new(),
        }
    }

    /// Options for one of `connections` parallel handles: the receive cap is split evenly.
    pub fn per_connection(&self, connections: usize) -> Self {
        let mut o = self.clone();
        o.max_recv_speed = self
            .max_recv_speed
            .map(|total| (total / connections.max(1) as u64).max(1));
        o
    }

    /// Applies timeouts, redirects, rate cap and extra headers to a fresh handle.
    /// `extra` is appended after the configured headers.
    pub fn apply(&self, easy: &mut curl::easy::Easy, extra: &[&str]) -> Result<(), curl::Error> {
        easy.follow_location(true)?;
        easy.max_redirections(10)?;
        easy.connect_timeout(self.connect_timeout)?;
        easy.low_speed_limit(self.low_speed_limit)?;
        easy.low_speed_time(self.low_speed_time)?;
        easy.timeout(self.max_transfer_time)?;
        if let Some(speed) = self.max_recv_speed {
            easy.max_recv_speed(speed)?;
        }

        if self.headers.is_empty() && extra.is_empty() {
            return Ok(());
        }
        let mut list = curl::easy::List::new();
        for (k, v) in &self.headers {
            list.append(&format!("{}: {}", k.trim(), v.trim()))?;
        }
        for h in extra {
            list.append(h)?;
        }
        easy.http_headers(list)?;
        Ok(())
    }
}

/// Parses an HTTP status line (`HTTP/1.1 206 Partial Content`) into its code.
pub(crate) fn parse_status_line(line: &str) -> Option<u32> {
    let line = line.trim();
    if !line.starts_with("HTTP/") {
        return None;
    }
    line.split_whitespace().nth(1)?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_connection_splits_rate_cap() {
        let mut o = HttpOptions::default();
        o.max_recv_speed = Some(1000);
        assert_eq!(o.per_connection(4).max_recv_speed, Some(250));
        assert_eq!(o.per_connection(0).max_recv_speed, Some(1000));
        o.max_recv_speed = None;
        assert_eq!(o.per_connection(4).max_recv_speed, None);
    }

    #[test]
    fn status_line_parsing() {
        assert_eq!(parse_status_line("HTTP/1.1 206 Partial Content"), Some(206));
        assert_eq!(parse_status_line("HTTP/2 200"), Some(200));
        assert_eq!(parse_status_line("Content-Length: 5"), None);
    }
}
