use rand::Rng;
use std::time::Duration;

use crate::config::{JitterMode, QueueConfig};

/// High-level classification of an error for retry purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Operation timed out (connect/read) or stalled.
    Timeout,
    /// Server asked us to slow down (e.g. 429, 503).
    Throttled,
    /// Network-level failure (connection reset, DNS, etc.).
    Connection,
    /// HTTP status that is retryable but not strictly throttling (5xx).
    Http5xx(u16),
    /// Any other error (not retried).
    Other,
}

impl ErrorKind {
    pub fn is_retryable(self) -> bool {
        !matches!(self, ErrorKind::Other)
    }
}

/// Decision returned by the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    NoRetry,
    RetryAfter(Duration),
}

/// Exponential backoff: `base * 2^(attempt-1)`, capped, then jittered.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: JitterMode,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(30),
            jitter: JitterMode::None,
        }
    }
}

impl Backoff {
    /// Delay before retrying after failed attempt number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = 1u32 << attempt.saturating_sub(1).min(16);
        let delay = self.base_delay.saturating_mul(exp).min(self.max_delay);
        let secs = delay.as_secs_f64();
        if secs <= 0.0 {
            return delay;
        }
        let mut rng = rand::thread_rng();
        match self.jitter {
            JitterMode::None => delay,
            JitterMode::Full => Duration::from_secs_f64(rng.gen_range(0.0..=secs)),
            JitterMode::Equal => {
                let half = secs / 2.0;
                Duration::from_secs_f64(half + rng.gen_range(0.0..=half))
            }
        }
    }
}

/// Attempt budget plus backoff.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first).
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: Backoff::default(),
        }
    }
}

impl RetryPolicy {
    pub fn from_queue(cfg: &QueueConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            backoff: Backoff {
                base_delay: Duration::from_secs_f64(cfg.backoff_base_secs.max(0.0)),
                max_delay: Duration::from_secs_f64(cfg.backoff_max_secs.max(0.0)),
                jitter: cfg.jitter,
            },
        }
    }

    /// Decide whether failed attempt `attempt` (1-based) of kind `kind` gets another try.
    pub fn decide(&self, attempt: u32, kind: ErrorKind) -> RetryDecision {
        if attempt >= self.max_attempts || !kind.is_retryable() {
            return RetryDecision::NoRetry;
        }
        RetryDecision::RetryAfter(self.backoff.delay(attempt))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn retry_delay(p: &RetryPolicy, attempt: u32) -> Duration {
        match p.decide(attempt, ErrorKind::Timeout) {
            RetryDecision::RetryAfter(d) => d,
            RetryDecision::NoRetry => panic!("expected retry"),
        }
    }

    #[test]
    fn no_retry_for_other() {
        let p = RetryPolicy::default();
        assert_eq!(p.decide(1, ErrorKind::Other), RetryDecision::NoRetry);
    }

    #[test]
    fn exponential_backoff_grows_and_is_capped() {
        let mut p = RetryPolicy::default();
        p.max_attempts = 20;
        assert_eq!(retry_delay(&p, 1), Duration::from_millis(250));
        assert_eq!(retry_delay(&p, 2), Duration::from_millis(500));
        assert_eq!(retry_delay(&p, 3), Duration::from_secs(1));
        assert_eq!(retry_delay(&p, 19), p.backoff.max_delay);
    }

    #[test]
    fn respects_max_attempts() {
        let mut p = RetryPolicy::default();
        p.max_attempts = 3;
        assert!(matches!(
            p.decide(1, ErrorKind::Throttled),
            RetryDecision::RetryAfter(_)
        ));
        assert!(matches!(
            p.decide(2, ErrorKind::Throttled),
            RetryDecision::RetryAfter(_)
        ));
        assert_eq!(p.decide(3, ErrorKind::Throttled), RetryDecision::NoRetry);
    }

    #[test]
    fn full_jitter_stays_within_delay() {
        let b = Backoff {
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            jitter: JitterMode::Full,
        };
        for _ in 0..100 {
            assert!(b.delay(2) <= Duration::from_secs(4));
        }
    }

    #[test]
    fn equal_jitter_keeps_lower_half() {
        let b = Backoff {
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            jitter: JitterMode::Equal,
        };
        for _ in 0..100 {
            let d = b.delay(2);
            assert!(d >= Duration::from_secs(2));
            assert!(d <= Duration::from_secs(4));
        }
    }

    #[test]
    fn from_queue_config() {
        let mut cfg = QueueConfig::default();
        cfg.max_attempts = 0;
        cfg.backoff_base_secs = 0.5;
        let p = RetryPolicy::from_queue(&cfg);
        assert_eq!(p.max_attempts, 1);
        assert_eq!(p.backoff.base_delay, Duration::from_millis(500));
    }
}
