use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

/// Jitter applied to exponential backoff delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JitterMode {
    /// Deterministic delay.
    #[default]
    None,
    /// Uniform in `[0, delay]`.
    Full,
    /// `delay/2 + uniform[0, delay/2]`.
    Equal,
}

/// Download engine tuning (`[engine]` in config.toml).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Files smaller than this are always fetched with a single connection.
    pub min_multi_size: u64,
    /// Lower bound for one segment; segments grow to `total / connections` for big files.
    pub segment_size: u64,
    /// Connections used when a task does not ask for a specific number.
    pub max_connections: usize,
    /// A segment with no received bytes for this long is aborted and requeued.
    pub stall_timeout_secs: f64,
    /// Extra attempts per segment (stalls, resets, 5xx) before the whole download fails.
    pub segment_retries: u32,
    /// How often resume state is checkpointed during a transfer.
    pub checkpoint_interval_secs: f64,
    pub connect_timeout_secs: u64,
    /// Abort a transfer that stays below 1 KiB/s for this long.
    pub low_speed_time_secs: u64,
    /// Optional overall receive cap in bytes per second, split across connections.
    pub max_bytes_per_sec: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            min_multi_size: 8 * 1024 * 1024,
            segment_size: 1024 * 1024,
            max_connections: 4,
            stall_timeout_secs: 30.0,
            segment_retries: 3,
            checkpoint_interval_secs: 5.0,
            connect_timeout_secs: 30,
            low_speed_time_secs: 60,
            max_bytes_per_sec: None,
        }
    }
}

impl EngineConfig {
    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.stall_timeout_secs.max(0.0))
    }

    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_secs_f64(self.checkpoint_interval_secs.max(0.0))
    }
}

/// Queue and scheduler behaviour (`[queue]` in config.toml).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Global cap on tasks in STARTING or DOWNLOADING.
    pub max_concurrent: usize,
    /// Optional cap on active tasks per host.
    pub per_host_limit: Option<usize>,
    pub poll_interval_ms: u64,
    /// Pending tasks gain `aging_step` effective priority every interval.
    pub aging_interval_secs: f64,
    pub aging_step: i32,
    /// Upper bound on the aging boost above the base priority.
    pub aging_max_boost: i32,
    pub retry_enabled: bool,
    /// Default attempts per task (including the first).
    pub max_attempts: u32,
    pub backoff_base_secs: f64,
    pub backoff_max_secs: f64,
    pub jitter: JitterMode,
    /// Wall-clock limit for one attempt of a task. Unset means no queue-level timeout.
    pub task_timeout_secs: Option<f64>,
    /// Terminal tasks kept in the history list.
    pub history_limit: usize,
    /// Base directory for tasks enqueued without an absolute destination.
    pub download_dir: Option<PathBuf>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            per_host_limit: None,
            poll_interval_ms: 100,
            aging_interval_secs: 30.0,
            aging_step: 1,
            aging_max_boost: 10,
            retry_enabled: true,
            max_attempts: 3,
            backoff_base_secs: 1.0,
            backoff_max_secs: 60.0,
            jitter: JitterMode::None,
            task_timeout_secs: None,
            history_limit: 200,
            download_dir: None,
        }
    }
}

impl QueueConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn aging_interval(&self) -> Duration {
        Duration::from_secs_f64(self.aging_interval_secs.max(0.0))
    }

    pub fn download_dir(&self) -> PathBuf {
        self.download_dir.clone().unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn task_timeout(&self) -> Option<Duration> {
        self.task_timeout_secs
            .filter(|s| *s > 0.0)
            .map(Duration::from_secs_f64)
    }
}

/// Snapshot persistence (`[persistence]` in config.toml).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub enabled: bool,
    /// Defaults to `$XDG_STATE_HOME/fetchq/queue.json`.
    pub snapshot_path: Option<PathBuf>,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            snapshot_path: None,
        }
    }
}

impl PersistenceConfig {
    /// Resolved snapshot path, falling back to the XDG state directory.
    pub fn resolve_snapshot_path(&self) -> Result<PathBuf> {
        if let Some(p) = &self.snapshot_path {
            return Ok(p.clone());
        }
        let xdg_dirs = xdg::BaseDirectories::with_prefix("fetchq")?;
        Ok(xdg_dirs.get_state_home().join("queue.json"))
    }
}

/// Global configuration loaded from `~/.config/fetchq/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchqConfig {
    pub engine: EngineConfig,
    pub queue: QueueConfig,
    pub persistence: PersistenceConfig,
}

pub fn config_path() -> Result<PathBuf> {
    let xdg_dirs = xdg::BaseDirectories::with_prefix("fetchq")?;
    Ok(xdg_dirs.place_config_file("config.toml")?)
}

/// Load configuration from disk, creating a default file if none exists.
pub fn load_or_init() -> Result<FetchqConfig> {
    let path = config_path()?;
    if !path.exists() {
        let default_cfg = FetchqConfig::default();
        let toml = toml::to_string_pretty(&default_cfg)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, toml)?;
        tracing::info!("created default config at {}", path.display());
        return Ok(default_cfg);
    }

    let data = fs::read_to_string(&path)?;
    let cfg: FetchqConfig = toml::from_str(&data)?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let cfg = FetchqConfig::default();
        assert_eq!(cfg.engine.min_multi_size, 8 * 1024 * 1024);
        assert_eq!(cfg.engine.max_connections, 4);
        assert_eq!(cfg.engine.stall_timeout(), Duration::from_secs(30));
        assert_eq!(cfg.queue.max_concurrent, 3);
        assert!(cfg.queue.retry_enabled);
        assert!(cfg.queue.task_timeout().is_none());
        assert!(cfg.persistence.enabled);
    }

    #[test]
    fn config_toml_roundtrip() {
        let cfg = FetchqConfig::default();
        let toml = toml::to_string_pretty(&cfg).unwrap();
        let parsed: FetchqConfig = toml::from_str(&toml).unwrap();
        assert_eq!(parsed.engine.segment_size, cfg.engine.segment_size);
        assert_eq!(parsed.queue.max_attempts, cfg.queue.max_attempts);
        assert_eq!(parsed.queue.jitter, cfg.queue.jitter);
    }

    #[test]
    fn partial_sections_use_defaults() {
        let toml = r#"
            [queue]
            max_concurrent = 8
            per_host_limit = 2
            jitter = "equal"
            task_timeout_secs = 600.0

            [engine]
            max_bytes_per_sec = 1_000_000
        "#;
        let cfg: FetchqConfig = toml::from_str(toml).unwrap();
        assert_eq!(cfg.queue.max_concurrent, 8);
        assert_eq!(cfg.queue.per_host_limit, Some(2));
        assert_eq!(cfg.queue.jitter, JitterMode::Equal);
        assert_eq!(cfg.queue.task_timeout(), Some(Duration::from_secs(600)));
        assert_eq!(cfg.queue.max_attempts, 3);
        assert_eq!(cfg.engine.max_bytes_per_sec, Some(1_000_000));
        assert_eq!(cfg.engine.segment_retries, 3);
        assert!(cfg.persistence.snapshot_path.is_none());
    }

    #[test]
    fn explicit_snapshot_path_wins() {
        let toml = r#"
            [persistence]
            enabled = false
            snapshot_path = "/var/lib/fetchq/queue.json"
        "#;
        let cfg: FetchqConfig = toml::from_str(toml).unwrap();
        assert!(!cfg.persistence.enabled);
        assert_eq!(
            cfg.persistence.resolve_snapshot_path().unwrap(),
            PathBuf::from("/var/lib/fetchq/queue.json")
        );
    }
}
