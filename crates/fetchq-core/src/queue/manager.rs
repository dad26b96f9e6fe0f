//! Queue manager: the public face of the queue.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tokio::task::JoinSet;

use crate::config::QueueConfig;
use crate::control::TaskControl;
use crate::downloader::{Downloader, ModePreference};
use crate::error::{FetchError, InterruptReason};
use crate::policy::{AllowAll, PolicyEngine, ANNOTATION_MAX_CONNECTIONS, ANNOTATION_PRIORITY};
use crate::queue::table::TaskTable;
use crate::queue::{
    config_fingerprint, schedule, worker, Condition, HistoryEntry, QueueError, QueueSnapshot,
    Task, TaskId, TaskState,
};
use crate::report::{BatchReport, ItemReport};
use crate::retry::RetryPolicy;
use crate::security::{filename_from_url, DefaultSecurity, Security, DEFAULT_FILENAME};
use crate::storage;

/// Everything a caller can say about a new task.
#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    pub url: String,
    /// Absolute path, path relative to the download dir, or `None` to derive
    /// the file name from the URL.
    pub destination: Option<PathBuf>,
    pub priority: i32,
    pub mode: ModePreference,
    pub connections: Option<usize>,
    /// Overrides `QueueConfig::max_attempts`.
    pub max_attempts: Option<u32>,
    pub expected_sha256: Option<String>,
    pub conditions: Vec<Condition>,
}

impl EnqueueRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            destination: None,
            priority: 0,
            mode: ModePreference::Auto,
            connections: None,
            max_attempts: None,
            expected_sha256: None,
            conditions: Vec::new(),
        }
    }

    pub fn destination(mut self, path: impl Into<PathBuf>) -> Self {
        self.destination = Some(path.into());
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn mode(mut self, mode: ModePreference) -> Self {
        self.mode = mode;
        self
    }

    pub fn connections(mut self, n: usize) -> Self {
        self.connections = Some(n.max(1));
        self
    }

    pub fn max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = Some(n.max(1));
        self
    }

    pub fn expected_sha256(mut self, digest: impl Into<String>) -> Self {
        self.expected_sha256 = Some(digest.into());
        self
    }

    pub fn condition(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }
}

/// What one `run`/`run_until_idle` call did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub started: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub paused: usize,
    pub retries_scheduled: usize,
    pub interrupted: bool,
}

pub(crate) struct Shared {
    pub table: Mutex<TaskTable>,
    pub cfg: QueueConfig,
    pub retry: RetryPolicy,
    pub snapshot_path: Option<PathBuf>,
    pub fingerprint: String,
    pub policy: Arc<dyn PolicyEngine>,
    pub security: Arc<dyn Security>,
    pub downloader: Arc<dyn Downloader>,
    pub control: TaskControl,
}

impl Shared {
    pub fn lock(&self) -> MutexGuard<'_, TaskTable> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Writes the snapshot when persistence is configured.
    pub fn persist(&self, table: &TaskTable) -> Result<(), QueueError> {
        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };
        table
            .to_snapshot(&self.fingerprint, storage::unix_millis())
            .save(path)
            .map_err(|e| {
                tracing::error!(path = %path.display(), error = %e, "queue snapshot write failed");
                e
            })
    }
}

pub struct QueueManagerBuilder {
    cfg: QueueConfig,
    downloader: Arc<dyn Downloader>,
    policy: Arc<dyn PolicyEngine>,
    security: Arc<dyn Security>,
    snapshot_path: Option<PathBuf>,
}

impl QueueManagerBuilder {
    pub fn policy(mut self, policy: Arc<dyn PolicyEngine>) -> Self {
        self.policy = policy;
        self
    }

    pub fn security(mut self, security: Arc<dyn Security>) -> Self {
        self.security = security;
        self
    }

    /// Where the queue snapshot lives. `None` keeps the queue in memory only.
    pub fn snapshot_path(mut self, path: Option<PathBuf>) -> Self {
        self.snapshot_path = path;
        self
    }

    /// Loads and recovers the snapshot, if any.
    pub fn build(self) -> Result<QueueManager, QueueError> {
        let fingerprint = config_fingerprint(&self.cfg);
        let mut rewritten = 0;
        let table = match &self.snapshot_path {
            Some(path) => match QueueSnapshot::load(path)? {
                Some(mut snapshot) => {
                    if snapshot.config_fingerprint != fingerprint {
                        tracing::info!(
                            path = %path.display(),
                            "queue config changed since the snapshot was written"
                        );
                    }
                    rewritten = snapshot.recover(storage::unix_millis());
                    tracing::info!(
                        path = %path.display(),
                        tasks = snapshot.tasks.len(),
                        recovered = rewritten,
                        "loaded queue snapshot"
                    );
                    TaskTable::from_snapshot(snapshot)
                }
                None => TaskTable::new(),
            },
            None => TaskTable::new(),
        };

        let shared = Shared {
            table: Mutex::new(table),
            retry: RetryPolicy::from_queue(&self.cfg),
            cfg: self.cfg,
            snapshot_path: self.snapshot_path,
            fingerprint,
            policy: self.policy,
            security: self.security,
            downloader: self.downloader,
            control: TaskControl::new(),
        };
        if rewritten > 0 {
            shared.persist(&shared.lock())?;
        }
        Ok(QueueManager {
            shared: Arc::new(shared),
        })
    }
}

/// Cheap to clone; clones share the same queue.
#[derive(Clone)]
pub struct QueueManager {
    shared: Arc<Shared>,
}

impl QueueManager {
    pub fn builder(cfg: QueueConfig, downloader: Arc<dyn Downloader>) -> QueueManagerBuilder {
        QueueManagerBuilder {
            cfg,
            downloader,
            policy: Arc::new(AllowAll),
            security: Arc::new(DefaultSecurity::default()),
            snapshot_path: None,
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.shared.cfg
    }

    /// Validates, consults the policy and persists a new PENDING task.
    pub fn enqueue(&self, req: EnqueueRequest) -> Result<TaskId, QueueError> {
        let host = parse_host(&req.url)?;
        let (destination, quarantined) = self.resolve_destination(&req)?;
        let risk = self.shared.security.classify_executable_risk(&destination);
        if let Some(label) = risk {
            tracing::warn!(
                url = %req.url,
                destination = %destination.display(),
                risk = %label,
                quarantined,
                "download flagged as risky"
            );
        }

        let now = storage::unix_millis();
        let mut table = self.shared.lock();
        let id = table.allocate_id();

        let decision = self
            .shared
            .policy
            .check_enqueue(id, &req.url, &destination, &req);
        decision.log("check_enqueue", id);
        if decision.is_denied() {
            let code = decision.code.unwrap_or_else(|| "DENIED".to_string());
            let reason = decision.reason.unwrap_or_else(|| "denied by policy".to_string());
            table.push_history(
                HistoryEntry {
                    finished_at: now,
                    item: ItemReport::denied(id, &req.url, &code, &reason),
                },
                self.shared.cfg.history_limit,
            );
            self.shared.persist(&table)?;
            return Err(QueueError::Denied { code, reason });
        }

        let priority = decision
            .annotation_i32(ANNOTATION_PRIORITY)
            .unwrap_or(req.priority);
        let connections = match decision.annotation_u64(ANNOTATION_MAX_CONNECTIONS) {
            Some(cap) => {
                let cap = (cap as usize).max(1);
                Some(req.connections.map_or(cap, |c| c.min(cap)))
            }
            None => req.connections,
        };

        let task = Task {
            id,
            url: req.url.clone(),
            destination: destination.clone(),
            host: Some(host),
            priority,
            effective_priority: priority,
            state: TaskState::Pending,
            mode: req.mode,
            connections_requested: connections,
            attempt: 0,
            max_attempts: req.max_attempts.unwrap_or(self.shared.cfg.max_attempts).max(1),
            next_eligible_at: None,
            progress: 0.0,
            speed: 0.0,
            bytes_done: 0,
            total_size: None,
            last_error: None,
            denial: None,
            expected_sha256: req.expected_sha256.clone(),
            conditions: req.conditions.clone(),
            risk,
            quarantined,
            outcome: None,
            created_at: now,
            updated_at: now,
            last_aged_at: now,
        };
        table.tasks.insert(id, task);
        if let Err(e) = self.shared.persist(&table) {
            table.tasks.remove(&id);
            return Err(e);
        }
        tracing::info!(
            task_id = id,
            url = %req.url,
            destination = %destination.display(),
            priority,
            "task enqueued"
        );
        Ok(id)
    }

    fn resolve_destination(&self, req: &EnqueueRequest) -> Result<(PathBuf, bool), QueueError> {
        let security = &self.shared.security;
        let base = self.shared.cfg.download_dir();
        let sanitized = |name: Option<&std::ffi::OsStr>| {
            name.and_then(|n| n.to_str())
                .map(|n| security.sanitize_filename(n))
                .unwrap_or_else(|| DEFAULT_FILENAME.to_string())
        };

        match &req.destination {
            None => {
                let name = filename_from_url(&req.url)
                    .map(|n| security.sanitize_filename(&n))
                    .unwrap_or_else(|| DEFAULT_FILENAME.to_string());
                let (dir, quarantined) = security.choose_final_dir(&base, &name);
                let path = security
                    .safe_join(&dir, Path::new(&name))
                    .map_err(unsafe_path)?;
                Ok((path, quarantined))
            }
            Some(path) if path.is_absolute() => {
                let name = sanitized(path.file_name());
                let parent = path.parent().unwrap_or_else(|| Path::new("/"));
                let (dir, quarantined) = security.choose_final_dir(parent, &name);
                Ok((dir.join(name), quarantined))
            }
            Some(relative) => {
                let joined = security.safe_join(&base, relative).map_err(unsafe_path)?;
                let name = sanitized(joined.file_name());
                let parent = joined.parent().unwrap_or(base.as_path());
                let (dir, quarantined) = security.choose_final_dir(parent, &name);
                Ok((dir.join(name), quarantined))
            }
        }
    }

    /// PENDING/RETRY_WAIT/STARTING move to PAUSED at once; a DOWNLOADING task
    /// is signalled and reaches PAUSED when its worker stops. A DOWNLOADING
    /// task with no live attempt is paused directly.
    pub fn pause(&self, id: TaskId) -> Result<(), QueueError> {
        let now = storage::unix_millis();
        let mut table = self.shared.lock();
        let task = table.tasks.get_mut(&id).ok_or(QueueError::NotFound(id))?;
        match task.state {
            TaskState::Paused => Ok(()),
            TaskState::Downloading if self.shared.control.request(id, InterruptReason::Paused) => {
                tracing::info!(task_id = id, "pause requested");
                Ok(())
            }
            TaskState::Pending
            | TaskState::RetryWait
            | TaskState::Starting
            | TaskState::Downloading => {
                task.transition(TaskState::Paused, now);
                tracing::info!(task_id = id, "task paused");
                self.shared.persist(&table)
            }
            from => Err(QueueError::InvalidTransition {
                id,
                from,
                op: "pause",
            }),
        }
    }

    /// PAUSED back to PENDING. The next attempt re-probes and resumes from disk.
    pub fn resume(&self, id: TaskId) -> Result<(), QueueError> {
        let now = storage::unix_millis();
        let mut table = self.shared.lock();
        let task = table.tasks.get_mut(&id).ok_or(QueueError::NotFound(id))?;
        if !task.transition(TaskState::Pending, now) {
            return Err(QueueError::InvalidTransition {
                id,
                from: task.state,
                op: "resume",
            });
        }
        tracing::info!(task_id = id, "task resumed");
        self.shared.persist(&table)
    }

    /// Idempotent on CANCELLED. A DOWNLOADING task is signalled; cancel wins
    /// over a transfer that finishes in the meantime.
    pub fn cancel(&self, id: TaskId) -> Result<(), QueueError> {
        let now = storage::unix_millis();
        let mut table = self.shared.lock();
        let task = table.tasks.get_mut(&id).ok_or(QueueError::NotFound(id))?;
        match task.state {
            TaskState::Cancelled => Ok(()),
            TaskState::Downloading if self.shared.control.request(id, InterruptReason::Cancelled) => {
                tracing::info!(task_id = id, "cancel requested");
                Ok(())
            }
            from if from.is_terminal() => Err(QueueError::InvalidTransition {
                id,
                from,
                op: "cancel",
            }),
            _ => {
                task.transition(TaskState::Cancelled, now);
                tracing::info!(task_id = id, "task cancelled");
                table.record_finished(id, now, self.shared.cfg.history_limit);
                self.shared.persist(&table)
            }
        }
    }

    /// Drops a terminal or paused task from the table. Files on disk stay.
    pub fn remove(&self, id: TaskId) -> Result<Task, QueueError> {
        let mut table = self.shared.lock();
        let task = table.tasks.get(&id).ok_or(QueueError::NotFound(id))?;
        if !(task.state.is_terminal() || task.state == TaskState::Paused) {
            return Err(QueueError::InvalidTransition {
                id,
                from: task.state,
                op: "remove",
            });
        }
        let removed = table.tasks.remove(&id).ok_or(QueueError::NotFound(id))?;
        if let Err(e) = self.shared.persist(&table) {
            table.tasks.insert(id, removed);
            return Err(e);
        }
        tracing::info!(task_id = id, "task removed");
        Ok(removed)
    }

    /// Removes every terminal task; they remain in history.
    pub fn clear_finished(&self) -> Result<usize, QueueError> {
        let mut table = self.shared.lock();
        let before = table.tasks.len();
        table.tasks.retain(|_, t| !t.state.is_terminal());
        let removed = before - table.tasks.len();
        if removed > 0 {
            self.shared.persist(&table)?;
        }
        Ok(removed)
    }

    /// Sets the base priority; the accumulated aging boost is kept.
    pub fn set_priority(&self, id: TaskId, priority: i32) -> Result<(), QueueError> {
        let now = storage::unix_millis();
        let mut table = self.shared.lock();
        let task = table.tasks.get_mut(&id).ok_or(QueueError::NotFound(id))?;
        let boost = task.effective_priority.saturating_sub(task.priority).max(0);
        task.priority = priority;
        task.effective_priority = priority.saturating_add(boost);
        task.updated_at = now;
        self.shared.persist(&table)
    }

    pub fn get(&self, id: TaskId) -> Option<Task> {
        let mut table = self.shared.lock();
        mirror_live(&mut table);
        table.tasks.get(&id).cloned()
    }

    pub fn list(&self) -> Vec<Task> {
        let mut table = self.shared.lock();
        mirror_live(&mut table);
        table.tasks.values().cloned().collect()
    }

    pub fn history(&self) -> Vec<HistoryEntry> {
        self.shared.lock().history.iter().cloned().collect()
    }

    /// Every task in the table plus history entries for tasks no longer in it.
    pub fn report(&self) -> BatchReport {
        let table = self.shared.lock();
        let mut items: Vec<ItemReport> = table.tasks.values().map(ItemReport::from_task).collect();
        let mut seen: std::collections::HashSet<TaskId> = table.tasks.keys().copied().collect();
        for entry in table.history.iter().rev() {
            if seen.insert(entry.item.task_id) {
                items.push(entry.item.clone());
            }
        }
        BatchReport::from_items(items)
    }

    /// True when nothing can be scheduled without user action.
    pub fn is_idle(&self) -> bool {
        !schedule::has_pending_work(&self.shared.lock(), storage::unix_millis())
    }

    /// Signals every running attempt to pause.
    pub fn pause_all_active(&self) {
        self.shared.control.request_all(InterruptReason::Paused);
    }

    /// Runs until no task can make progress without user action.
    pub async fn run_until_idle(&self) -> Result<RunSummary, QueueError> {
        self.drive(std::future::pending::<()>(), true).await
    }

    /// Like `run_until_idle`, but stops early (pausing active transfers) when
    /// `shutdown` resolves.
    pub async fn run_until_idle_or<F>(&self, shutdown: F) -> Result<RunSummary, QueueError>
    where
        F: Future<Output = ()>,
    {
        self.drive(shutdown, true).await
    }

    /// Runs until `shutdown` resolves; active transfers are then paused.
    pub async fn run<F>(&self, shutdown: F) -> Result<RunSummary, QueueError>
    where
        F: Future<Output = ()>,
    {
        self.drive(shutdown, false).await
    }

    async fn drive<F>(&self, shutdown: F, stop_when_idle: bool) -> Result<RunSummary, QueueError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut summary = RunSummary::default();
        let mut workers: JoinSet<(TaskId, Result<(), QueueError>)> = JoinSet::new();
        let mut first_error: Option<QueueError> = None;

        loop {
            let now = storage::unix_millis();
            let (started, idle) = {
                let mut table = self.shared.lock();
                mirror_live(&mut table);
                let out = schedule::tick(&mut table, &self.shared.cfg, now);
                for id in &out.failed {
                    table.record_finished(*id, now, self.shared.cfg.history_limit);
                }
                summary.failed += out.failed.len();
                if out.changed {
                    if let Err(e) = self.shared.persist(&table) {
                        first_error = Some(e);
                    }
                }
                (out.started, !schedule::has_pending_work(&table, now))
            };
            if first_error.is_some() {
                break;
            }

            for id in started {
                tracing::debug!(task_id = id, "task admitted");
                summary.started += 1;
                let shared = Arc::clone(&self.shared);
                workers.spawn(async move { (id, worker::run_task(shared, id).await) });
            }

            if stop_when_idle && idle && workers.is_empty() {
                break;
            }

            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!(active = workers.len(), "shutdown requested; pausing active tasks");
                    summary.interrupted = true;
                    break;
                }
                Some(joined) = workers.join_next(), if !workers.is_empty() => {
                    if let Err(e) = self.collect(joined, &mut summary) {
                        first_error = Some(e);
                        break;
                    }
                }
                _ = tokio::time::sleep(self.shared.cfg.poll_interval()) => {}
            }
        }

        if !workers.is_empty() {
            self.shared.control.request_all(InterruptReason::Paused);
            while let Some(joined) = workers.join_next().await {
                if let Err(e) = self.collect(joined, &mut summary) {
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(summary),
        }
    }

    fn collect(
        &self,
        joined: Result<(TaskId, Result<(), QueueError>), tokio::task::JoinError>,
        summary: &mut RunSummary,
    ) -> Result<(), QueueError> {
        let (id, result) = joined.map_err(|e| QueueError::Worker(e.to_string()))?;
        result?;
        let state = self.shared.lock().tasks.get(&id).map(|t| t.state);
        match state {
            Some(TaskState::Completed) => summary.completed += 1,
            Some(TaskState::Failed) => summary.failed += 1,
            Some(TaskState::Cancelled) => summary.cancelled += 1,
            Some(TaskState::Paused) => summary.paused += 1,
            Some(TaskState::RetryWait) => summary.retries_scheduled += 1,
            _ => {}
        }
        Ok(())
    }
}

fn parse_host(raw: &str) -> Result<String, QueueError> {
    let invalid = |reason: String| QueueError::InvalidUrl {
        url: raw.to_string(),
        reason,
    };
    let url = url::Url::parse(raw).map_err(|e| invalid(e.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid(format!("unsupported scheme '{}'", url.scheme())));
    }
    url.host_str()
        .map(|h| h.to_ascii_lowercase())
        .ok_or_else(|| invalid("missing host".to_string()))
}

fn unsafe_path(e: FetchError) -> QueueError {
    match e {
        FetchError::UnsafePath(msg) => QueueError::UnsafePath(msg),
        other => QueueError::UnsafePath(other.to_string()),
    }
}

fn mirror_live(table: &mut TaskTable) {
    let TaskTable { tasks, live, .. } = table;
    for (id, handle) in live.iter() {
        if let Some(task) = tasks.get_mut(id) {
            worker::mirror_progress(task, &handle.snapshot());
        }
    }
}
