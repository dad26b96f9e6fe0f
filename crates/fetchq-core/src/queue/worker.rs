//! One attempt of one task: policy hooks, the blocking download, and the
//! retry/backoff decision fed back into the table.

use std::sync::Arc;

use crate::control::CancelToken;
use crate::downloader::{DownloadJob, DownloadOutcome};
use crate::error::{FetchError, InterruptReason};
use crate::policy::{ANNOTATION_MAX_BYTES_PER_SEC, ANNOTATION_MAX_CONNECTIONS};
use crate::progress::{ProgressHandle, ProgressStats};
use crate::queue::manager::Shared;
use crate::queue::{Denial, QueueError, Task, TaskId, TaskState};
use crate::retry::{self, RetryDecision, RetryPolicy};
use crate::storage;

pub(crate) async fn run_task(shared: Arc<Shared>, id: TaskId) -> Result<(), QueueError> {
    let Some(mut job) = prepare_job(&shared, id) else {
        return Ok(());
    };

    let start = shared.policy.check_start(id, &job.url);
    start.log("check_start", id);
    if start.is_denied() {
        return fail_denied(&shared, id, start.into_denied_error());
    }
    if let Some(cap) = start.annotation_u64(ANNOTATION_MAX_CONNECTIONS) {
        let cap = (cap as usize).max(1);
        job.max_connections = Some(job.max_connections.map_or(cap, |c| c.min(cap)));
    }
    if let Some(rate) = start.annotation_u64(ANNOTATION_MAX_BYTES_PER_SEC) {
        job.max_bytes_per_sec = Some(rate.max(1));
    }

    let existing = shared.downloader.existing_progress(&job.destination);
    if existing > 0 {
        let resume = shared
            .policy
            .check_resume(id, &job.url, &job.destination, existing);
        resume.log("check_resume", id);
        if resume.is_denied() {
            job.allow_resume = false;
        }
    }

    let progress = ProgressHandle::new();
    let Some(token) = begin_attempt(&shared, id, &progress)? else {
        return Ok(());
    };

    let result = execute(&shared, id, job.clone(), token.clone(), progress.clone()).await;

    match result {
        Ok(download) => finish(&shared, id, &token, &progress, download),
        Err(join_error) => {
            let msg = format!("download worker panicked: {}", join_error);
            tracing::error!(task_id = id, "{}", msg);
            finish(
                &shared,
                id,
                &token,
                &progress,
                Err(FetchError::Request(msg.clone())),
            )?;
            Err(QueueError::Worker(msg))
        }
    }
}

fn prepare_job(shared: &Shared, id: TaskId) -> Option<DownloadJob> {
    let table = shared.lock();
    let task = table.tasks.get(&id)?;
    if task.state != TaskState::Starting {
        return None;
    }
    let mut job = DownloadJob::new(task.url.clone(), task.destination.clone());
    job.mode = task.mode;
    job.max_connections = task.connections_requested;
    job.expected_sha256 = task.expected_sha256.clone();
    Some(job)
}

fn fail_denied(shared: &Shared, id: TaskId, denied: FetchError) -> Result<(), QueueError> {
    let now = storage::unix_millis();
    let mut table = shared.lock();
    let Some(task) = table.tasks.get_mut(&id) else {
        return Ok(());
    };
    if !task.transition(TaskState::Failed, now) {
        return Ok(());
    }
    tracing::info!(task_id = id, error = %denied, "task denied at start");
    task.last_error = Some(denied.to_string());
    task.denial = denial_of(denied);
    table.record_finished(id, now, shared.cfg.history_limit);
    shared.persist(&table)
}

/// STARTING -> DOWNLOADING under the lock, registering the cancel token in the
/// same critical section so a concurrent pause/cancel is never lost.
fn begin_attempt(
    shared: &Shared,
    id: TaskId,
    progress: &ProgressHandle,
) -> Result<Option<CancelToken>, QueueError> {
    let now = storage::unix_millis();
    let mut table = shared.lock();
    let attempt = match table.tasks.get_mut(&id) {
        Some(task) if task.state == TaskState::Starting => {
            task.transition(TaskState::Downloading, now);
            task.attempt += 1;
            task.speed = 0.0;
            task.attempt
        }
        _ => return Ok(None),
    };
    let token = shared.control.register(id);
    table.live.insert(id, progress.clone());
    tracing::info!(task_id = id, attempt, "task downloading");
    if let Err(e) = shared.persist(&table) {
        // No transfer runs, so pause and cancel must not wait on a token.
        shared.control.unregister(id);
        table.live.remove(&id);
        return Err(e);
    }
    Ok(Some(token))
}

async fn execute(
    shared: &Shared,
    id: TaskId,
    job: DownloadJob,
    token: CancelToken,
    progress: ProgressHandle,
) -> Result<Result<DownloadOutcome, FetchError>, tokio::task::JoinError> {
    let downloader = Arc::clone(&shared.downloader);
    let worker_token = token.clone();
    let mut handle =
        tokio::task::spawn_blocking(move || downloader.download(&job, &worker_token, &progress));
    match shared.cfg.task_timeout() {
        Some(limit) => match tokio::time::timeout(limit, &mut handle).await {
            Ok(joined) => joined,
            Err(_) => {
                tracing::warn!(task_id = id, limit_secs = limit.as_secs_f64(), "task timed out");
                token.request(InterruptReason::TimedOut);
                handle.await
            }
        },
        None => handle.await,
    }
}

fn denial_of(e: FetchError) -> Option<Denial> {
    match e {
        FetchError::PolicyDenied { code, reason } => Some(Denial { code, reason }),
        _ => None,
    }
}

pub(crate) fn mirror_progress(task: &mut Task, stats: &ProgressStats) {
    task.bytes_done = stats.bytes_done;
    if stats.total_bytes.is_some() {
        task.total_size = stats.total_bytes;
    }
    task.progress = stats.fraction() * 100.0;
    task.speed = stats.bytes_per_sec();
}

fn finish(
    shared: &Shared,
    id: TaskId,
    token: &CancelToken,
    progress: &ProgressHandle,
    result: Result<DownloadOutcome, FetchError>,
) -> Result<(), QueueError> {
    let now = storage::unix_millis();
    let stats = progress.snapshot();
    let mut table = shared.lock();
    // Unregistered under the table lock: while the task reads DOWNLOADING,
    // pause and cancel always find its token.
    shared.control.unregister(id);
    table.live.remove(&id);
    let Some(task) = table.tasks.get_mut(&id) else {
        return Ok(());
    };
    mirror_progress(task, &stats);
    task.speed = 0.0;

    match (token.reason(), result) {
        // Cancel wins, even over a transfer that finished in the meantime.
        (Some(InterruptReason::Cancelled), result) => {
            if let Ok(outcome) = result {
                tracing::warn!(task_id = id, "download finished after cancel; removing artifact");
                if let Err(e) = storage::remove_if_exists(&outcome.destination) {
                    tracing::error!(task_id = id, error = %e, "could not remove cancelled artifact");
                }
            }
            task.transition(TaskState::Cancelled, now);
            tracing::info!(task_id = id, "task cancelled");
        }
        (_, Ok(outcome)) => {
            task.transition(TaskState::Completed, now);
            task.progress = 100.0;
            task.total_size = Some(outcome.total_size);
            task.bytes_done = outcome.total_size;
            task.last_error = None;
            tracing::info!(
                task_id = id,
                mode = %outcome.mode,
                connections = outcome.connections_used,
                bytes = outcome.total_size,
                resumed_from = outcome.resumed_from,
                "task completed"
            );
            task.outcome = Some(outcome);
        }
        (Some(InterruptReason::Paused), Err(_)) => {
            task.transition(TaskState::Paused, now);
            tracing::info!(task_id = id, bytes = task.bytes_done, "task paused");
        }
        (_, Err(FetchError::PolicyDenied { code, reason })) => {
            task.transition(TaskState::Failed, now);
            task.last_error = Some(format!("denied by policy [{}]: {}", code, reason));
            task.denial = Some(Denial { code, reason });
        }
        (_, Err(e)) => apply_failure(shared, task, e, now),
    }

    let terminal = task.state.is_terminal();
    if terminal {
        table.record_finished(id, now, shared.cfg.history_limit);
    }
    shared.persist(&table)
}

fn apply_failure(shared: &Shared, task: &mut Task, e: FetchError, now: u64) {
    let msg = e.to_string();
    let kind = retry::classify(&e);
    let retryable = shared.cfg.retry_enabled && kind.is_retryable();
    let policy = RetryPolicy {
        max_attempts: task.max_attempts,
        ..shared.retry
    };
    let decision = if retryable {
        policy.decide(task.attempt, kind)
    } else {
        RetryDecision::NoRetry
    };

    if let RetryDecision::RetryAfter(delay) = decision {
        let hook = shared
            .policy
            .check_retry(task.id, task.attempt, task.max_attempts, &e);
        hook.log("check_retry", task.id);
        if hook.is_denied() {
            let denied = hook.into_denied_error();
            task.transition(TaskState::Failed, now);
            task.last_error = Some(format!("{} (retry {})", msg, denied));
            task.denial = denial_of(denied);
            return;
        }
        task.transition(TaskState::RetryWait, now);
        task.next_eligible_at = Some(now + delay.as_millis() as u64);
        tracing::info!(
            task_id = task.id,
            attempt = task.attempt,
            delay_ms = delay.as_millis() as u64,
            error = %msg,
            "task will retry"
        );
        task.last_error = Some(msg);
        return;
    }

    task.transition(TaskState::Failed, now);
    task.last_error = Some(if retryable {
        format!("retries exhausted after {} attempts: {}", task.attempt, msg)
    } else {
        msg
    });
    tracing::warn!(
        task_id = task.id,
        attempt = task.attempt,
        error = task.last_error.as_deref().unwrap_or(""),
        "task failed"
    );
}
