//! Worker and stale-sweep loops of the task queue.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use mailforge_core::{Task, TaskFailure};

use super::handler::TaskHandler;
use super::types::{RetryPolicy, TaskError, WorkerCounters};
use crate::store::{StoreError, StoreResult, TaskStore};
use crate::util::panic_message;

/// Claims tasks from the store and runs them through the handler.
pub(crate) struct TaskRunner<S> {
    pub store: Arc<S>,
    pub handler: Arc<dyn TaskHandler>,
    pub retry: RetryPolicy,
    pub counters: Arc<WorkerCounters>,
}

impl<S> Clone for TaskRunner<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            handler: self.handler.clone(),
            retry: self.retry,
            counters: self.counters.clone(),
        }
    }
}

impl<S: TaskStore + 'static> TaskRunner<S> {
    /// Claim and run at most one eligible task. Returns whether a task was processed.
    pub async fn run_next(&self) -> StoreResult<bool> {
        let Some(task) = self.store.claim_next_task(Utc::now()).await? else {
            return Ok(false);
        };
        let span = info_span!(
            "task",
            task_id = %task.id,
            task_type = %task.task_type,
            retry_count = task.retry_count
        );
        self.run_claimed(task).instrument(span).await?;
        Ok(true)
    }

    async fn run_claimed(&self, task: Task) -> StoreResult<()> {
        WorkerCounters::incr(&self.counters.processed);
        debug!("claimed task");

        let err = match execute(self.handler.as_ref(), &task).await {
            Ok(()) => {
                if settled(self.store.mark_task_completed(&task).await)? {
                    WorkerCounters::incr(&self.counters.succeeded);
                    debug!("task completed");
                }
                return Ok(());
            }
            Err(err) => err,
        };

        if matches!(err, TaskError::Panicked(_)) {
            WorkerCounters::incr(&self.counters.panicked);
        }

        let failure = if err.is_retryable() {
            self.retry.on_failure(&task, err.to_string(), Utc::now())
        } else {
            TaskFailure::Terminal {
                retry_count: task.retry_count,
                error: err.to_string(),
            }
        };

        match &failure {
            TaskFailure::Retry {
                retry_count,
                retry_at,
                ..
            } => {
                WorkerCounters::incr(&self.counters.retried);
                warn!(error = %err, retry_count, retry_at = %retry_at, "task failed; retry scheduled");
            }
            TaskFailure::Terminal { retry_count, .. } => {
                WorkerCounters::incr(&self.counters.failed);
                error!(
                    error = %err,
                    retry_count,
                    retryable = err.is_retryable(),
                    "task failed permanently"
                );
            }
        }

        settled(self.store.mark_task_failed(&task, failure).await).map(|_| ())
    }
}

/// `Ok(false)` when the task was reclaimed after a stale sweep; the newer
/// claim owns its state.
fn settled(result: StoreResult<()>) -> StoreResult<bool> {
    match result {
        Ok(()) => Ok(true),
        Err(StoreError::Conflict(reason)) => {
            warn!(%reason, "task reclaimed while running; outcome discarded");
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

/// Decode `task` and run it inside a panic boundary.
pub(crate) async fn execute(handler: &dyn TaskHandler, task: &Task) -> Result<(), TaskError> {
    let kind = task
        .kind()
        .map_err(|e| TaskError::Decode(format!("{}: {}", task.task_type, e)))?;

    match AssertUnwindSafe(handler.handle(task, kind))
        .catch_unwind()
        .await
    {
        Ok(result) => result,
        Err(payload) => Err(TaskError::Panicked(panic_message(&*payload))),
    }
}

/// Poll for work until `token` is cancelled.
///
/// Cancellation is observed between executions, so an in-flight task always
/// runs to completion.
pub(crate) async fn worker_loop<S: TaskStore + 'static>(
    runner: TaskRunner<S>,
    worker_id: usize,
    poll_interval: Duration,
    token: CancellationToken,
) {
    info!(worker_id, "task worker started");

    while !token.is_cancelled() {
        let idle = match runner.run_next().await {
            Ok(processed) => !processed,
            Err(e) => {
                error!(worker_id, error = %e, "failed to claim or settle task");
                true
            }
        };

        if idle {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }
    }

    info!(worker_id, "task worker stopped");
}

/// Periodically return abandoned processing tasks to pending.
pub(crate) async fn sweep_loop<S: TaskStore + 'static>(
    store: Arc<S>,
    counters: Arc<WorkerCounters>,
    stale_after: Duration,
    interval: Duration,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        match recover_stale(store.as_ref(), stale_after)
            .instrument(info_span!("stale_sweep"))
            .await
        {
            Ok(0) => {}
            Ok(recovered) => {
                WorkerCounters::add(&counters.recovered, recovered);
                warn!(recovered, "returned stale tasks to pending");
            }
            Err(e) => error!(error = %e, "stale task sweep failed"),
        }
    }

    debug!("stale task sweep stopped");
}

pub(crate) async fn recover_stale<S: TaskStore + ?Sized>(
    store: &S,
    stale_after: Duration,
) -> StoreResult<u64> {
    let now = Utc::now();
    let cutoff = chrono::Duration::from_std(stale_after)
        .ok()
        .and_then(|window| now.checked_sub_signed(window))
        .unwrap_or(DateTime::<Utc>::MIN_UTC);
    store.reset_stale_tasks(cutoff).await
}
