//! Retry policy, task errors and queue statistics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use mailforge_core::{Task, TaskFailure};

use crate::config::QueueConfig;
use crate::store::{StoreError, TaskCounts};

/// Exponential backoff: `base_delay * 2^retry_count`, capped at `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60 * 60),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &QueueConfig) -> Self {
        Self {
            base_delay: config.base_retry_delay(),
            max_delay: config.max_retry_delay(),
        }
    }

    /// Delay before the next attempt of a task that has failed `retry_count` times so far.
    pub fn backoff(&self, retry_count: u32) -> Duration {
        2u32.checked_pow(retry_count)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// Decide how a failed attempt of `task` is written back.
    ///
    /// The retry counter is incremented first; the task is terminal once it
    /// reaches `max_retries`.
    pub fn on_failure(&self, task: &Task, error: String, now: DateTime<Utc>) -> TaskFailure {
        let backoff = self.backoff(task.retry_count);
        let retry_count = task.retry_count.saturating_add(1);
        if retry_count < task.max_retries {
            let retry_at = chrono::Duration::from_std(backoff)
                .ok()
                .and_then(|delay| now.checked_add_signed(delay))
                .unwrap_or(DateTime::<Utc>::MAX_UTC);
            TaskFailure::Retry {
                retry_count,
                retry_at,
                error,
            }
        } else {
            TaskFailure::Terminal { retry_count, error }
        }
    }
}

/// Failure of one task execution.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TaskError {
    /// Stored `task_type`/`payload` did not decode into a known task kind.
    #[error("malformed task: {0}")]
    Decode(String),

    /// The handler panicked; the panic was contained at the worker boundary.
    #[error("handler panicked: {0}")]
    Panicked(String),

    /// Transient failure (store, transport); retried with backoff.
    #[error("{0}")]
    Transient(String),

    /// Failure that re-running cannot fix (precondition, invalid input).
    #[error("permanent failure: {0}")]
    Permanent(String),
}

impl TaskError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, TaskError::Transient(_) | TaskError::Panicked(_))
    }
}

impl From<StoreError> for TaskError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Corrupt(_) => TaskError::Permanent(err.to_string()),
            _ => TaskError::Transient(err.to_string()),
        }
    }
}

/// Errors surfaced by the queue's own operations.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("failed to serialize task payload: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("delay out of range: {0:?}")]
    InvalidDelay(Duration),

    #[error("workers did not stop within {0:?}")]
    ShutdownTimeout(Duration),
}

/// In-process worker counters.
#[derive(Debug, Default)]
pub(crate) struct WorkerCounters {
    pub processed: AtomicU64,
    pub succeeded: AtomicU64,
    pub retried: AtomicU64,
    pub failed: AtomicU64,
    pub panicked: AtomicU64,
    pub recovered: AtomicU64,
}

impl WorkerCounters {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }
}

/// Snapshot of the queue: store-wide counts plus this process's worker counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub counts: TaskCounts,
    pub running: bool,
    pub workers: usize,
    pub tasks_processed: u64,
    pub tasks_succeeded: u64,
    pub tasks_retried: u64,
    pub tasks_failed: u64,
    pub tasks_panicked: u64,
    pub stale_recovered: u64,
}

impl QueueStats {
    pub(crate) fn collect(
        counts: TaskCounts,
        running: bool,
        workers: usize,
        counters: &WorkerCounters,
    ) -> Self {
        Self {
            counts,
            running,
            workers,
            tasks_processed: counters.processed.load(Ordering::Relaxed),
            tasks_succeeded: counters.succeeded.load(Ordering::Relaxed),
            tasks_retried: counters.retried.load(Ordering::Relaxed),
            tasks_failed: counters.failed.load(Ordering::Relaxed),
            tasks_panicked: counters.panicked.load(Ordering::Relaxed),
            stale_recovered: counters.recovered.load(Ordering::Relaxed),
        }
    }
}
