use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cron::Schedule;
use serde_json::Value;
use thiserror::Error;

use mailforge_core::{DEFAULT_JOB_TIMEOUT_SECS, JobExecutionLog, NewJobSchedule};

use crate::jobs::QueueError;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("invalid cron expression {expression:?}: {reason}")]
    InvalidSchedule { expression: String, reason: String },

    #[error("job {0} is already registered")]
    DuplicateJob(String),

    #[error("unknown job {0}")]
    UnknownJob(String),

    #[error("invalid job setting: {0}")]
    InvalidSetting(String),

    #[error("scheduler did not stop within {0:?}")]
    ShutdownTimeout(Duration),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Failure reported by a job run.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct JobError(pub String);

impl JobError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

impl From<StoreError> for JobError {
    fn from(err: StoreError) -> Self {
        Self(err.to_string())
    }
}

impl From<QueueError> for JobError {
    fn from(err: QueueError) -> Self {
        Self(err.to_string())
    }
}

/// A job run by the cron scheduler.
///
/// `schedule()`, `timeout_seconds()` and `max_retries()` only seed the stored
/// schedule row; once it exists the stored values are authoritative.
#[async_trait]
pub trait CronJob: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn job_type(&self) -> &str;

    fn description(&self) -> &str;

    /// Cron expression: 5 fields (minute precision) or 6/7 fields (with seconds).
    fn schedule(&self) -> &str;

    fn timeout_seconds(&self) -> i32 {
        DEFAULT_JOB_TIMEOUT_SECS
    }

    /// Extra attempts within one run after a failed attempt.
    fn max_retries(&self) -> i32 {
        0
    }

    /// Returns optional output stored on the execution log.
    async fn run(&self) -> Result<Option<Value>, JobError>;
}

pub(crate) fn new_schedule(job: &dyn CronJob) -> NewJobSchedule {
    NewJobSchedule {
        job_name: job.name().to_string(),
        job_type: job.job_type().to_string(),
        description: job.description().to_string(),
        cron_schedule: job.schedule().to_string(),
        enabled: true,
        timeout_seconds: job.timeout_seconds(),
        max_retries: job.max_retries(),
    }
}

/// Parse a cron expression; 5-field expressions run at second zero.
pub fn parse_schedule(expression: &str) -> Result<Schedule, SchedulerError> {
    let trimmed = expression.trim();
    let full = if trimmed.split_whitespace().count() == 5 {
        format!("0 {trimmed}")
    } else {
        trimmed.to_string()
    };
    Schedule::from_str(&full).map_err(|e| SchedulerError::InvalidSchedule {
        expression: expression.to_string(),
        reason: e.to_string(),
    })
}

pub(crate) fn next_fire(schedule: &Schedule, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    schedule.after(&after).next()
}

/// What a trigger did.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Executed(JobExecutionLog),
    /// The stored schedule is disabled; nothing was recorded.
    Disabled,
    /// The previous run of the same job had not finished.
    Overlapping,
}
