//! Cron job schedules and their execution history.

use core::fmt;
use core::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::DomainError;
use crate::id::{ExecutionLogId, JobScheduleId};

/// Timeout applied when a schedule has no positive `timeout_seconds`.
pub const DEFAULT_JOB_TIMEOUT_SECS: i32 = 300;

/// Persisted state of a registered cron job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSchedule {
    pub id: JobScheduleId,
    pub job_name: String,
    pub job_type: String,
    pub description: String,
    pub cron_schedule: String,
    pub enabled: bool,
    pub timeout_seconds: i32,
    pub max_retries: i32,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Defaults a job registers itself with the first time it fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewJobSchedule {
    pub job_name: String,
    pub job_type: String,
    pub description: String,
    pub cron_schedule: String,
    pub enabled: bool,
    pub timeout_seconds: i32,
    pub max_retries: i32,
}

impl JobSchedule {
    pub fn from_new(new: NewJobSchedule, now: DateTime<Utc>) -> Self {
        Self {
            id: JobScheduleId::new(),
            job_name: new.job_name,
            job_type: new.job_type,
            description: new.description,
            cron_schedule: new.cron_schedule,
            enabled: new.enabled,
            timeout_seconds: new.timeout_seconds,
            max_retries: new.max_retries,
            last_run_at: None,
            last_success_at: None,
            last_failure_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Timeout for one run; non-positive values fall back to the default.
    pub fn effective_timeout(&self) -> Duration {
        let secs = if self.timeout_seconds > 0 {
            self.timeout_seconds
        } else {
            DEFAULT_JOB_TIMEOUT_SECS
        };
        Duration::from_secs(secs as u64)
    }

    pub fn apply_update(&mut self, update: &ScheduleUpdate, now: DateTime<Utc>) {
        if let Some(cron) = &update.cron_schedule {
            self.cron_schedule = cron.clone();
        }
        if let Some(timeout) = update.timeout_seconds {
            self.timeout_seconds = timeout;
        }
        if let Some(max_retries) = update.max_retries {
            self.max_retries = max_retries;
        }
        self.updated_at = now;
    }
}

/// Partial admin update of a schedule. `None` leaves the field unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleUpdate {
    pub cron_schedule: Option<String>,
    pub timeout_seconds: Option<i32>,
    pub max_retries: Option<i32>,
}

/// Status of one cron job execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
    /// The run exceeded its timeout and was cancelled.
    Timeout,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Timeout => "timeout",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionStatus::Completed)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(ExecutionStatus::Running),
            "completed" => Ok(ExecutionStatus::Completed),
            "failed" => Ok(ExecutionStatus::Failed),
            "timeout" => Ok(ExecutionStatus::Timeout),
            other => Err(DomainError::validation(format!(
                "unknown execution status: {other}"
            ))),
        }
    }
}

/// Terminal result of a run, written once onto its execution log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub status: ExecutionStatus,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub error_message: Option<String>,
    pub output: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobExecutionLog {
    pub id: ExecutionLogId,
    pub job_schedule_id: JobScheduleId,
    pub job_name: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: ExecutionStatus,
    pub duration_ms: Option<i64>,
    pub error_message: Option<String>,
    pub output: Option<Value>,
}

impl JobExecutionLog {
    /// A `running` log for a run of `schedule` that began at `started_at`.
    pub fn start(schedule: &JobSchedule, started_at: DateTime<Utc>) -> Self {
        Self {
            id: ExecutionLogId::new(),
            job_schedule_id: schedule.id,
            job_name: schedule.job_name.clone(),
            started_at,
            finished_at: None,
            status: ExecutionStatus::Running,
            duration_ms: None,
            error_message: None,
            output: None,
        }
    }

    pub fn finish(&mut self, outcome: &ExecutionOutcome) {
        self.status = outcome.status;
        self.finished_at = Some(outcome.finished_at);
        self.duration_ms = Some(outcome.duration_ms);
        self.error_message = outcome.error_message.clone();
        self.output = outcome.output.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schedule(timeout_seconds: i32) -> JobSchedule {
        JobSchedule::from_new(
            NewJobSchedule {
                job_name: "cleanup".into(),
                job_type: "maintenance".into(),
                description: "remove old tasks".into(),
                cron_schedule: "0 3 * * *".into(),
                enabled: true,
                timeout_seconds,
                max_retries: 0,
            },
            Utc::now(),
        )
    }

    #[test]
    fn non_positive_timeout_falls_back_to_default() {
        assert_eq!(schedule(0).effective_timeout(), Duration::from_secs(300));
        assert_eq!(schedule(-5).effective_timeout(), Duration::from_secs(300));
        assert_eq!(schedule(12).effective_timeout(), Duration::from_secs(12));
    }

    #[test]
    fn partial_update_only_touches_given_fields() {
        let mut s = schedule(60);
        s.apply_update(
            &ScheduleUpdate {
                cron_schedule: Some("*/5 * * * *".into()),
                ..Default::default()
            },
            Utc::now(),
        );
        assert_eq!(s.cron_schedule, "*/5 * * * *");
        assert_eq!(s.timeout_seconds, 60);
    }

    #[test]
    fn finishing_a_log_copies_the_outcome() {
        let s = schedule(60);
        let mut log = JobExecutionLog::start(&s, Utc::now());
        assert_eq!(log.status, ExecutionStatus::Running);

        log.finish(&ExecutionOutcome {
            status: ExecutionStatus::Timeout,
            finished_at: Utc::now(),
            duration_ms: 60_000,
            error_message: Some("timed out".into()),
            output: None,
        });
        assert_eq!(log.status, ExecutionStatus::Timeout);
        assert_eq!(log.duration_ms, Some(60_000));
        assert!(log.finished_at.is_some());
    }
}
