use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use mailforge_core::{
    AdminNotification, AuditLog, Campaign, CampaignError, CampaignId, CampaignStatus, CompanyId,
    EmailCampaignResult, EmailUsageRecord, ExecutionLogId, ExecutionOutcome, JobExecutionLog,
    JobSchedule, NewEmailCampaignResult, NewJobSchedule, ScheduleUpdate, SendingDomain, Task,
    TaskFailure, TaskId, UserNotification,
};

/// Storage error shared by every store trait.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    /// Unique/constraint violation.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A stored row could not be mapped back to a domain value.
    #[error("corrupt row: {0}")]
    Corrupt(String),

    /// Connection, pool or driver failure. Usually transient.
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Number of tasks per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TaskCounts {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
}

impl TaskCounts {
    pub fn total(&self) -> u64 {
        self.pending + self.processing + self.completed + self.failed
    }
}

/// Durable task table.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn create_task(&self, task: Task) -> StoreResult<TaskId>;

    async fn get_task(&self, id: TaskId) -> StoreResult<Option<Task>>;

    /// Atomically pick the oldest eligible pending task and mark it processing.
    ///
    /// Eligible means `scheduled_at <= now`; ordering is `scheduled_at`, then
    /// `created_at`. Two concurrent callers never receive the same task.
    async fn claim_next_task(&self, now: DateTime<Utc>) -> StoreResult<Option<Task>>;

    /// Settle the task held by `claimed`.
    ///
    /// Fails with [`StoreError::Conflict`] when the task is no longer in the
    /// state that claim left it in, i.e. it was swept and claimed again.
    async fn mark_task_completed(&self, claimed: &Task) -> StoreResult<()>;

    async fn mark_task_failed(&self, claimed: &Task, failure: TaskFailure) -> StoreResult<()>;

    /// Return tasks stuck in processing since before `stale_before` to pending.
    async fn reset_stale_tasks(&self, stale_before: DateTime<Utc>) -> StoreResult<u64>;

    async fn task_counts_by_status(&self) -> StoreResult<TaskCounts>;

    /// Delete completed/failed tasks last updated before `cutoff`.
    async fn cleanup_tasks_older_than(&self, cutoff: DateTime<Utc>) -> StoreResult<u64>;
}

/// Cron job schedules and their execution logs.
#[async_trait]
pub trait ScheduleStore: Send + Sync {
    async fn get_schedule(&self, job_name: &str) -> StoreResult<Option<JobSchedule>>;

    /// Insert `new` unless a schedule with the same name exists; returns the stored row.
    async fn create_schedule_if_absent(&self, new: NewJobSchedule) -> StoreResult<JobSchedule>;

    async fn list_schedules(&self) -> StoreResult<Vec<JobSchedule>>;

    async fn set_enabled(&self, job_name: &str, enabled: bool) -> StoreResult<JobSchedule>;

    async fn update_schedule(
        &self,
        job_name: &str,
        update: &ScheduleUpdate,
    ) -> StoreResult<JobSchedule>;

    async fn mark_run_started(&self, job_name: &str, at: DateTime<Utc>) -> StoreResult<()>;

    async fn mark_run_succeeded(&self, job_name: &str, at: DateTime<Utc>) -> StoreResult<()>;

    async fn mark_run_failed(&self, job_name: &str, at: DateTime<Utc>) -> StoreResult<()>;

    async fn create_execution_log(&self, log: &JobExecutionLog) -> StoreResult<()>;

    async fn finish_execution_log(
        &self,
        id: ExecutionLogId,
        outcome: &ExecutionOutcome,
    ) -> StoreResult<()>;

    /// Most recent executions first.
    async fn list_execution_history(
        &self,
        job_name: &str,
        limit: usize,
    ) -> StoreResult<Vec<JobExecutionLog>>;
}

#[async_trait]
pub trait CampaignStore: Send + Sync {
    /// Campaign scoped to its owning company; other companies' campaigns are invisible.
    async fn get_campaign(
        &self,
        company_id: CompanyId,
        campaign_id: CampaignId,
    ) -> StoreResult<Option<Campaign>>;

    async fn update_campaign_status(
        &self,
        campaign_id: CampaignId,
        status: CampaignStatus,
    ) -> StoreResult<()>;

    /// Status `sent` and `sent_at` in one write.
    async fn mark_campaign_sent(
        &self,
        campaign_id: CampaignId,
        sent_at: DateTime<Utc>,
    ) -> StoreResult<()>;

    /// Non-archived campaigns not yet sent or failed with `scheduled_at <= now`, oldest first.
    ///
    /// Includes campaigns left `queued` by an interrupted dispatch.
    async fn find_due_campaigns(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<Campaign>>;

    /// Distinct, subscribed recipient addresses of the campaign's contact groups.
    async fn get_contact_emails_for_campaign(
        &self,
        campaign_id: CampaignId,
    ) -> StoreResult<Vec<String>>;

    async fn create_campaign_error(&self, error: &CampaignError) -> StoreResult<()>;

    async fn create_email_campaign_result(
        &self,
        result: NewEmailCampaignResult,
    ) -> StoreResult<EmailCampaignResult>;
}

#[async_trait]
pub trait UsageStore: Send + Sync {
    /// Usage record whose period covers `now`.
    async fn get_current_usage(
        &self,
        company_id: CompanyId,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<EmailUsageRecord>>;

    /// Add `sent` to `emails_sent` and subtract it from `remaining_emails` (floored at zero).
    async fn increment_usage(
        &self,
        company_id: CompanyId,
        now: DateTime<Utc>,
        sent: i64,
    ) -> StoreResult<EmailUsageRecord>;
}

#[async_trait]
pub trait DomainStore: Send + Sync {
    /// Verified sending domain registered by `company_id`, if any.
    async fn find_verified_domain(
        &self,
        company_id: CompanyId,
        domain: &str,
    ) -> StoreResult<Option<SendingDomain>>;
}

#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Inserting the same log id twice is a no-op.
    async fn create_audit_log(&self, log: &AuditLog) -> StoreResult<()>;
}

#[async_trait]
pub trait NotificationStore: Send + Sync {
    /// Inserting the same notification id twice is a no-op.
    async fn create_user_notification(&self, notification: &UserNotification) -> StoreResult<()>;

    async fn create_admin_notification(&self, notification: &AdminNotification)
    -> StoreResult<()>;
}

/// Every store capability the engine needs.
pub trait Store:
    TaskStore + ScheduleStore + CampaignStore + UsageStore + DomainStore + AuditStore + NotificationStore
{
}

impl<T> Store for T where
    T: TaskStore
        + ScheduleStore
        + CampaignStore
        + UsageStore
        + DomainStore
        + AuditStore
        + NotificationStore
        + ?Sized
{
}
