//! Postgres-backed implementation of every store trait.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (unique violation) | `23505` | `Conflict` |
//! | Database (foreign key / check violation) | `23503` / `23514` | `Conflict` |
//! | Database (other) | Any other | `Unavailable` |
//! | RowNotFound | N/A | `NotFound` |
//! | ColumnDecode / Decode | N/A | `Corrupt` |
//! | PoolClosed, Io, Tls, PoolTimedOut, ... | N/A | `Unavailable` |
//!
//! ## Claiming
//!
//! `claim_next_task` selects and updates in one statement with
//! `FOR UPDATE SKIP LOCKED`, so concurrent workers (in this process or another)
//! never claim the same row.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{FromRow, PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use mailforge_core::{
    AdminNotification, AuditLog, Campaign, CampaignError, CampaignId, CampaignStatus, CompanyId,
    EmailCampaignResult, EmailUsageRecord, ExecutionLogId, ExecutionOutcome, ExecutionStatus,
    JobExecutionLog, JobSchedule, JobScheduleId, NewEmailCampaignResult, NewJobSchedule,
    ScheduleUpdate, SendingDomain, Task, TaskFailure, TaskId, TaskStatus, UserNotification,
};

use super::r#trait::{
    AuditStore, CampaignStore, DomainStore, NotificationStore, ScheduleStore, StoreError,
    StoreResult, TaskCounts, TaskStore, UsageStore,
};

const TASK_COLUMNS: &str = "id, task_type, payload, status, retry_count, max_retries, \
     scheduled_at, started_at, error_message, created_at, updated_at";

const SCHEDULE_COLUMNS: &str = "id, job_name, job_type, description, cron_schedule, enabled, \
     timeout_seconds, max_retries, last_run_at, last_success_at, last_failure_at, \
     created_at, updated_at";

const EXECUTION_COLUMNS: &str = "id, job_schedule_id, job_name, started_at, finished_at, \
     status, duration_ms, error_message, output";

const CAMPAIGN_COLUMNS: &str = "id, company_id, name, template_id, subject, html_body, \
     from_email, from_name, status, scheduled_at, sent_at, is_archived, created_at, updated_at";

const USAGE_COLUMNS: &str =
    "id, company_id, remaining_emails, emails_sent, period_start, period_end";

/// Postgres store sharing one connection pool.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: Arc<PgPool>,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Open a pool against `database_url`.
    pub async fn connect(database_url: &str, max_connections: u32) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    /// Apply the bundled schema migrations.
    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("./migrations")
            .run(&*self.pool)
            .await
            .map_err(|e| StoreError::Unavailable(format!("migration failed: {e}")))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn fetch_schedule(&self, job_name: &str) -> StoreResult<JobSchedule> {
        self.get_schedule(job_name)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("job schedule {job_name}")))
    }

    async fn stamp_schedule(
        &self,
        operation: &'static str,
        column: &'static str,
        job_name: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let sql = format!(
            "UPDATE job_schedules SET {column} = $2, updated_at = $2 WHERE job_name = $1"
        );
        let result = sqlx::query(&sql)
            .bind(job_name)
            .bind(at)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("job schedule {job_name}")));
        }
        Ok(())
    }
}

#[async_trait]
impl TaskStore for PostgresStore {
    #[instrument(skip(self, task), fields(task_id = %task.id, task_type = %task.task_type), err)]
    async fn create_task(&self, task: Task) -> StoreResult<TaskId> {
        sqlx::query(
            r#"
            INSERT INTO tasks (
                id, task_type, payload, status, retry_count, max_retries,
                scheduled_at, started_at, error_message, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(task.id.as_uuid())
        .bind(&task.task_type)
        .bind(&task.payload)
        .bind(task.status.as_str())
        .bind(task.retry_count as i32)
        .bind(task.max_retries as i32)
        .bind(task.scheduled_at)
        .bind(task.started_at)
        .bind(&task.error_message)
        .bind(task.created_at)
        .bind(task.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("create_task", e))?;
        Ok(task.id)
    }

    #[instrument(skip(self), fields(task_id = %id), err)]
    async fn get_task(&self, id: TaskId) -> StoreResult<Option<Task>> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_task", e))?;
        row.map(|r| decode_row::<TaskRow>(&r).map(Into::into))
            .transpose()
    }

    #[instrument(skip(self), err)]
    async fn claim_next_task(&self, now: DateTime<Utc>) -> StoreResult<Option<Task>> {
        let sql = format!(
            r#"
            UPDATE tasks
            SET status = 'processing', started_at = $1, updated_at = $1
            WHERE id = (
                SELECT id FROM tasks
                WHERE status = 'pending' AND scheduled_at <= $1
                ORDER BY scheduled_at ASC, created_at ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {TASK_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(now)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("claim_next_task", e))?;
        row.map(|r| decode_row::<TaskRow>(&r).map(Into::into))
            .transpose()
    }

    #[instrument(skip(self, claimed), fields(task_id = %claimed.id), err)]
    async fn mark_task_completed(&self, claimed: &Task) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'completed', error_message = NULL, updated_at = NOW()
            WHERE id = $1 AND status = 'processing' AND started_at IS NOT DISTINCT FROM $2
            "#,
        )
        .bind(claimed.id.as_uuid())
        .bind(claimed.started_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_task_completed", e))?;
        ensure_held(result.rows_affected(), claimed)
    }

    #[instrument(skip(self, claimed, failure), fields(task_id = %claimed.id, terminal = failure.is_terminal()), err)]
    async fn mark_task_failed(&self, claimed: &Task, failure: TaskFailure) -> StoreResult<()> {
        let result = match &failure {
            TaskFailure::Retry {
                retry_count,
                retry_at,
                error,
            } => sqlx::query(
                r#"
                UPDATE tasks
                SET status = 'pending', retry_count = $3, scheduled_at = $4,
                    started_at = NULL, error_message = $5, updated_at = NOW()
                WHERE id = $1 AND status = 'processing' AND started_at IS NOT DISTINCT FROM $2
                "#,
            )
            .bind(claimed.id.as_uuid())
            .bind(claimed.started_at)
            .bind(*retry_count as i32)
            .bind(*retry_at)
            .bind(error)
            .execute(&*self.pool)
            .await,
            TaskFailure::Terminal { retry_count, error } => sqlx::query(
                r#"
                UPDATE tasks
                SET status = 'failed', retry_count = $3, error_message = $4, updated_at = NOW()
                WHERE id = $1 AND status = 'processing' AND started_at IS NOT DISTINCT FROM $2
                "#,
            )
            .bind(claimed.id.as_uuid())
            .bind(claimed.started_at)
            .bind(*retry_count as i32)
            .bind(error)
            .execute(&*self.pool)
            .await,
        }
        .map_err(|e| map_sqlx_error("mark_task_failed", e))?;
        ensure_held(result.rows_affected(), claimed)
    }

    #[instrument(skip(self), err)]
    async fn reset_stale_tasks(&self, stale_before: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'pending', started_at = NULL, updated_at = NOW()
            WHERE status = 'processing'
              AND (started_at IS NULL OR started_at < $1)
            "#,
        )
        .bind(stale_before)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("reset_stale_tasks", e))?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self), err)]
    async fn task_counts_by_status(&self) -> StoreResult<TaskCounts> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM tasks GROUP BY status")
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("task_counts_by_status", e))?;

        let mut counts = TaskCounts::default();
        for row in rows {
            let status: String = row.try_get("status").map_err(corrupt)?;
            let n: i64 = row.try_get("n").map_err(corrupt)?;
            let n = n.max(0) as u64;
            match status.parse::<TaskStatus>() {
                Ok(TaskStatus::Pending) => counts.pending = n,
                Ok(TaskStatus::Processing) => counts.processing = n,
                Ok(TaskStatus::Completed) => counts.completed = n,
                Ok(TaskStatus::Failed) => counts.failed = n,
                Err(e) => return Err(StoreError::Corrupt(e.to_string())),
            }
        }
        Ok(counts)
    }

    #[instrument(skip(self), err)]
    async fn cleanup_tasks_older_than(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM tasks
            WHERE status IN ('completed', 'failed') AND updated_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("cleanup_tasks_older_than", e))?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl ScheduleStore for PostgresStore {
    #[instrument(skip(self), err)]
    async fn get_schedule(&self, job_name: &str) -> StoreResult<Option<JobSchedule>> {
        let sql = format!("SELECT {SCHEDULE_COLUMNS} FROM job_schedules WHERE job_name = $1");
        let row = sqlx::query(&sql)
            .bind(job_name)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_schedule", e))?;
        row.map(|r| decode_row::<ScheduleRow>(&r).map(Into::into))
            .transpose()
    }

    #[instrument(skip(self, new), fields(job_name = %new.job_name), err)]
    async fn create_schedule_if_absent(&self, new: NewJobSchedule) -> StoreResult<JobSchedule> {
        let job_name = new.job_name.clone();
        let schedule = JobSchedule::from_new(new, Utc::now());
        sqlx::query(
            r#"
            INSERT INTO job_schedules (
                id, job_name, job_type, description, cron_schedule, enabled,
                timeout_seconds, max_retries, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $9)
            ON CONFLICT (job_name) DO NOTHING
            "#,
        )
        .bind(schedule.id.as_uuid())
        .bind(&schedule.job_name)
        .bind(&schedule.job_type)
        .bind(&schedule.description)
        .bind(&schedule.cron_schedule)
        .bind(schedule.enabled)
        .bind(schedule.timeout_seconds)
        .bind(schedule.max_retries)
        .bind(schedule.created_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("create_schedule_if_absent", e))?;

        self.fetch_schedule(&job_name).await
    }

    #[instrument(skip(self), err)]
    async fn list_schedules(&self) -> StoreResult<Vec<JobSchedule>> {
        let sql = format!("SELECT {SCHEDULE_COLUMNS} FROM job_schedules ORDER BY job_name");
        let rows = sqlx::query(&sql)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_schedules", e))?;
        rows.iter()
            .map(|r| decode_row::<ScheduleRow>(r).map(Into::into))
            .collect()
    }

    #[instrument(skip(self), err)]
    async fn set_enabled(&self, job_name: &str, enabled: bool) -> StoreResult<JobSchedule> {
        let sql = format!(
            "UPDATE job_schedules SET enabled = $2, updated_at = NOW() \
             WHERE job_name = $1 RETURNING {SCHEDULE_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(job_name)
            .bind(enabled)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("set_enabled", e))?
            .ok_or_else(|| StoreError::NotFound(format!("job schedule {job_name}")))?;
        decode_row::<ScheduleRow>(&row).map(Into::into)
    }

    #[instrument(skip(self, update), err)]
    async fn update_schedule(
        &self,
        job_name: &str,
        update: &ScheduleUpdate,
    ) -> StoreResult<JobSchedule> {
        let sql = format!(
            r#"
            UPDATE job_schedules
            SET cron_schedule = COALESCE($2, cron_schedule),
                timeout_seconds = COALESCE($3, timeout_seconds),
                max_retries = COALESCE($4, max_retries),
                updated_at = NOW()
            WHERE job_name = $1
            RETURNING {SCHEDULE_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(job_name)
            .bind(&update.cron_schedule)
            .bind(update.timeout_seconds)
            .bind(update.max_retries)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("update_schedule", e))?
            .ok_or_else(|| StoreError::NotFound(format!("job schedule {job_name}")))?;
        decode_row::<ScheduleRow>(&row).map(Into::into)
    }

    async fn mark_run_started(&self, job_name: &str, at: DateTime<Utc>) -> StoreResult<()> {
        self.stamp_schedule("mark_run_started", "last_run_at", job_name, at)
            .await
    }

    async fn mark_run_succeeded(&self, job_name: &str, at: DateTime<Utc>) -> StoreResult<()> {
        self.stamp_schedule("mark_run_succeeded", "last_success_at", job_name, at)
            .await
    }

    async fn mark_run_failed(&self, job_name: &str, at: DateTime<Utc>) -> StoreResult<()> {
        self.stamp_schedule("mark_run_failed", "last_failure_at", job_name, at)
            .await
    }

    #[instrument(skip(self, log), fields(execution_id = %log.id, job_name = %log.job_name), err)]
    async fn create_execution_log(&self, log: &JobExecutionLog) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO job_execution_logs (
                id, job_schedule_id, job_name, started_at, finished_at,
                status, duration_ms, error_message, output
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(log.id.as_uuid())
        .bind(log.job_schedule_id.as_uuid())
        .bind(&log.job_name)
        .bind(log.started_at)
        .bind(log.finished_at)
        .bind(log.status.as_str())
        .bind(log.duration_ms)
        .bind(&log.error_message)
        .bind(&log.output)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("create_execution_log", e))?;
        Ok(())
    }

    #[instrument(skip(self, outcome), fields(execution_id = %id, status = %outcome.status), err)]
    async fn finish_execution_log(
        &self,
        id: ExecutionLogId,
        outcome: &ExecutionOutcome,
    ) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE job_execution_logs
            SET finished_at = $2, status = $3, duration_ms = $4, error_message = $5, output = $6
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .bind(outcome.finished_at)
        .bind(outcome.status.as_str())
        .bind(outcome.duration_ms)
        .bind(&outcome.error_message)
        .bind(&outcome.output)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("finish_execution_log", e))?;
        ensure_affected(result.rows_affected(), || format!("execution log {id}"))
    }

    #[instrument(skip(self), err)]
    async fn list_execution_history(
        &self,
        job_name: &str,
        limit: usize,
    ) -> StoreResult<Vec<JobExecutionLog>> {
        let sql = format!(
            "SELECT {EXECUTION_COLUMNS} FROM job_execution_logs \
             WHERE job_name = $1 ORDER BY started_at DESC LIMIT $2"
        );
        let rows = sqlx::query(&sql)
            .bind(job_name)
            .bind(limit as i64)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_execution_history", e))?;
        rows.iter()
            .map(|r| decode_row::<ExecutionRow>(r).map(Into::into))
            .collect()
    }
}

#[async_trait]
impl CampaignStore for PostgresStore {
    #[instrument(skip(self), fields(company_id = %company_id, campaign_id = %campaign_id), err)]
    async fn get_campaign(
        &self,
        company_id: CompanyId,
        campaign_id: CampaignId,
    ) -> StoreResult<Option<Campaign>> {
        let sql =
            format!("SELECT {CAMPAIGN_COLUMNS} FROM campaigns WHERE id = $1 AND company_id = $2");
        let row = sqlx::query(&sql)
            .bind(campaign_id.as_uuid())
            .bind(company_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_campaign", e))?;
        row.map(|r| decode_row::<CampaignRow>(&r).map(Into::into))
            .transpose()
    }

    #[instrument(skip(self), fields(campaign_id = %campaign_id, status = %status), err)]
    async fn update_campaign_status(
        &self,
        campaign_id: CampaignId,
        status: CampaignStatus,
    ) -> StoreResult<()> {
        let result =
            sqlx::query("UPDATE campaigns SET status = $2, updated_at = NOW() WHERE id = $1")
                .bind(campaign_id.as_uuid())
                .bind(status.as_str())
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("update_campaign_status", e))?;
        ensure_affected(result.rows_affected(), || format!("campaign {campaign_id}"))
    }

    #[instrument(skip(self), fields(campaign_id = %campaign_id), err)]
    async fn mark_campaign_sent(
        &self,
        campaign_id: CampaignId,
        sent_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE campaigns SET status = 'sent', sent_at = $2, updated_at = $2 WHERE id = $1",
        )
        .bind(campaign_id.as_uuid())
        .bind(sent_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_campaign_sent", e))?;
        ensure_affected(result.rows_affected(), || format!("campaign {campaign_id}"))
    }

    #[instrument(skip(self), err)]
    async fn find_due_campaigns(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<Campaign>> {
        let sql = format!(
            r#"
            SELECT {CAMPAIGN_COLUMNS} FROM campaigns
            WHERE status NOT IN ('sent', 'failed') AND NOT is_archived AND scheduled_at <= $1
            ORDER BY scheduled_at ASC
            LIMIT $2
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(now)
            .bind(limit as i64)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_due_campaigns", e))?;
        rows.iter()
            .map(|r| decode_row::<CampaignRow>(r).map(Into::into))
            .collect()
    }

    #[instrument(skip(self), fields(campaign_id = %campaign_id), err)]
    async fn get_contact_emails_for_campaign(
        &self,
        campaign_id: CampaignId,
    ) -> StoreResult<Vec<String>> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT c.email
            FROM campaign_contact_groups g
            JOIN contact_group_members m ON m.group_id = g.group_id
            JOIN contacts c ON c.id = m.contact_id
            WHERE g.campaign_id = $1 AND NOT c.unsubscribed
            ORDER BY c.email
            "#,
        )
        .bind(campaign_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_contact_emails_for_campaign", e))?;
        rows.iter()
            .map(|r| r.try_get::<String, _>("email").map_err(corrupt))
            .collect()
    }

    #[instrument(skip(self, error), fields(campaign_id = %error.campaign_id, error_type = %error.error_type), err)]
    async fn create_campaign_error(&self, error: &CampaignError) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO campaign_errors (id, campaign_id, company_id, error_type, error_message, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(error.id)
        .bind(error.campaign_id.as_uuid())
        .bind(error.company_id.as_uuid())
        .bind(&error.error_type)
        .bind(&error.error_message)
        .bind(error.created_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("create_campaign_error", e))?;
        Ok(())
    }

    #[instrument(skip(self, result), fields(campaign_id = %result.campaign_id), err)]
    async fn create_email_campaign_result(
        &self,
        result: NewEmailCampaignResult,
    ) -> StoreResult<EmailCampaignResult> {
        let id = Uuid::now_v7();
        let row = sqlx::query(
            r#"
            INSERT INTO email_campaign_results (id, campaign_id, company_id, recipient_email, sent_at, version)
            SELECT $1, $2, $3, $4, $5, COALESCE(MAX(version), 0) + 1
            FROM email_campaign_results
            WHERE campaign_id = $2 AND recipient_email = $4
            RETURNING version
            "#,
        )
        .bind(id)
        .bind(result.campaign_id.as_uuid())
        .bind(result.company_id.as_uuid())
        .bind(&result.recipient_email)
        .bind(result.sent_at)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("create_email_campaign_result", e))?;
        let version: i32 = row.try_get("version").map_err(corrupt)?;

        let mut stored = EmailCampaignResult::from_new(result, version);
        stored.id = id;
        Ok(stored)
    }
}

#[async_trait]
impl UsageStore for PostgresStore {
    #[instrument(skip(self), fields(company_id = %company_id), err)]
    async fn get_current_usage(
        &self,
        company_id: CompanyId,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<EmailUsageRecord>> {
        let sql = format!(
            r#"
            SELECT {USAGE_COLUMNS} FROM email_usage
            WHERE company_id = $1 AND period_start <= $2 AND period_end > $2
            ORDER BY period_start DESC
            LIMIT 1
            "#
        );
        let row = sqlx::query(&sql)
            .bind(company_id.as_uuid())
            .bind(now)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_current_usage", e))?;
        row.map(|r| decode_row::<UsageRow>(&r).map(Into::into))
            .transpose()
    }

    #[instrument(skip(self), fields(company_id = %company_id, sent = sent), err)]
    async fn increment_usage(
        &self,
        company_id: CompanyId,
        now: DateTime<Utc>,
        sent: i64,
    ) -> StoreResult<EmailUsageRecord> {
        let sql = format!(
            r#"
            UPDATE email_usage
            SET emails_sent = emails_sent + $3,
                remaining_emails = GREATEST(remaining_emails - $3, 0),
                updated_at = NOW()
            WHERE id = (
                SELECT id FROM email_usage
                WHERE company_id = $1 AND period_start <= $2 AND period_end > $2
                ORDER BY period_start DESC
                LIMIT 1
            )
            RETURNING {USAGE_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(company_id.as_uuid())
            .bind(now)
            .bind(sent)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("increment_usage", e))?
            .ok_or_else(|| StoreError::NotFound(format!("usage record for company {company_id}")))?;
        decode_row::<UsageRow>(&row).map(Into::into)
    }
}

#[async_trait]
impl DomainStore for PostgresStore {
    #[instrument(skip(self), fields(company_id = %company_id), err)]
    async fn find_verified_domain(
        &self,
        company_id: CompanyId,
        domain: &str,
    ) -> StoreResult<Option<SendingDomain>> {
        let row = sqlx::query(
            r#"
            SELECT company_id, domain, verified, dkim_selector, dkim_private_key
            FROM sending_domains
            WHERE company_id = $1 AND lower(domain) = lower($2) AND verified
            "#,
        )
        .bind(company_id.as_uuid())
        .bind(domain)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_verified_domain", e))?;
        row.map(|r| decode_row::<DomainRow>(&r).map(Into::into))
            .transpose()
    }
}

#[async_trait]
impl AuditStore for PostgresStore {
    #[instrument(skip(self, log), fields(audit_id = %log.id, action = %log.action), err)]
    async fn create_audit_log(&self, log: &AuditLog) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO audit_logs (
                id, company_id, user_id, action, resource, resource_id, details, ip_address, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(log.id)
        .bind(log.company_id.as_uuid())
        .bind(log.user_id.map(Uuid::from))
        .bind(log.action.as_str())
        .bind(&log.resource)
        .bind(&log.resource_id)
        .bind(&log.details)
        .bind(&log.ip_address)
        .bind(log.created_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("create_audit_log", e))?;
        Ok(())
    }
}

#[async_trait]
impl NotificationStore for PostgresStore {
    #[instrument(skip(self, notification), fields(notification_id = %notification.id), err)]
    async fn create_user_notification(&self, notification: &UserNotification) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO user_notifications (id, user_id, title, message, kind, read, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(notification.id)
        .bind(notification.user_id.as_uuid())
        .bind(&notification.title)
        .bind(&notification.message)
        .bind(&notification.kind)
        .bind(notification.read)
        .bind(notification.created_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("create_user_notification", e))?;
        Ok(())
    }

    #[instrument(skip(self, notification), fields(notification_id = %notification.id), err)]
    async fn create_admin_notification(
        &self,
        notification: &AdminNotification,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO admin_notifications (id, company_id, title, message, kind, read, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(notification.id)
        .bind(notification.company_id.map(Uuid::from))
        .bind(&notification.title)
        .bind(&notification.message)
        .bind(&notification.kind)
        .bind(notification.read)
        .bind(notification.created_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("create_admin_notification", e))?;
        Ok(())
    }
}

/// Map SQLx errors to `StoreError`.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                // Unique, foreign key and check violations
                Some("23505") | Some("23503") | Some("23514") => StoreError::Conflict(msg),
                _ => StoreError::Unavailable(msg),
            }
        }
        sqlx::Error::RowNotFound => {
            StoreError::NotFound(format!("unexpected row not found in {}", operation))
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            StoreError::Corrupt(format!("decode error in {}: {}", operation, err))
        }
        _ => StoreError::Unavailable(format!("sqlx error in {}: {}", operation, err)),
    }
}

fn corrupt(err: sqlx::Error) -> StoreError {
    StoreError::Corrupt(err.to_string())
}

fn decode_row<'r, T: FromRow<'r, PgRow>>(row: &'r PgRow) -> StoreResult<T> {
    T::from_row(row).map_err(corrupt)
}

fn ensure_affected(rows: u64, what: impl FnOnce() -> String) -> StoreResult<()> {
    if rows == 0 {
        return Err(StoreError::NotFound(what()));
    }
    Ok(())
}

/// A settle that matched no row lost its claim to a stale sweep.
fn ensure_held(rows: u64, claimed: &Task) -> StoreResult<()> {
    if rows == 0 {
        return Err(StoreError::Conflict(format!(
            "task {} is no longer held by this claim",
            claimed.id
        )));
    }
    Ok(())
}

/// Parse a status column, surfacing bad values as a decode error.
fn parse_column<T>(row: &PgRow, column: &str) -> Result<T, sqlx::Error>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.try_get(column)?;
    raw.parse::<T>().map_err(|e| sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: Box::new(e),
    })
}

fn to_u32(value: i32) -> u32 {
    value.max(0) as u32
}

#[derive(Debug)]
struct TaskRow(Task);

impl<'r> sqlx::FromRow<'r, PgRow> for TaskRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let id: Uuid = row.try_get("id")?;
        Ok(TaskRow(Task {
            id: TaskId::from_uuid(id),
            task_type: row.try_get("task_type")?,
            payload: row.try_get("payload")?,
            status: parse_column(row, "status")?,
            retry_count: to_u32(row.try_get("retry_count")?),
            max_retries: to_u32(row.try_get("max_retries")?),
            scheduled_at: row.try_get("scheduled_at")?,
            started_at: row.try_get("started_at")?,
            error_message: row.try_get("error_message")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        }))
    }
}

impl From<TaskRow> for Task {
    fn from(row: TaskRow) -> Self {
        row.0
    }
}

#[derive(Debug)]
struct ScheduleRow(JobSchedule);

impl<'r> sqlx::FromRow<'r, PgRow> for ScheduleRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let id: Uuid = row.try_get("id")?;
        Ok(ScheduleRow(JobSchedule {
            id: JobScheduleId::from_uuid(id),
            job_name: row.try_get("job_name")?,
            job_type: row.try_get("job_type")?,
            description: row.try_get("description")?,
            cron_schedule: row.try_get("cron_schedule")?,
            enabled: row.try_get("enabled")?,
            timeout_seconds: row.try_get("timeout_seconds")?,
            max_retries: row.try_get("max_retries")?,
            last_run_at: row.try_get("last_run_at")?,
            last_success_at: row.try_get("last_success_at")?,
            last_failure_at: row.try_get("last_failure_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        }))
    }
}

impl From<ScheduleRow> for JobSchedule {
    fn from(row: ScheduleRow) -> Self {
        row.0
    }
}

#[derive(Debug)]
struct ExecutionRow(JobExecutionLog);

impl<'r> sqlx::FromRow<'r, PgRow> for ExecutionRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let id: Uuid = row.try_get("id")?;
        let schedule_id: Uuid = row.try_get("job_schedule_id")?;
        Ok(ExecutionRow(JobExecutionLog {
            id: ExecutionLogId::from_uuid(id),
            job_schedule_id: JobScheduleId::from_uuid(schedule_id),
            job_name: row.try_get("job_name")?,
            started_at: row.try_get("started_at")?,
            finished_at: row.try_get("finished_at")?,
            status: parse_column::<ExecutionStatus>(row, "status")?,
            duration_ms: row.try_get("duration_ms")?,
            error_message: row.try_get("error_message")?,
            output: row.try_get("output")?,
        }))
    }
}

impl From<ExecutionRow> for JobExecutionLog {
    fn from(row: ExecutionRow) -> Self {
        row.0
    }
}

#[derive(Debug)]
struct CampaignRow(Campaign);

impl<'r> sqlx::FromRow<'r, PgRow> for CampaignRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let id: Uuid = row.try_get("id")?;
        let company_id: Uuid = row.try_get("company_id")?;
        Ok(CampaignRow(Campaign {
            id: CampaignId::from_uuid(id),
            company_id: CompanyId::from_uuid(company_id),
            name: row.try_get("name")?,
            template_id: row.try_get("template_id")?,
            subject: row.try_get("subject")?,
            html_body: row.try_get("html_body")?,
            from_email: row.try_get("from_email")?,
            from_name: row.try_get("from_name")?,
            status: parse_column(row, "status")?,
            scheduled_at: row.try_get("scheduled_at")?,
            sent_at: row.try_get("sent_at")?,
            is_archived: row.try_get("is_archived")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        }))
    }
}

impl From<CampaignRow> for Campaign {
    fn from(row: CampaignRow) -> Self {
        row.0
    }
}

#[derive(Debug)]
struct UsageRow(EmailUsageRecord);

impl<'r> sqlx::FromRow<'r, PgRow> for UsageRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let company_id: Uuid = row.try_get("company_id")?;
        Ok(UsageRow(EmailUsageRecord {
            id: row.try_get("id")?,
            company_id: CompanyId::from_uuid(company_id),
            remaining_emails: row.try_get("remaining_emails")?,
            emails_sent: row.try_get("emails_sent")?,
            period_start: row.try_get("period_start")?,
            period_end: row.try_get("period_end")?,
        }))
    }
}

impl From<UsageRow> for EmailUsageRecord {
    fn from(row: UsageRow) -> Self {
        row.0
    }
}

#[derive(Debug)]
struct DomainRow(SendingDomain);

impl<'r> sqlx::FromRow<'r, PgRow> for DomainRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let company_id: Uuid = row.try_get("company_id")?;
        Ok(DomainRow(SendingDomain {
            company_id: CompanyId::from_uuid(company_id),
            domain: row.try_get("domain")?,
            verified: row.try_get("verified")?,
            dkim_selector: row.try_get("dkim_selector")?,
            dkim_private_key: row.try_get("dkim_private_key")?,
        }))
    }
}

impl From<DomainRow> for SendingDomain {
    fn from(row: DomainRow) -> Self {
        row.0
    }
}
