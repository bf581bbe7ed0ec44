use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use mailforge_core::{
    AdminNotification, AuditLog, Campaign, CampaignError, CampaignId, CampaignStatus, CompanyId,
    EmailCampaignResult, EmailUsageRecord, ExecutionLogId, ExecutionOutcome, JobExecutionLog,
    JobSchedule, NewEmailCampaignResult, NewJobSchedule, ScheduleUpdate, SendingDomain, Task,
    TaskFailure, TaskId, TaskStatus, UserNotification,
};

use super::r#trait::{
    AuditStore, CampaignStore, DomainStore, NotificationStore, ScheduleStore, StoreError,
    StoreResult, TaskCounts, TaskStore, UsageStore,
};

/// Operations of the in-memory store that can be made to fail on purpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    CreateExecutionLog,
    GetContacts,
    IncrementUsage,
}

#[derive(Debug, Default)]
struct Inner {
    tasks: HashMap<TaskId, Task>,
    schedules: HashMap<String, JobSchedule>,
    executions: Vec<JobExecutionLog>,
    campaigns: HashMap<CampaignId, Campaign>,
    contacts: HashMap<CampaignId, Vec<String>>,
    campaign_errors: Vec<CampaignError>,
    campaign_results: Vec<EmailCampaignResult>,
    usage: HashMap<CompanyId, EmailUsageRecord>,
    domains: Vec<SendingDomain>,
    audit_logs: Vec<AuditLog>,
    user_notifications: Vec<UserNotification>,
    admin_notifications: Vec<AdminNotification>,
    fail_points: HashMap<FailPoint, u32>,
}

impl Inner {
    /// Consume one injected failure for `point`, if any is armed.
    fn trip(&mut self, point: FailPoint) -> StoreResult<()> {
        match self.fail_points.get_mut(&point) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Err(StoreError::Unavailable(format!("injected failure: {point:?}")))
            }
            _ => Ok(()),
        }
    }

    /// The task `claimed` refers to, provided that claim still holds it.
    fn held_task_mut(&mut self, claimed: &Task) -> StoreResult<&mut Task> {
        let id = claimed.id;
        let task = self
            .tasks
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("task {id}")))?;
        if task.status != TaskStatus::Processing || task.started_at != claimed.started_at {
            return Err(StoreError::Conflict(format!(
                "task {id} is no longer held by this claim"
            )));
        }
        Ok(task)
    }

    fn schedule_mut(&mut self, job_name: &str) -> StoreResult<&mut JobSchedule> {
        self.schedules
            .get_mut(job_name)
            .ok_or_else(|| StoreError::NotFound(format!("job schedule {job_name}")))
    }

    fn campaign_mut(&mut self, campaign_id: CampaignId) -> StoreResult<&mut Campaign> {
        self.campaigns
            .get_mut(&campaign_id)
            .ok_or_else(|| StoreError::NotFound(format!("campaign {campaign_id}")))
    }
}

/// In-memory implementation of every store trait.
///
/// Intended for tests/dev. A single lock guards all tables, which is what makes
/// `claim_next_task` atomic.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    inner: RwLock<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> StoreResult<RwLockReadGuard<'_, Inner>> {
        self.inner
            .read()
            .map_err(|_| StoreError::Unavailable("in-memory store lock poisoned".into()))
    }

    fn write(&self) -> StoreResult<RwLockWriteGuard<'_, Inner>> {
        self.inner
            .write()
            .map_err(|_| StoreError::Unavailable("in-memory store lock poisoned".into()))
    }

    /// Make the next `times` calls of `point` fail with `StoreError::Unavailable`.
    pub fn inject_failure(&self, point: FailPoint, times: u32) {
        if let Ok(mut inner) = self.write() {
            inner.fail_points.insert(point, times);
        }
    }

    pub fn insert_campaign(&self, campaign: Campaign) {
        if let Ok(mut inner) = self.write() {
            inner.campaigns.insert(campaign.id, campaign);
        }
    }

    pub fn set_contacts(&self, campaign_id: CampaignId, emails: Vec<String>) {
        if let Ok(mut inner) = self.write() {
            inner.contacts.insert(campaign_id, emails);
        }
    }

    pub fn set_usage(&self, usage: EmailUsageRecord) {
        if let Ok(mut inner) = self.write() {
            inner.usage.insert(usage.company_id, usage);
        }
    }

    pub fn insert_domain(&self, domain: SendingDomain) {
        if let Ok(mut inner) = self.write() {
            inner.domains.push(domain);
        }
    }

    /// Overwrite the claim timestamp of a task, e.g. to simulate a crashed worker.
    pub fn set_task_started_at(&self, id: TaskId, started_at: DateTime<Utc>) {
        if let Ok(mut inner) = self.write() {
            if let Some(task) = inner.tasks.get_mut(&id) {
                task.started_at = Some(started_at);
            }
        }
    }

    pub fn tasks(&self) -> Vec<Task> {
        self.read()
            .map(|inner| inner.tasks.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn campaign(&self, campaign_id: CampaignId) -> Option<Campaign> {
        self.read()
            .ok()
            .and_then(|inner| inner.campaigns.get(&campaign_id).cloned())
    }

    pub fn campaign_errors(&self, campaign_id: CampaignId) -> Vec<CampaignError> {
        self.read()
            .map(|inner| {
                inner
                    .campaign_errors
                    .iter()
                    .filter(|e| e.campaign_id == campaign_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn campaign_results(&self, campaign_id: CampaignId) -> Vec<EmailCampaignResult> {
        self.read()
            .map(|inner| {
                inner
                    .campaign_results
                    .iter()
                    .filter(|r| r.campaign_id == campaign_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn usage(&self, company_id: CompanyId) -> Option<EmailUsageRecord> {
        self.read()
            .ok()
            .and_then(|inner| inner.usage.get(&company_id).cloned())
    }

    pub fn audit_logs(&self) -> Vec<AuditLog> {
        self.read()
            .map(|inner| inner.audit_logs.clone())
            .unwrap_or_default()
    }

    pub fn user_notifications(&self) -> Vec<UserNotification> {
        self.read()
            .map(|inner| inner.user_notifications.clone())
            .unwrap_or_default()
    }

    pub fn admin_notifications(&self) -> Vec<AdminNotification> {
        self.read()
            .map(|inner| inner.admin_notifications.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl TaskStore for InMemoryStore {
    async fn create_task(&self, task: Task) -> StoreResult<TaskId> {
        let mut inner = self.write()?;
        if inner.tasks.contains_key(&task.id) {
            return Err(StoreError::Conflict(format!("task {} already exists", task.id)));
        }
        let id = task.id;
        inner.tasks.insert(id, task);
        Ok(id)
    }

    async fn get_task(&self, id: TaskId) -> StoreResult<Option<Task>> {
        Ok(self.read()?.tasks.get(&id).cloned())
    }

    async fn claim_next_task(&self, now: DateTime<Utc>) -> StoreResult<Option<Task>> {
        let mut inner = self.write()?;
        let next = inner
            .tasks
            .values()
            .filter(|t| t.is_eligible(now))
            .min_by_key(|t| (t.scheduled_at, t.created_at, t.id))
            .map(|t| t.id);

        let Some(id) = next else {
            return Ok(None);
        };
        let task = inner
            .tasks
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("task {id}")))?;
        task.status = TaskStatus::Processing;
        task.started_at = Some(now);
        task.updated_at = now;
        Ok(Some(task.clone()))
    }

    async fn mark_task_completed(&self, claimed: &Task) -> StoreResult<()> {
        let mut inner = self.write()?;
        let task = inner.held_task_mut(claimed)?;
        task.status = TaskStatus::Completed;
        task.error_message = None;
        task.updated_at = Utc::now();
        Ok(())
    }

    async fn mark_task_failed(&self, claimed: &Task, failure: TaskFailure) -> StoreResult<()> {
        let mut inner = self.write()?;
        let task = inner.held_task_mut(claimed)?;
        failure.apply(task, Utc::now());
        Ok(())
    }

    async fn reset_stale_tasks(&self, stale_before: DateTime<Utc>) -> StoreResult<u64> {
        let mut inner = self.write()?;
        let now = Utc::now();
        let mut reset = 0;
        for task in inner.tasks.values_mut() {
            let stale = task.status == TaskStatus::Processing
                && task.started_at.is_none_or(|at| at < stale_before);
            if stale {
                task.status = TaskStatus::Pending;
                task.started_at = None;
                task.updated_at = now;
                reset += 1;
            }
        }
        Ok(reset)
    }

    async fn task_counts_by_status(&self) -> StoreResult<TaskCounts> {
        let inner = self.read()?;
        let mut counts = TaskCounts::default();
        for task in inner.tasks.values() {
            match task.status {
                TaskStatus::Pending => counts.pending += 1,
                TaskStatus::Processing => counts.processing += 1,
                TaskStatus::Completed => counts.completed += 1,
                TaskStatus::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }

    async fn cleanup_tasks_older_than(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let mut inner = self.write()?;
        let before = inner.tasks.len();
        inner
            .tasks
            .retain(|_, t| !(t.status.is_terminal() && t.updated_at < cutoff));
        Ok((before - inner.tasks.len()) as u64)
    }
}

#[async_trait]
impl ScheduleStore for InMemoryStore {
    async fn get_schedule(&self, job_name: &str) -> StoreResult<Option<JobSchedule>> {
        Ok(self.read()?.schedules.get(job_name).cloned())
    }

    async fn create_schedule_if_absent(&self, new: NewJobSchedule) -> StoreResult<JobSchedule> {
        let mut inner = self.write()?;
        let schedule = inner
            .schedules
            .entry(new.job_name.clone())
            .or_insert_with(|| JobSchedule::from_new(new, Utc::now()));
        Ok(schedule.clone())
    }

    async fn list_schedules(&self) -> StoreResult<Vec<JobSchedule>> {
        let mut schedules: Vec<_> = self.read()?.schedules.values().cloned().collect();
        schedules.sort_by(|a, b| a.job_name.cmp(&b.job_name));
        Ok(schedules)
    }

    async fn set_enabled(&self, job_name: &str, enabled: bool) -> StoreResult<JobSchedule> {
        let mut inner = self.write()?;
        let schedule = inner.schedule_mut(job_name)?;
        schedule.enabled = enabled;
        schedule.updated_at = Utc::now();
        Ok(schedule.clone())
    }

    async fn update_schedule(
        &self,
        job_name: &str,
        update: &ScheduleUpdate,
    ) -> StoreResult<JobSchedule> {
        let mut inner = self.write()?;
        let schedule = inner.schedule_mut(job_name)?;
        schedule.apply_update(update, Utc::now());
        Ok(schedule.clone())
    }

    async fn mark_run_started(&self, job_name: &str, at: DateTime<Utc>) -> StoreResult<()> {
        let mut inner = self.write()?;
        let schedule = inner.schedule_mut(job_name)?;
        schedule.last_run_at = Some(at);
        schedule.updated_at = at;
        Ok(())
    }

    async fn mark_run_succeeded(&self, job_name: &str, at: DateTime<Utc>) -> StoreResult<()> {
        let mut inner = self.write()?;
        let schedule = inner.schedule_mut(job_name)?;
        schedule.last_success_at = Some(at);
        schedule.updated_at = at;
        Ok(())
    }

    async fn mark_run_failed(&self, job_name: &str, at: DateTime<Utc>) -> StoreResult<()> {
        let mut inner = self.write()?;
        let schedule = inner.schedule_mut(job_name)?;
        schedule.last_failure_at = Some(at);
        schedule.updated_at = at;
        Ok(())
    }

    async fn create_execution_log(&self, log: &JobExecutionLog) -> StoreResult<()> {
        let mut inner = self.write()?;
        inner.trip(FailPoint::CreateExecutionLog)?;
        if inner.executions.iter().any(|e| e.id == log.id) {
            return Err(StoreError::Conflict(format!("execution log {} exists", log.id)));
        }
        inner.executions.push(log.clone());
        Ok(())
    }

    async fn finish_execution_log(
        &self,
        id: ExecutionLogId,
        outcome: &ExecutionOutcome,
    ) -> StoreResult<()> {
        let mut inner = self.write()?;
        let log = inner
            .executions
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| StoreError::NotFound(format!("execution log {id}")))?;
        log.finish(outcome);
        Ok(())
    }

    async fn list_execution_history(
        &self,
        job_name: &str,
        limit: usize,
    ) -> StoreResult<Vec<JobExecutionLog>> {
        let inner = self.read()?;
        let mut history: Vec<_> = inner
            .executions
            .iter()
            .filter(|e| e.job_name == job_name)
            .cloned()
            .collect();
        history.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        history.truncate(limit);
        Ok(history)
    }
}

#[async_trait]
impl CampaignStore for InMemoryStore {
    async fn get_campaign(
        &self,
        company_id: CompanyId,
        campaign_id: CampaignId,
    ) -> StoreResult<Option<Campaign>> {
        Ok(self
            .read()?
            .campaigns
            .get(&campaign_id)
            .filter(|c| c.company_id == company_id)
            .cloned())
    }

    async fn update_campaign_status(
        &self,
        campaign_id: CampaignId,
        status: CampaignStatus,
    ) -> StoreResult<()> {
        let mut inner = self.write()?;
        let campaign = inner.campaign_mut(campaign_id)?;
        campaign.status = status;
        campaign.updated_at = Utc::now();
        Ok(())
    }

    async fn mark_campaign_sent(
        &self,
        campaign_id: CampaignId,
        sent_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut inner = self.write()?;
        let campaign = inner.campaign_mut(campaign_id)?;
        campaign.status = CampaignStatus::Sent;
        campaign.sent_at = Some(sent_at);
        campaign.updated_at = sent_at;
        Ok(())
    }

    async fn find_due_campaigns(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<Campaign>> {
        let inner = self.read()?;
        let mut due: Vec<_> = inner
            .campaigns
            .values()
            .filter(|c| {
                !c.status.is_final()
                    && !c.is_archived
                    && c.scheduled_at.is_some_and(|at| at <= now)
            })
            .cloned()
            .collect();
        due.sort_by_key(|c| c.scheduled_at);
        due.truncate(limit);
        Ok(due)
    }

    async fn get_contact_emails_for_campaign(
        &self,
        campaign_id: CampaignId,
    ) -> StoreResult<Vec<String>> {
        let mut inner = self.write()?;
        inner.trip(FailPoint::GetContacts)?;
        Ok(inner.contacts.get(&campaign_id).cloned().unwrap_or_default())
    }

    async fn create_campaign_error(&self, error: &CampaignError) -> StoreResult<()> {
        self.write()?.campaign_errors.push(error.clone());
        Ok(())
    }

    async fn create_email_campaign_result(
        &self,
        result: NewEmailCampaignResult,
    ) -> StoreResult<EmailCampaignResult> {
        let mut inner = self.write()?;
        let previous = inner
            .campaign_results
            .iter()
            .filter(|r| {
                r.campaign_id == result.campaign_id && r.recipient_email == result.recipient_email
            })
            .map(|r| r.version)
            .max()
            .unwrap_or(0);
        let stored = EmailCampaignResult::from_new(result, previous + 1);
        inner.campaign_results.push(stored.clone());
        Ok(stored)
    }
}

#[async_trait]
impl UsageStore for InMemoryStore {
    async fn get_current_usage(
        &self,
        company_id: CompanyId,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<EmailUsageRecord>> {
        Ok(self
            .read()?
            .usage
            .get(&company_id)
            .filter(|u| u.covers(now))
            .cloned())
    }

    async fn increment_usage(
        &self,
        company_id: CompanyId,
        now: DateTime<Utc>,
        sent: i64,
    ) -> StoreResult<EmailUsageRecord> {
        let mut inner = self.write()?;
        inner.trip(FailPoint::IncrementUsage)?;
        let usage = inner
            .usage
            .get_mut(&company_id)
            .filter(|u| u.covers(now))
            .ok_or_else(|| StoreError::NotFound(format!("usage record for company {company_id}")))?;
        usage.record_sent(sent);
        Ok(usage.clone())
    }
}

#[async_trait]
impl DomainStore for InMemoryStore {
    async fn find_verified_domain(
        &self,
        company_id: CompanyId,
        domain: &str,
    ) -> StoreResult<Option<SendingDomain>> {
        Ok(self
            .read()?
            .domains
            .iter()
            .find(|d| {
                d.company_id == company_id && d.verified && d.domain.eq_ignore_ascii_case(domain)
            })
            .cloned())
    }
}

#[async_trait]
impl AuditStore for InMemoryStore {
    async fn create_audit_log(&self, log: &AuditLog) -> StoreResult<()> {
        let mut inner = self.write()?;
        if !inner.audit_logs.iter().any(|l| l.id == log.id) {
            inner.audit_logs.push(log.clone());
        }
        Ok(())
    }
}

#[async_trait]
impl NotificationStore for InMemoryStore {
    async fn create_user_notification(&self, notification: &UserNotification) -> StoreResult<()> {
        let mut inner = self.write()?;
        if !inner.user_notifications.iter().any(|n| n.id == notification.id) {
            inner.user_notifications.push(notification.clone());
        }
        Ok(())
    }

    async fn create_admin_notification(
        &self,
        notification: &AdminNotification,
    ) -> StoreResult<()> {
        let mut inner = self.write()?;
        if !inner.admin_notifications.iter().any(|n| n.id == notification.id) {
            inner.admin_notifications.push(notification.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use chrono::Duration;
    use mailforge_core::{CampaignEmailPayload, TaskKind};

    use super::*;

    fn kind() -> TaskKind {
        TaskKind::SendCampaignEmail(CampaignEmailPayload {
            company_id: CompanyId::new(),
            user_id: None,
            campaign_id: CampaignId::new(),
        })
    }

    fn task_at(at: DateTime<Utc>) -> Task {
        Task::new(&kind(), 3, at).unwrap()
    }

    #[tokio::test]
    async fn claim_marks_processing_and_skips_future_tasks() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let future = store.create_task(task_at(now + Duration::hours(1))).await.unwrap();
        let due = store.create_task(task_at(now - Duration::seconds(1))).await.unwrap();

        let claimed = store.claim_next_task(now).await.unwrap().unwrap();
        assert_eq!(claimed.id, due);
        assert_eq!(claimed.status, TaskStatus::Processing);
        assert_eq!(claimed.started_at, Some(now));

        assert!(store.claim_next_task(now).await.unwrap().is_none());
        let still_pending = store.get_task(future).await.unwrap().unwrap();
        assert_eq!(still_pending.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn claims_oldest_schedule_first() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let newer = store.create_task(task_at(now - Duration::seconds(1))).await.unwrap();
        let older = store.create_task(task_at(now - Duration::seconds(10))).await.unwrap();

        assert_eq!(store.claim_next_task(now).await.unwrap().unwrap().id, older);
        assert_eq!(store.claim_next_task(now).await.unwrap().unwrap().id, newer);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_claims_never_hand_out_the_same_task() {
        let store = Arc::new(InMemoryStore::new());
        let now = Utc::now();
        for _ in 0..50 {
            store.create_task(task_at(now)).await.unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let mut claimed = Vec::new();
                while let Some(task) = store.claim_next_task(now).await.unwrap() {
                    claimed.push(task.id);
                }
                claimed
            }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.await.unwrap() {
                assert!(seen.insert(id), "task {id} claimed twice");
            }
        }
        assert_eq!(seen.len(), 50);
    }

    #[tokio::test]
    async fn stale_sweep_resets_each_stuck_task_once() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let id = store.create_task(task_at(now)).await.unwrap();
        store.claim_next_task(now).await.unwrap().unwrap();
        store.set_task_started_at(id, now - Duration::minutes(30));

        assert_eq!(store.reset_stale_tasks(now - Duration::minutes(10)).await.unwrap(), 1);
        assert_eq!(store.reset_stale_tasks(now - Duration::minutes(10)).await.unwrap(), 0);

        let task = store.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.started_at.is_none());
    }

    #[tokio::test]
    async fn settling_a_reclaimed_task_conflicts() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let id = store.create_task(task_at(now)).await.unwrap();
        let first = store.claim_next_task(now).await.unwrap().unwrap();
        assert_eq!(store.reset_stale_tasks(now + Duration::seconds(1)).await.unwrap(), 1);
        let second = store
            .claim_next_task(now + Duration::seconds(2))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.id, id);

        let late = TaskFailure::Terminal {
            retry_count: 0,
            error: "smtp timeout".into(),
        };
        assert!(matches!(
            store.mark_task_failed(&first, late).await.unwrap_err(),
            StoreError::Conflict(_)
        ));
        assert!(matches!(
            store.mark_task_completed(&first).await.unwrap_err(),
            StoreError::Conflict(_)
        ));
        assert_eq!(store.get_task(id).await.unwrap().unwrap().status, TaskStatus::Processing);

        store.mark_task_completed(&second).await.unwrap();
        assert_eq!(store.get_task(id).await.unwrap().unwrap().status, TaskStatus::Completed);
        assert!(store.mark_task_completed(&second).await.is_err());
    }

    #[tokio::test]
    async fn cleanup_only_removes_old_terminal_tasks() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let done = store.create_task(task_at(now)).await.unwrap();
        let claimed = store.claim_next_task(now).await.unwrap().unwrap();
        store.mark_task_completed(&claimed).await.unwrap();
        let pending = store.create_task(task_at(now)).await.unwrap();

        let removed = store
            .cleanup_tasks_older_than(Utc::now() + Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(store.get_task(done).await.unwrap().is_none());
        assert!(store.get_task(pending).await.unwrap().is_some());

        let counts = store.task_counts_by_status().await.unwrap();
        assert_eq!(counts.pending, 1);
        assert_eq!(counts.total(), 1);
    }

    #[tokio::test]
    async fn schedule_creation_is_idempotent() {
        let store = InMemoryStore::new();
        let new = NewJobSchedule {
            job_name: "cleanup".into(),
            job_type: "maintenance".into(),
            description: "".into(),
            cron_schedule: "0 3 * * *".into(),
            enabled: true,
            timeout_seconds: 60,
            max_retries: 0,
        };
        let first = store.create_schedule_if_absent(new.clone()).await.unwrap();
        store.set_enabled("cleanup", false).await.unwrap();
        let second = store.create_schedule_if_absent(new).await.unwrap();

        assert_eq!(first.id, second.id);
        assert!(!second.enabled);
    }

    #[tokio::test]
    async fn result_versions_increase_per_recipient() {
        let store = InMemoryStore::new();
        let new = NewEmailCampaignResult {
            campaign_id: CampaignId::new(),
            company_id: CompanyId::new(),
            recipient_email: "a@example.com".into(),
            sent_at: Utc::now(),
        };
        assert_eq!(store.create_email_campaign_result(new.clone()).await.unwrap().version, 1);
        assert_eq!(store.create_email_campaign_result(new).await.unwrap().version, 2);
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let store = InMemoryStore::new();
        let company_id = CompanyId::new();
        let now = Utc::now();
        store.set_usage(EmailUsageRecord {
            id: uuid::Uuid::now_v7(),
            company_id,
            remaining_emails: 10,
            emails_sent: 0,
            period_start: now - Duration::days(1),
            period_end: now + Duration::days(1),
        });
        store.inject_failure(FailPoint::IncrementUsage, 1);

        assert!(store.increment_usage(company_id, now, 2).await.is_err());
        let usage = store.increment_usage(company_id, now, 2).await.unwrap();
        assert_eq!(usage.emails_sent, 2);
        assert_eq!(usage.remaining_emails, 8);
    }
}
