use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value, json};
use tracing::{info, warn};

use super::job::{CronJob, JobError};
use crate::campaign::{CampaignDispatcher, DispatchError};
use crate::jobs::TaskQueue;
use crate::store::Store;

/// Dispatches every campaign whose `scheduled_at` has passed.
pub struct ScheduledCampaignJob<S> {
    dispatcher: Arc<CampaignDispatcher<S>>,
    store: Arc<S>,
    schedule: String,
    limit: usize,
}

impl<S: Store + 'static> ScheduledCampaignJob<S> {
    pub const NAME: &'static str = "scheduled_campaigns";

    pub fn new(
        dispatcher: Arc<CampaignDispatcher<S>>,
        store: Arc<S>,
        schedule: impl Into<String>,
        limit: usize,
    ) -> Self {
        Self {
            dispatcher,
            store,
            schedule: schedule.into(),
            limit: limit.max(1),
        }
    }
}

#[async_trait]
impl<S: Store + 'static> CronJob for ScheduledCampaignJob<S> {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn job_type(&self) -> &str {
        "campaign"
    }

    fn description(&self) -> &str {
        "Send campaigns whose scheduled time has passed"
    }

    fn schedule(&self) -> &str {
        &self.schedule
    }

    /// A failure on one campaign is logged and counted; the others still go out.
    async fn run(&self) -> Result<Option<Value>, JobError> {
        let due = self.store.find_due_campaigns(Utc::now(), self.limit).await?;
        if due.is_empty() {
            return Ok(Some(json!({ "due": 0 })));
        }

        let (mut dispatched, mut rejected, mut errored, mut sent) = (0usize, 0usize, 0usize, 0usize);
        for campaign in &due {
            match self
                .dispatcher
                .dispatch(campaign.company_id, None, campaign.id)
                .await
            {
                Ok(report) => {
                    dispatched += 1;
                    sent += report.sent;
                }
                Err(DispatchError::Precondition(e)) => {
                    rejected += 1;
                    warn!(campaign_id = %campaign.id, error = %e, "scheduled campaign rejected");
                }
                Err(DispatchError::Store(e)) => {
                    errored += 1;
                    warn!(campaign_id = %campaign.id, error = %e, "scheduled campaign dispatch failed");
                }
            }
        }

        info!(due = due.len(), dispatched, rejected, errored, sent, "scheduled campaigns processed");
        if errored == due.len() {
            return Err(JobError::new(format!(
                "all {errored} due campaigns failed with store errors"
            )));
        }
        Ok(Some(json!({
            "due": due.len(),
            "dispatched": dispatched,
            "rejected": rejected,
            "errored": errored,
            "sent": sent
        })))
    }
}

/// Deletes finished tasks older than the retention window.
pub struct TaskCleanupJob<S> {
    queue: Arc<TaskQueue<S>>,
    retention: Duration,
    schedule: String,
}

impl<S> TaskCleanupJob<S> {
    pub const NAME: &'static str = "task_cleanup";

    pub fn new(queue: Arc<TaskQueue<S>>, retention: Duration, schedule: impl Into<String>) -> Self {
        Self {
            queue,
            retention,
            schedule: schedule.into(),
        }
    }
}

#[async_trait]
impl<S: Store + 'static> CronJob for TaskCleanupJob<S> {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn job_type(&self) -> &str {
        "maintenance"
    }

    fn description(&self) -> &str {
        "Remove completed and failed tasks past retention"
    }

    fn schedule(&self) -> &str {
        &self.schedule
    }

    async fn run(&self) -> Result<Option<Value>, JobError> {
        let removed = self.queue.cleanup_older_than(self.retention).await?;
        Ok(Some(json!({
            "removed": removed,
            "retention_days": self.retention.as_secs() / 86_400,
        })))
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;
    use mailforge_core::{CampaignStatus, CompanyId, ExecutionStatus};

    use super::*;
    use crate::config::{DispatchConfig, QueueConfig};
    use crate::jobs::TaskHandler;
    use crate::mail::InMemoryMailTransport;
    use crate::scheduler::{CronScheduler, RunOutcome};
    use crate::store::{FailPoint, InMemoryStore};
    use crate::test_support::{campaign, recipients, usage};

    fn dispatcher(
        store: &Arc<InMemoryStore>,
        transport: &Arc<InMemoryMailTransport>,
    ) -> Arc<CampaignDispatcher<InMemoryStore>> {
        let config = DispatchConfig {
            batch_launch_delay_ms: 0,
            ..DispatchConfig::default()
        };
        Arc::new(CampaignDispatcher::new(store.clone(), transport.clone(), config).unwrap())
    }

    #[tokio::test]
    async fn due_campaigns_are_sent_and_future_ones_wait() {
        let store = Arc::new(InMemoryStore::new());
        let transport = Arc::new(InMemoryMailTransport::new());
        let company_id = CompanyId::new();
        store.set_usage(usage(company_id, 100));

        let mut due = campaign(company_id);
        due.status = CampaignStatus::Scheduled;
        due.scheduled_at = Some(Utc::now() - ChronoDuration::minutes(2));
        store.insert_campaign(due.clone());
        store.set_contacts(due.id, recipients(3));

        let mut later = campaign(company_id);
        later.status = CampaignStatus::Scheduled;
        later.scheduled_at = Some(Utc::now() + ChronoDuration::hours(1));
        store.insert_campaign(later.clone());
        store.set_contacts(later.id, recipients(3));

        let job = ScheduledCampaignJob::new(dispatcher(&store, &transport), store.clone(), "* * * * *", 10);
        let output = job.run().await.unwrap().unwrap();

        assert_eq!(output["due"], 1);
        assert_eq!(output["sent"], 3);
        assert_eq!(store.campaign(due.id).unwrap().status, CampaignStatus::Sent);
        assert_eq!(store.campaign(later.id).unwrap().status, CampaignStatus::Scheduled);
        assert_eq!(transport.sent().len(), 3);
    }

    #[tokio::test]
    async fn rejected_campaign_does_not_fail_the_run() {
        let store = Arc::new(InMemoryStore::new());
        let transport = Arc::new(InMemoryMailTransport::new());
        let company_id = CompanyId::new();
        store.set_usage(usage(company_id, 0));

        let mut due = campaign(company_id);
        due.status = CampaignStatus::Scheduled;
        due.scheduled_at = Some(Utc::now() - ChronoDuration::minutes(1));
        store.insert_campaign(due.clone());

        let job = ScheduledCampaignJob::new(dispatcher(&store, &transport), store.clone(), "* * * * *", 10);
        let output = job.run().await.unwrap().unwrap();

        assert_eq!(output["rejected"], 1);
        assert_eq!(store.campaign(due.id).unwrap().status, CampaignStatus::Failed);
        assert!(transport.sent().is_empty());
    }

    #[tokio::test]
    async fn campaign_left_queued_by_a_store_failure_is_sent_on_the_next_run() {
        let store = Arc::new(InMemoryStore::new());
        let transport = Arc::new(InMemoryMailTransport::new());
        let company_id = CompanyId::new();
        store.set_usage(usage(company_id, 100));

        let mut due = campaign(company_id);
        due.status = CampaignStatus::Scheduled;
        due.scheduled_at = Some(Utc::now() - ChronoDuration::minutes(5));
        store.insert_campaign(due.clone());
        store.set_contacts(due.id, recipients(3));
        store.inject_failure(FailPoint::GetContacts, 1);

        let job = ScheduledCampaignJob::new(dispatcher(&store, &transport), store.clone(), "* * * * *", 10);
        assert!(job.run().await.is_err());
        assert_eq!(store.campaign(due.id).unwrap().status, CampaignStatus::Queued);
        assert!(transport.sent().is_empty());

        let output = job.run().await.unwrap().unwrap();
        assert_eq!(output["due"], 1);
        assert_eq!(output["dispatched"], 1);
        assert_eq!(output["sent"], 3);
        assert_eq!(store.campaign(due.id).unwrap().status, CampaignStatus::Sent);
        assert_eq!(transport.sent().len(), 3);
    }

    struct NoopHandler;

    #[async_trait]
    impl TaskHandler for NoopHandler {
        async fn handle(
            &self,
            _task: &mailforge_core::Task,
            _kind: mailforge_core::TaskKind,
        ) -> Result<(), crate::jobs::TaskError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn cleanup_runs_through_the_scheduler() {
        let store = Arc::new(InMemoryStore::new());
        let queue = Arc::new(TaskQueue::new(
            store.clone(),
            Arc::new(NoopHandler),
            QueueConfig::default(),
        ));
        let scheduler = CronScheduler::new(store.clone());
        scheduler
            .register(Arc::new(TaskCleanupJob::new(queue, Duration::from_secs(86_400), "0 3 * * *")))
            .unwrap();

        let RunOutcome::Executed(log) = scheduler.trigger_now(TaskCleanupJob::<InMemoryStore>::NAME).await.unwrap()
        else {
            panic!("cleanup job did not execute");
        };
        assert_eq!(log.status, ExecutionStatus::Completed);
        assert_eq!(log.output.unwrap()["removed"], 0);
    }
}
