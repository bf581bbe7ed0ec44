//! Process wiring: one store and one mail transport shared by the task queue,
//! its worker pool, the campaign dispatcher and the cron scheduler.

use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use mailforge_infra::campaign::{CampaignDispatcher, TrackingError};
use mailforge_infra::config::{ConfigError, EngineConfig};
use mailforge_infra::jobs::{EngineTaskHandler, QueueError, TaskQueue};
use mailforge_infra::mail::MailTransport;
use mailforge_infra::scheduler::{
    CronScheduler, ScheduledCampaignJob, SchedulerError, TaskCleanupJob,
};
use mailforge_infra::store::Store;
use mailforge_infra::workers::{AuditWorker, NotificationWorker};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Tracking(#[from] TrackingError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

pub struct Engine<S> {
    config: EngineConfig,
    dispatcher: Arc<CampaignDispatcher<S>>,
    queue: Arc<TaskQueue<S>>,
    scheduler: CronScheduler<S>,
}

impl<S: Store + 'static> Engine<S> {
    /// Wire every component. Nothing runs until [`start`](Self::start).
    pub fn build(
        config: EngineConfig,
        store: Arc<S>,
        transport: Arc<dyn MailTransport>,
    ) -> Result<Self, EngineError> {
        config.validate()?;

        let dispatcher = Arc::new(CampaignDispatcher::new(
            store.clone(),
            transport.clone(),
            config.dispatch.clone(),
        )?);
        let handler = EngineTaskHandler::new(
            dispatcher.clone(),
            AuditWorker::new(store.clone()),
            NotificationWorker::new(store.clone(), transport, config.mail.clone()),
        );
        let queue = Arc::new(TaskQueue::new(
            store.clone(),
            Arc::new(handler),
            config.queue.clone(),
        ));

        let scheduler = CronScheduler::new(store.clone());
        if config.scheduler.enabled {
            scheduler.register(Arc::new(ScheduledCampaignJob::new(
                dispatcher.clone(),
                store,
                config.scheduler.campaign_schedule.clone(),
                config.scheduler.due_campaign_limit,
            )))?;
            scheduler.register(Arc::new(TaskCleanupJob::new(
                queue.clone(),
                config.queue.retention(),
                config.scheduler.cleanup_schedule.clone(),
            )))?;
        }

        Ok(Self {
            config,
            dispatcher,
            queue,
            scheduler,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn queue(&self) -> &Arc<TaskQueue<S>> {
        &self.queue
    }

    pub fn scheduler(&self) -> &CronScheduler<S> {
        &self.scheduler
    }

    pub fn dispatcher(&self) -> &Arc<CampaignDispatcher<S>> {
        &self.dispatcher
    }

    pub async fn start(&self) -> Result<(), EngineError> {
        self.queue.start(self.config.queue.workers);
        if self.config.scheduler.enabled {
            self.scheduler.start().await?;
        }
        info!(
            workers = self.config.queue.workers,
            scheduler = self.config.scheduler.enabled,
            "engine started"
        );
        Ok(())
    }

    /// Stop the scheduler and the worker pool, each within the configured grace period.
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        let grace = self.config.queue.shutdown_grace();
        let (scheduler, queue) =
            tokio::join!(self.scheduler.shutdown(grace), self.queue.shutdown(grace));
        scheduler?;
        queue?;
        info!("engine stopped");
        Ok(())
    }
}
