//! Routing of decoded tasks to their handlers.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use mailforge_core::{Task, TaskKind};

use super::types::TaskError;
use crate::campaign::CampaignDispatcher;
use crate::store::Store;
use crate::workers::{AuditWorker, NotificationWorker};

/// Executes one decoded task.
///
/// Tasks are delivered at least once, so implementations must tolerate
/// running the same task again.
#[async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    async fn handle(&self, task: &Task, kind: TaskKind) -> Result<(), TaskError>;
}

/// The production dispatch table: every `TaskKind` mapped to its worker.
pub struct EngineTaskHandler<S> {
    dispatcher: Arc<CampaignDispatcher<S>>,
    audit: AuditWorker<S>,
    notifications: NotificationWorker<S>,
}

impl<S: Store + 'static> EngineTaskHandler<S> {
    pub fn new(
        dispatcher: Arc<CampaignDispatcher<S>>,
        audit: AuditWorker<S>,
        notifications: NotificationWorker<S>,
    ) -> Self {
        Self {
            dispatcher,
            audit,
            notifications,
        }
    }
}

#[async_trait]
impl<S: Store + 'static> TaskHandler for EngineTaskHandler<S> {
    async fn handle(&self, task: &Task, kind: TaskKind) -> Result<(), TaskError> {
        match kind {
            TaskKind::SendWelcomeEmail(payload) => {
                self.notifications.send_welcome_email(payload).await
            }
            TaskKind::AuditLogCreate(payload) => self.audit.record(task.id, payload).await,
            TaskKind::SendCampaignEmail(payload) => {
                let report = self
                    .dispatcher
                    .dispatch(payload.company_id, payload.user_id, payload.campaign_id)
                    .await?;
                info!(
                    campaign_id = %report.campaign_id,
                    attempted = report.attempted,
                    sent = report.sent,
                    failed = report.recipient_errors.len(),
                    "campaign task finished"
                );
                Ok(())
            }
            TaskKind::SendAdminNotification(payload) => {
                self.notifications.notify_admins(task.id, payload).await
            }
            TaskKind::CreateUserNotification(payload) => {
                self.notifications.notify_user(task.id, payload).await
            }
        }
    }
}
