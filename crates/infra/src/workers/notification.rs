use std::sync::Arc;

use chrono::Utc;
use tera::Context;
use tracing::{debug, info, instrument};

use mailforge_core::{
    AdminNotification, AdminNotificationPayload, TaskId, UserNotification,
    UserNotificationPayload, WelcomeEmailPayload,
};

use super::templates;
use crate::config::MailConfig;
use crate::jobs::TaskError;
use crate::mail::{self, MailError, MailRequest, MailTransport};
use crate::store::NotificationStore;

/// In-app notifications and platform emails.
pub struct NotificationWorker<S> {
    store: Arc<S>,
    transport: Arc<dyn MailTransport>,
    config: MailConfig,
}

impl<S> Clone for NotificationWorker<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            transport: self.transport.clone(),
            config: self.config.clone(),
        }
    }
}

impl<S: NotificationStore> NotificationWorker<S> {
    pub fn new(store: Arc<S>, transport: Arc<dyn MailTransport>, config: MailConfig) -> Self {
        Self {
            store,
            transport,
            config,
        }
    }

    #[instrument(skip_all, fields(task_id = %task_id, user_id = %payload.user_id), err)]
    pub async fn notify_user(
        &self,
        task_id: TaskId,
        payload: UserNotificationPayload,
    ) -> Result<(), TaskError> {
        let notification = UserNotification {
            id: *task_id.as_uuid(),
            user_id: payload.user_id,
            title: payload.title,
            message: payload.message,
            kind: payload.kind,
            read: false,
            created_at: Utc::now(),
        };
        self.store.create_user_notification(&notification).await?;
        debug!("user notification stored");
        Ok(())
    }

    /// Store an admin notification and, when an admin address is configured,
    /// email it as well.
    #[instrument(skip_all, fields(task_id = %task_id, kind = %payload.kind), err)]
    pub async fn notify_admins(
        &self,
        task_id: TaskId,
        payload: AdminNotificationPayload,
    ) -> Result<(), TaskError> {
        let notification = AdminNotification {
            id: *task_id.as_uuid(),
            company_id: payload.company_id,
            title: payload.title,
            message: payload.message,
            kind: payload.kind,
            read: false,
            created_at: Utc::now(),
        };
        self.store.create_admin_notification(&notification).await?;

        let Some(admin_email) = self.config.admin_email.as_deref() else {
            debug!("admin notification stored; no admin email configured");
            return Ok(());
        };

        let mut ctx = Context::new();
        ctx.insert("kind", &notification.kind);
        ctx.insert("title", &notification.title);
        ctx.insert("message", &notification.message);
        ctx.insert("company_id", &notification.company_id.map(|id| id.to_string()));
        let html = templates::render("admin_alert.html", &ctx)
            .map_err(|e| TaskError::permanent(format!("admin alert template: {e}")))?;

        let request = self.platform_request(
            admin_email,
            format!("[{}] {}", notification.kind, notification.title),
            html,
        );
        self.transport.send(&request).await.map_err(send_error)?;

        info!(to = %admin_email, "admin notification emailed");
        Ok(())
    }

    #[instrument(skip_all, fields(user_id = %payload.user_id), err)]
    pub async fn send_welcome_email(&self, payload: WelcomeEmailPayload) -> Result<(), TaskError> {
        if !mail::is_valid_email(&payload.email) {
            return Err(TaskError::permanent(format!(
                "invalid welcome email address: {}",
                payload.email
            )));
        }

        let mut ctx = Context::new();
        ctx.insert("first_name", &payload.first_name);
        ctx.insert("email", &payload.email);
        ctx.insert("product", &self.config.platform_from_name);
        let render = |name: &str| {
            templates::render(name, &ctx)
                .map_err(|e| TaskError::permanent(format!("{name} template: {e}")))
        };
        let html = render("welcome.html")?;
        let text = render("welcome.txt")?;

        let request = self
            .platform_request(
                &payload.email,
                format!("Welcome to {}", self.config.platform_from_name),
                html,
            )
            .with_text_body(text);
        self.transport.send(&request).await.map_err(send_error)?;

        info!("welcome email sent");
        Ok(())
    }

    fn platform_request(&self, to: &str, subject: String, html: String) -> MailRequest {
        MailRequest::html(self.config.platform_from_email.clone(), to, subject, html)
            .with_from_name(self.config.platform_from_name.clone())
    }
}

fn send_error(err: MailError) -> TaskError {
    match err {
        MailError::InvalidAddress { .. } | MailError::Build(_) => TaskError::permanent(err.to_string()),
        MailError::Transport(_) => TaskError::transient(err.to_string()),
    }
}
