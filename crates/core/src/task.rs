//! Durable task records and the closed set of task kinds.

use core::fmt;
use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::audit::AuditAction;
use crate::error::DomainError;
use crate::id::{CampaignId, CompanyId, TaskId, UserId};

/// Task lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for a worker (possibly delayed until `scheduled_at`)
    Pending,
    /// Claimed by exactly one worker
    Processing,
    Completed,
    /// Retries exhausted or the failure was not retryable
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "processing" => Ok(TaskStatus::Processing),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(DomainError::validation(format!("unknown task status: {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WelcomeEmailPayload {
    pub user_id: UserId,
    pub email: String,
    pub first_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditLogPayload {
    pub company_id: CompanyId,
    #[serde(default)]
    pub user_id: Option<UserId>,
    pub action: AuditAction,
    pub resource: String,
    #[serde(default)]
    pub resource_id: Option<String>,
    #[serde(default)]
    pub details: Value,
    #[serde(default)]
    pub ip_address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CampaignEmailPayload {
    pub company_id: CompanyId,
    #[serde(default)]
    pub user_id: Option<UserId>,
    pub campaign_id: CampaignId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdminNotificationPayload {
    #[serde(default)]
    pub company_id: Option<CompanyId>,
    pub title: String,
    pub message: String,
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserNotificationPayload {
    pub user_id: UserId,
    pub title: String,
    pub message: String,
    pub kind: String,
}

/// Every kind of work the queue knows how to execute.
///
/// Serialized adjacently tagged so that the persisted `task_type` column is the
/// snake-case variant name and `payload` is the variant body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "task_type", content = "payload", rename_all = "snake_case")]
pub enum TaskKind {
    SendWelcomeEmail(WelcomeEmailPayload),
    AuditLogCreate(AuditLogPayload),
    SendCampaignEmail(CampaignEmailPayload),
    SendAdminNotification(AdminNotificationPayload),
    CreateUserNotification(UserNotificationPayload),
}

impl TaskKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            TaskKind::SendWelcomeEmail(_) => "send_welcome_email",
            TaskKind::AuditLogCreate(_) => "audit_log_create",
            TaskKind::SendCampaignEmail(_) => "send_campaign_email",
            TaskKind::SendAdminNotification(_) => "send_admin_notification",
            TaskKind::CreateUserNotification(_) => "create_user_notification",
        }
    }

    /// Split into the `(task_type, payload)` pair stored on a task row.
    pub fn encode(&self) -> Result<(&'static str, Value), serde_json::Error> {
        let payload = match self {
            TaskKind::SendWelcomeEmail(p) => serde_json::to_value(p)?,
            TaskKind::AuditLogCreate(p) => serde_json::to_value(p)?,
            TaskKind::SendCampaignEmail(p) => serde_json::to_value(p)?,
            TaskKind::SendAdminNotification(p) => serde_json::to_value(p)?,
            TaskKind::CreateUserNotification(p) => serde_json::to_value(p)?,
        };
        Ok((self.type_name(), payload))
    }

    /// Rebuild a kind from a stored `(task_type, payload)` pair.
    pub fn decode(task_type: &str, payload: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(serde_json::json!({
            "task_type": task_type,
            "payload": payload,
        }))
    }
}

/// A durable unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub task_type: String,
    pub payload: Value,
    pub status: TaskStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Earliest instant a worker may claim the task.
    pub scheduled_at: DateTime<Utc>,
    /// Claim timestamp; cleared when the task goes back to pending.
    pub started_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Build a pending task for `kind`, eligible from `scheduled_at`.
    pub fn new(
        kind: &TaskKind,
        max_retries: u32,
        scheduled_at: DateTime<Utc>,
    ) -> Result<Self, serde_json::Error> {
        let (task_type, payload) = kind.encode()?;
        let now = Utc::now();
        Ok(Self {
            id: TaskId::new(),
            task_type: task_type.to_string(),
            payload,
            status: TaskStatus::Pending,
            retry_count: 0,
            max_retries,
            scheduled_at,
            started_at: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn kind(&self) -> Result<TaskKind, serde_json::Error> {
        TaskKind::decode(&self.task_type, self.payload.clone())
    }

    /// Whether a worker may claim this task at `now`.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Pending && self.scheduled_at <= now
    }
}

/// How a failed execution is written back to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskFailure {
    /// Back to pending, eligible again at `retry_at`.
    Retry {
        retry_count: u32,
        retry_at: DateTime<Utc>,
        error: String,
    },
    /// Terminal `failed`.
    Terminal { retry_count: u32, error: String },
}

impl TaskFailure {
    pub fn error(&self) -> &str {
        match self {
            TaskFailure::Retry { error, .. } | TaskFailure::Terminal { error, .. } => error,
        }
    }

    pub fn retry_count(&self) -> u32 {
        match self {
            TaskFailure::Retry { retry_count, .. } | TaskFailure::Terminal { retry_count, .. } => {
                *retry_count
            }
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskFailure::Terminal { .. })
    }

    /// Apply this failure to an in-memory task record.
    pub fn apply(&self, task: &mut Task, now: DateTime<Utc>) {
        match self {
            TaskFailure::Retry {
                retry_count,
                retry_at,
                error,
            } => {
                task.status = TaskStatus::Pending;
                task.retry_count = *retry_count;
                task.scheduled_at = *retry_at;
                task.started_at = None;
                task.error_message = Some(error.clone());
            }
            TaskFailure::Terminal { retry_count, error } => {
                task.status = TaskStatus::Failed;
                task.retry_count = *retry_count;
                task.error_message = Some(error.clone());
            }
        }
        task.updated_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn campaign_kind() -> TaskKind {
        TaskKind::SendCampaignEmail(CampaignEmailPayload {
            company_id: CompanyId::new(),
            user_id: None,
            campaign_id: CampaignId::new(),
        })
    }

    #[test]
    fn type_name_matches_serialized_tag() {
        let kinds = vec![
            TaskKind::SendWelcomeEmail(WelcomeEmailPayload {
                user_id: UserId::new(),
                email: "a@example.com".into(),
                first_name: "Ada".into(),
            }),
            TaskKind::AuditLogCreate(AuditLogPayload {
                company_id: CompanyId::new(),
                user_id: None,
                action: AuditAction::Login,
                resource: "session".into(),
                resource_id: None,
                details: Value::Null,
                ip_address: None,
            }),
            campaign_kind(),
            TaskKind::SendAdminNotification(AdminNotificationPayload {
                company_id: None,
                title: "t".into(),
                message: "m".into(),
                kind: "system".into(),
            }),
            TaskKind::CreateUserNotification(UserNotificationPayload {
                user_id: UserId::new(),
                title: "t".into(),
                message: "m".into(),
                kind: "info".into(),
            }),
        ];

        for kind in kinds {
            let tagged = serde_json::to_value(&kind).unwrap();
            assert_eq!(tagged["task_type"], kind.type_name());

            let (task_type, payload) = kind.encode().unwrap();
            assert_eq!(TaskKind::decode(task_type, payload).unwrap(), kind);
        }
    }

    #[test]
    fn unknown_task_type_fails_to_decode() {
        let err = TaskKind::decode("reindex_everything", serde_json::json!({}));
        assert!(err.is_err());
    }

    #[test]
    fn malformed_payload_fails_to_decode() {
        let err = TaskKind::decode("send_campaign_email", serde_json::json!({"campaign_id": 7}));
        assert!(err.is_err());
    }

    #[test]
    fn new_task_is_pending_and_eligible_once_due() {
        let later = Utc::now() + chrono::Duration::minutes(5);
        let task = Task::new(&campaign_kind(), 3, later).unwrap();

        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.task_type, "send_campaign_email");
        assert!(!task.is_eligible(Utc::now()));
        assert!(task.is_eligible(later));
    }

    #[test]
    fn failure_application_resets_claim() {
        let now = Utc::now();
        let mut task = Task::new(&campaign_kind(), 3, now).unwrap();
        task.status = TaskStatus::Processing;
        task.started_at = Some(now);

        let retry_at = now + chrono::Duration::seconds(2);
        TaskFailure::Retry {
            retry_count: 1,
            retry_at,
            error: "smtp down".into(),
        }
        .apply(&mut task, now);

        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.retry_count, 1);
        assert_eq!(task.scheduled_at, retry_at);
        assert!(task.started_at.is_none());

        TaskFailure::Terminal {
            retry_count: 3,
            error: "gave up".into(),
        }
        .apply(&mut task, now);
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error_message.as_deref(), Some("gave up"));
    }

    #[test]
    fn status_parses_from_storage_strings() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::Processing,
            TaskStatus::Completed,
            TaskStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), status);
        }
        assert!("running".parse::<TaskStatus>().is_err());
    }
}
