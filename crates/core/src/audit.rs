//! Audit trail entries and in-app notifications.

use core::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::id::{CompanyId, UserId};

/// Kind of audited event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Create,
    Update,
    Delete,
    Login,
    FailedLogin,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Create => "create",
            AuditAction::Update => "update",
            AuditAction::Delete => "delete",
            AuditAction::Login => "login",
            AuditAction::FailedLogin => "failed_login",
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditLog {
    pub id: Uuid,
    pub company_id: CompanyId,
    pub user_id: Option<UserId>,
    pub action: AuditAction,
    pub resource: String,
    pub resource_id: Option<String>,
    pub details: Value,
    pub ip_address: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserNotification {
    pub id: Uuid,
    pub user_id: UserId,
    pub title: String,
    pub message: String,
    pub kind: String,
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

/// Notification shown to platform administrators, optionally scoped to a company.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminNotification {
    pub id: Uuid,
    pub company_id: Option<CompanyId>,
    pub title: String,
    pub message: String,
    pub kind: String,
    pub read: bool,
    pub created_at: DateTime<Utc>,
}
