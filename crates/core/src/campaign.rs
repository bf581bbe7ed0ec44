//! Campaigns, sending quota and per-send bookkeeping.

use core::fmt;
use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{DomainError, DomainResult};
use crate::id::{CampaignId, CompanyId};

/// Campaign lifecycle status.
///
/// draft/saved/scheduled → queued → sent | failed. Nothing leaves sent or failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Draft,
    Saved,
    Scheduled,
    Queued,
    Sent,
    Failed,
}

impl CampaignStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CampaignStatus::Draft => "draft",
            CampaignStatus::Saved => "saved",
            CampaignStatus::Scheduled => "scheduled",
            CampaignStatus::Queued => "queued",
            CampaignStatus::Sent => "sent",
            CampaignStatus::Failed => "failed",
        }
    }

    pub fn is_final(&self) -> bool {
        matches!(self, CampaignStatus::Sent | CampaignStatus::Failed)
    }

    /// A queued campaign may be queued again when a dispatch is retried.
    pub fn can_transition_to(&self, next: CampaignStatus) -> bool {
        use CampaignStatus::*;
        match (self, next) {
            (Draft | Saved | Scheduled | Queued, Queued) => true,
            (Draft | Saved | Scheduled | Queued, Failed) => true,
            (Queued, Sent) => true,
            _ => false,
        }
    }
}

impl fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CampaignStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(CampaignStatus::Draft),
            "saved" => Ok(CampaignStatus::Saved),
            "scheduled" => Ok(CampaignStatus::Scheduled),
            "queued" => Ok(CampaignStatus::Queued),
            "sent" => Ok(CampaignStatus::Sent),
            "failed" => Ok(CampaignStatus::Failed),
            other => Err(DomainError::validation(format!(
                "unknown campaign status: {other}"
            ))),
        }
    }
}

/// An email campaign with its template already resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Campaign {
    pub id: CampaignId,
    pub company_id: CompanyId,
    pub name: String,
    pub template_id: Option<Uuid>,
    pub subject: String,
    pub html_body: String,
    pub from_email: String,
    pub from_name: Option<String>,
    pub status: CampaignStatus,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    pub is_archived: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Campaign {
    /// Checks that the campaign can still be broadcast.
    pub fn ensure_sendable(&self) -> DomainResult<()> {
        if self.is_archived {
            return Err(DomainError::Archived(self.id));
        }
        match self.status {
            CampaignStatus::Sent => Err(DomainError::AlreadySent(self.id)),
            CampaignStatus::Failed => Err(DomainError::invalid_transition(format!(
                "campaign {} already failed",
                self.id
            ))),
            _ => Ok(()),
        }
    }

    pub fn ensure_template(&self) -> DomainResult<()> {
        if self.template_id.is_none() && self.html_body.trim().is_empty() {
            return Err(DomainError::MissingTemplate(format!(
                "campaign {} has no template",
                self.id
            )));
        }
        if self.subject.trim().is_empty() {
            return Err(DomainError::MissingTemplate("subject is empty".into()));
        }
        if self.html_body.trim().is_empty() {
            return Err(DomainError::MissingTemplate("html body is empty".into()));
        }
        if self.from_email.trim().is_empty() {
            return Err(DomainError::MissingTemplate("from address is empty".into()));
        }
        Ok(())
    }
}

/// Sending allowance of a company for one billing period.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailUsageRecord {
    pub id: Uuid,
    pub company_id: CompanyId,
    pub remaining_emails: i64,
    pub emails_sent: i64,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
}

impl EmailUsageRecord {
    pub fn covers(&self, at: DateTime<Utc>) -> bool {
        self.period_start <= at && at < self.period_end
    }

    pub fn has_capacity(&self) -> bool {
        self.remaining_emails > 0
    }

    /// Count `sent` emails against the allowance; `remaining_emails` saturates at zero.
    pub fn record_sent(&mut self, sent: i64) {
        self.emails_sent += sent;
        self.remaining_emails = (self.remaining_emails - sent).max(0);
    }
}

/// Category of a persisted campaign error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignErrorType {
    /// A dispatch precondition failed; carries the domain error category.
    Precondition,
    RecipientFailure,
    UsageUpdate,
    BatchPanic,
}

impl CampaignErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CampaignErrorType::Precondition => "precondition",
            CampaignErrorType::RecipientFailure => "recipient_failure",
            CampaignErrorType::UsageUpdate => "usage_update",
            CampaignErrorType::BatchPanic => "batch_panic",
        }
    }
}

/// A failure recorded against a campaign for operators to inspect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignError {
    pub id: Uuid,
    pub campaign_id: CampaignId,
    pub company_id: CompanyId,
    pub error_type: String,
    pub error_message: String,
    pub created_at: DateTime<Utc>,
}

impl CampaignError {
    pub fn new(
        campaign_id: CampaignId,
        company_id: CompanyId,
        error_type: impl Into<String>,
        error_message: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            campaign_id,
            company_id,
            error_type: error_type.into(),
            error_message: error_message.into(),
            created_at: Utc::now(),
        }
    }

    /// Error row for a failed dispatch precondition.
    pub fn precondition(campaign_id: CampaignId, company_id: CompanyId, err: &DomainError) -> Self {
        Self::new(campaign_id, company_id, err.category(), err.to_string())
    }
}

/// Request to track one successful send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewEmailCampaignResult {
    pub campaign_id: CampaignId,
    pub company_id: CompanyId,
    pub recipient_email: String,
    pub sent_at: DateTime<Utc>,
}

/// Tracking row for one recipient of a campaign.
///
/// `version` starts at 1 and increases when the same recipient is sent to again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailCampaignResult {
    pub id: Uuid,
    pub campaign_id: CampaignId,
    pub company_id: CompanyId,
    pub recipient_email: String,
    pub sent_at: DateTime<Utc>,
    pub version: i32,
}

impl EmailCampaignResult {
    pub fn from_new(new: NewEmailCampaignResult, version: i32) -> Self {
        Self {
            id: Uuid::now_v7(),
            campaign_id: new.campaign_id,
            company_id: new.company_id,
            recipient_email: new.recipient_email,
            sent_at: new.sent_at,
            version,
        }
    }
}

/// A sending domain registered by a company.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendingDomain {
    pub company_id: CompanyId,
    pub domain: String,
    pub verified: bool,
    pub dkim_selector: String,
    pub dkim_private_key: String,
}
