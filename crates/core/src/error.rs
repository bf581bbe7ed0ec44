//! Domain error model.

use thiserror::Error;

use crate::id::{CampaignId, CompanyId};

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Keep this focused on deterministic, business/domain failures (validation,
/// quota, lifecycle rules). Storage and transport concerns belong elsewhere.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. malformed input).
    #[error("validation failed: {0}")]
    Validation(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A requested resource was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// The campaign was already broadcast.
    #[error("campaign {0} has already been sent")]
    AlreadySent(CampaignId),

    /// The campaign is archived and can no longer be sent.
    #[error("campaign {0} is archived")]
    Archived(CampaignId),

    /// The campaign has no usable template (subject or body missing).
    #[error("campaign template is incomplete: {0}")]
    MissingTemplate(String),

    /// The company has no email allowance left for the current period.
    #[error("email quota exceeded for company {company_id} ({remaining} remaining)")]
    QuotaExceeded { company_id: CompanyId, remaining: i64 },

    /// A lifecycle transition that the state machine does not allow.
    #[error("invalid state transition: {0}")]
    InvalidTransition(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn invalid_transition(msg: impl Into<String>) -> Self {
        Self::InvalidTransition(msg.into())
    }

    /// Stable category name, persisted as the `error_type` of campaign errors.
    pub fn category(&self) -> &'static str {
        match self {
            DomainError::Validation(_) | DomainError::InvalidId(_) => "validation",
            DomainError::NotFound(_) => "not_found",
            DomainError::AlreadySent(_) => "already_sent",
            DomainError::Archived(_) => "archived",
            DomainError::MissingTemplate(_) => "missing_template",
            DomainError::QuotaExceeded { .. } => "quota_exceeded",
            DomainError::InvalidTransition(_) => "invalid_transition",
        }
    }
}
