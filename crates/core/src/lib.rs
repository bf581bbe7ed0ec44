//! `mailforge-core`: domain building blocks for the task and email engine.
//!
//! This crate contains **pure domain** types (no infrastructure concerns).

pub mod audit;
pub mod campaign;
pub mod error;
pub mod id;
pub mod schedule;
pub mod task;

pub use audit::{AdminNotification, AuditAction, AuditLog, UserNotification};
pub use campaign::{
    Campaign, CampaignError, CampaignErrorType, CampaignStatus, EmailCampaignResult,
    EmailUsageRecord, NewEmailCampaignResult, SendingDomain,
};
pub use error::{DomainError, DomainResult};
pub use id::{CampaignId, CompanyId, ExecutionLogId, JobScheduleId, TaskId, UserId};
pub use schedule::{
    DEFAULT_JOB_TIMEOUT_SECS, ExecutionOutcome, ExecutionStatus, JobExecutionLog, JobSchedule,
    NewJobSchedule, ScheduleUpdate,
};
pub use task::{
    AdminNotificationPayload, AuditLogPayload, CampaignEmailPayload, Task, TaskFailure, TaskKind,
    TaskStatus, UserNotificationPayload, WelcomeEmailPayload,
};
