//! Task handlers for audit trail and notification tasks.

pub mod audit;
pub mod notification;
mod templates;

pub use audit::AuditWorker;
pub use notification::NotificationWorker;
