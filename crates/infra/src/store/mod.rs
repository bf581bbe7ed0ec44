//! Persistence boundary of the engine.
//!
//! Narrow async traits per concern (tasks, schedules, campaigns, usage, domains,
//! audit, notifications), an in-memory implementation for tests/dev and a
//! Postgres implementation for production.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::{FailPoint, InMemoryStore};
pub use postgres::PostgresStore;
pub use r#trait::{
    AuditStore, CampaignStore, DomainStore, NotificationStore, ScheduleStore, Store, StoreError,
    StoreResult, TaskCounts, TaskStore, UsageStore,
};
