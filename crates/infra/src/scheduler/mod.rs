//! Cron scheduler.
//!
//! Each registered [`CronJob`] gets a trigger loop that sleeps until the next
//! fire time of its stored cron expression, then runs the job under a timeout
//! and records the run in the job's execution history.

pub mod engine;
pub mod job;
pub mod jobs;

pub use engine::CronScheduler;
pub use job::{CronJob, JobError, RunOutcome, SchedulerError, parse_schedule};
pub use jobs::{ScheduledCampaignJob, TaskCleanupJob};
