//! Infrastructure layer: persistence, task queue, cron scheduler, campaign
//! dispatch, mail delivery and the background workers.

pub mod campaign;
pub mod config;
pub mod jobs;
pub mod mail;
pub mod scheduler;
pub mod store;
pub mod workers;

pub(crate) mod util;

#[cfg(test)]
pub(crate) mod test_support;

#[cfg(test)]
mod integration_tests;
