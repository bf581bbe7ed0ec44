//! Engine configuration.
//!
//! Every setting has a default and can be overridden through a `MAILFORGE_*`
//! environment variable (see [`EngineConfig::from_env`]).

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use mailforge_observability::{LogFormat, LoggingConfig};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: `{value}` ({reason})")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },

    #[error("{0}")]
    Constraint(String),
}

/// Database connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Postgres URL. `None` runs the engine on the in-memory store.
    pub url: Option<String>,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 10,
        }
    }
}

/// Task queue worker pool settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub workers: usize,
    pub poll_interval_ms: u64,
    pub base_retry_delay_ms: u64,
    pub max_retry_delay_ms: u64,
    pub default_max_retries: u32,
    /// Tasks in processing longer than this are considered abandoned.
    pub stale_after_secs: u64,
    pub sweep_interval_secs: u64,
    pub shutdown_grace_secs: u64,
    /// Age after which completed/failed tasks are deleted by the cleanup job.
    pub retention_days: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            poll_interval_ms: 1_000,
            base_retry_delay_ms: 1_000,
            max_retry_delay_ms: 3_600_000,
            default_max_retries: 3,
            stale_after_secs: 600,
            sweep_interval_secs: 60,
            shutdown_grace_secs: 30,
            retention_days: 7,
        }
    }
}

impl QueueConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn base_retry_delay(&self) -> Duration {
        Duration::from_millis(self.base_retry_delay_ms)
    }

    pub fn max_retry_delay(&self) -> Duration {
        Duration::from_millis(self.max_retry_delay_ms)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(u64::from(self.retention_days) * 24 * 60 * 60)
    }
}

/// Cron scheduler settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub campaign_schedule: String,
    pub cleanup_schedule: String,
    /// Upper bound of due campaigns picked up per scheduled-campaign run.
    pub due_campaign_limit: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            campaign_schedule: "* * * * *".to_string(),
            cleanup_schedule: "0 3 * * *".to_string(),
            due_campaign_limit: 50,
        }
    }
}

/// Campaign dispatch pipeline settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub batch_size: usize,
    pub batch_launch_delay_ms: u64,
    /// Base URL of the open/click/unsubscribe tracking endpoints.
    pub tracking_base_url: String,
    /// Domain used for From addresses whose own domain is not verified.
    pub default_from_domain: String,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            batch_launch_delay_ms: 100,
            tracking_base_url: "http://localhost:8080/track".to_string(),
            default_from_domain: "mail.mailforge.local".to_string(),
        }
    }
}

impl DispatchConfig {
    pub fn batch_launch_delay(&self) -> Duration {
        Duration::from_millis(self.batch_launch_delay_ms)
    }
}

/// Outgoing mail settings.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MailConfig {
    /// SMTP relay host. `None` keeps mail in memory (development).
    pub smtp_host: Option<String>,
    pub smtp_port: u16,
    /// Use implicit TLS/STARTTLS through `relay`; disable only for local catchers.
    pub smtp_tls: bool,
    pub smtp_username: Option<String>,
    #[serde(skip_serializing)]
    pub smtp_password: Option<String>,
    pub platform_from_email: String,
    pub platform_from_name: String,
    /// Address copied on admin notifications.
    pub admin_email: Option<String>,
}

impl Default for MailConfig {
    fn default() -> Self {
        Self {
            smtp_host: None,
            smtp_port: 587,
            smtp_tls: true,
            smtp_username: None,
            smtp_password: None,
            platform_from_email: "noreply@mail.mailforge.local".to_string(),
            platform_from_name: "Mailforge".to_string(),
            admin_email: None,
        }
    }
}

impl fmt::Debug for MailConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MailConfig")
            .field("smtp_host", &self.smtp_host)
            .field("smtp_port", &self.smtp_port)
            .field("smtp_tls", &self.smtp_tls)
            .field("smtp_username", &self.smtp_username)
            .field("smtp_password", &self.smtp_password.as_ref().map(|_| "<redacted>"))
            .field("platform_from_email", &self.platform_from_email)
            .field("platform_from_name", &self.platform_from_name)
            .field("admin_email", &self.admin_email)
            .finish()
    }
}

/// Root configuration of the engine process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub database: DatabaseConfig,
    pub queue: QueueConfig,
    pub scheduler: SchedulerConfig,
    pub dispatch: DispatchConfig,
    pub mail: MailConfig,
    pub logging: LoggingConfig,
}

impl EngineConfig {
    /// Defaults overridden by `MAILFORGE_*` variables of the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each variable name.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let env = Env { lookup: &lookup };

        env.opt_string("MAILFORGE_DATABASE_URL", &mut config.database.url);
        env.parse("MAILFORGE_DATABASE_MAX_CONNECTIONS", &mut config.database.max_connections)?;

        let queue = &mut config.queue;
        env.parse("MAILFORGE_WORKERS", &mut queue.workers)?;
        env.parse("MAILFORGE_POLL_INTERVAL_MS", &mut queue.poll_interval_ms)?;
        env.parse("MAILFORGE_BASE_RETRY_DELAY_MS", &mut queue.base_retry_delay_ms)?;
        env.parse("MAILFORGE_MAX_RETRY_DELAY_MS", &mut queue.max_retry_delay_ms)?;
        env.parse("MAILFORGE_DEFAULT_MAX_RETRIES", &mut queue.default_max_retries)?;
        env.parse("MAILFORGE_STALE_AFTER_SECS", &mut queue.stale_after_secs)?;
        env.parse("MAILFORGE_SWEEP_INTERVAL_SECS", &mut queue.sweep_interval_secs)?;
        env.parse("MAILFORGE_SHUTDOWN_GRACE_SECS", &mut queue.shutdown_grace_secs)?;
        env.parse("MAILFORGE_TASK_RETENTION_DAYS", &mut queue.retention_days)?;

        let scheduler = &mut config.scheduler;
        env.parse("MAILFORGE_SCHEDULER_ENABLED", &mut scheduler.enabled)?;
        env.string("MAILFORGE_CAMPAIGN_SCHEDULE", &mut scheduler.campaign_schedule);
        env.string("MAILFORGE_CLEANUP_SCHEDULE", &mut scheduler.cleanup_schedule);
        env.parse("MAILFORGE_DUE_CAMPAIGN_LIMIT", &mut scheduler.due_campaign_limit)?;

        let dispatch = &mut config.dispatch;
        env.parse("MAILFORGE_BATCH_SIZE", &mut dispatch.batch_size)?;
        env.parse("MAILFORGE_BATCH_LAUNCH_DELAY_MS", &mut dispatch.batch_launch_delay_ms)?;
        env.string("MAILFORGE_TRACKING_BASE_URL", &mut dispatch.tracking_base_url);
        env.string("MAILFORGE_DEFAULT_FROM_DOMAIN", &mut dispatch.default_from_domain);

        let mail = &mut config.mail;
        env.opt_string("MAILFORGE_SMTP_HOST", &mut mail.smtp_host);
        env.parse("MAILFORGE_SMTP_PORT", &mut mail.smtp_port)?;
        env.parse("MAILFORGE_SMTP_TLS", &mut mail.smtp_tls)?;
        env.opt_string("MAILFORGE_SMTP_USERNAME", &mut mail.smtp_username);
        env.opt_string("MAILFORGE_SMTP_PASSWORD", &mut mail.smtp_password);
        env.string("MAILFORGE_PLATFORM_FROM_EMAIL", &mut mail.platform_from_email);
        env.string("MAILFORGE_PLATFORM_FROM_NAME", &mut mail.platform_from_name);
        env.opt_string("MAILFORGE_ADMIN_EMAIL", &mut mail.admin_email);

        env.string("MAILFORGE_LOG_LEVEL", &mut config.logging.level);
        env.parse::<LogFormat>("MAILFORGE_LOG_FORMAT", &mut config.logging.format)?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue.workers == 0 {
            return Err(ConfigError::Constraint("MAILFORGE_WORKERS must be at least 1".into()));
        }
        if self.queue.poll_interval_ms == 0 {
            return Err(ConfigError::Constraint(
                "MAILFORGE_POLL_INTERVAL_MS must be positive".into(),
            ));
        }
        if self.queue.max_retry_delay_ms < self.queue.base_retry_delay_ms {
            return Err(ConfigError::Constraint(
                "MAILFORGE_MAX_RETRY_DELAY_MS must not be below MAILFORGE_BASE_RETRY_DELAY_MS"
                    .into(),
            ));
        }
        if self.queue.sweep_interval_secs == 0 {
            return Err(ConfigError::Constraint(
                "MAILFORGE_SWEEP_INTERVAL_SECS must be positive".into(),
            ));
        }
        if self.dispatch.batch_size == 0 {
            return Err(ConfigError::Constraint("MAILFORGE_BATCH_SIZE must be at least 1".into()));
        }
        if let Err(e) = url::Url::parse(&self.dispatch.tracking_base_url) {
            return Err(ConfigError::Invalid {
                key: "MAILFORGE_TRACKING_BASE_URL".into(),
                value: self.dispatch.tracking_base_url.clone(),
                reason: e.to_string(),
            });
        }
        if self.dispatch.default_from_domain.trim().is_empty() {
            return Err(ConfigError::Constraint(
                "MAILFORGE_DEFAULT_FROM_DOMAIN must not be empty".into(),
            ));
        }
        Ok(())
    }
}

struct Env<'a, F> {
    lookup: &'a F,
}

impl<F> Env<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn string(&self, key: &str, target: &mut String) {
        if let Some(value) = self.get(key) {
            *target = value;
        }
    }

    fn opt_string(&self, key: &str, target: &mut Option<String>) {
        if let Some(value) = self.get(key) {
            *target = Some(value);
        }
    }

    fn parse<T>(&self, key: &str, target: &mut T) -> Result<(), ConfigError>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        if let Some(value) = self.get(key) {
            *target = value.parse().map_err(|e: T::Err| ConfigError::Invalid {
                key: key.to_string(),
                value: value.clone(),
                reason: e.to_string(),
            })?;
        }
        Ok(())
    }
}
