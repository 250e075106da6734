//! Runtime configuration.
//!
//! Defaults cover a development setup. `from_env` overlays `COURIER_*`
//! variables on top of the defaults and validates the result:
//!
//! | variable                              | field                           |
//! |---------------------------------------|---------------------------------|
//! | `COURIER_RETRY_MAX_ATTEMPTS`          | `retry.max_attempts`            |
//! | `COURIER_RETRY_BACKOFF_MILLIS`        | `retry.backoff_millis`          |
//! | `COURIER_OUTBOX_BATCH_SIZE`           | `outbox.batch_size`             |
//! | `COURIER_OUTBOX_POLL_INTERVAL_MILLIS` | `outbox.poll_interval_millis`   |
//! | `COURIER_OUTBOX_CLAIM_TIMEOUT_MILLIS` | `outbox.claim_timeout_millis`   |
//! | `COURIER_OUTBOX_MAX_RETRIES`          | `outbox.max_retries`            |
//! | `COURIER_OUTBOX_RESCHEDULE_FAILED`    | `outbox.reschedule_failed`      |
//! | `COURIER_OUTBOX_TOPIC_PREFIX`         | `outbox.topic_prefix`           |
//! | `COURIER_PROJECTION_WORKERS`          | `projection.workers`            |
//! | `COURIER_PROJECTION_QUEUE_CAPACITY`   | `projection.queue_capacity`     |

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

use crate::app::retry::{DefaultRetryPolicy, RetryOptions};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}")]
    Invalid { key: String, value: String },

    #[error("invalid configuration: {0}")]
    Validation(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CourierConfig {
    pub retry: RetrySettings,
    pub outbox: OutboxConfig,
    pub projection: ProjectionConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub backoff_millis: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_millis: 100,
        }
    }
}

impl RetrySettings {
    pub fn policy(&self) -> DefaultRetryPolicy {
        DefaultRetryPolicy::new(self.max_attempts, Duration::from_millis(self.backoff_millis))
    }

    pub fn options(&self) -> RetryOptions {
        RetryOptions::new(self.max_attempts, self.backoff_millis)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboxConfig {
    pub batch_size: usize,
    pub poll_interval_millis: u64,
    pub claim_timeout_millis: u64,
    /// Sweep cap; FAILED events at this many attempts are dead letters.
    pub max_retries: u32,
    pub reschedule_failed: bool,
    pub topic_prefix: String,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            poll_interval_millis: 1000,
            claim_timeout_millis: 30_000,
            max_retries: 5,
            reschedule_failed: true,
            topic_prefix: "courier".to_string(),
        }
    }
}

impl OutboxConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_millis)
    }

    pub fn claim_timeout(&self) -> Duration {
        Duration::from_millis(self.claim_timeout_millis)
    }

    /// `{topic_prefix}.{aggregate_type}`, lower-cased.
    pub fn topic_for(&self, aggregate_type: &str) -> String {
        if self.topic_prefix.is_empty() {
            return aggregate_type.to_lowercase();
        }
        format!("{}.{}", self.topic_prefix, aggregate_type).to_lowercase()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectionConfig {
    pub workers: usize,
    pub queue_capacity: usize,
}

impl Default for ProjectionConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 1024,
        }
    }
}

impl CourierConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as `from_env`, reading variables through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let env = Overlay { lookup: &lookup };

        env.apply("COURIER_RETRY_MAX_ATTEMPTS", &mut config.retry.max_attempts)?;
        env.apply("COURIER_RETRY_BACKOFF_MILLIS", &mut config.retry.backoff_millis)?;
        env.apply("COURIER_OUTBOX_BATCH_SIZE", &mut config.outbox.batch_size)?;
        env.apply(
            "COURIER_OUTBOX_POLL_INTERVAL_MILLIS",
            &mut config.outbox.poll_interval_millis,
        )?;
        env.apply(
            "COURIER_OUTBOX_CLAIM_TIMEOUT_MILLIS",
            &mut config.outbox.claim_timeout_millis,
        )?;
        env.apply("COURIER_OUTBOX_MAX_RETRIES", &mut config.outbox.max_retries)?;
        env.apply(
            "COURIER_OUTBOX_RESCHEDULE_FAILED",
            &mut config.outbox.reschedule_failed,
        )?;
        env.apply("COURIER_OUTBOX_TOPIC_PREFIX", &mut config.outbox.topic_prefix)?;
        env.apply("COURIER_PROJECTION_WORKERS", &mut config.projection.workers)?;
        env.apply(
            "COURIER_PROJECTION_QUEUE_CAPACITY",
            &mut config.projection.queue_capacity,
        )?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Validation(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.outbox.batch_size == 0 {
            return Err(ConfigError::Validation(
                "outbox.batch_size must be at least 1".to_string(),
            ));
        }
        if self.outbox.claim_timeout_millis == 0 {
            return Err(ConfigError::Validation(
                "outbox.claim_timeout_millis must be positive".to_string(),
            ));
        }
        if self.projection.workers == 0 || self.projection.queue_capacity == 0 {
            return Err(ConfigError::Validation(
                "projection.workers and projection.queue_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

struct Overlay<'a, F> {
    lookup: &'a F,
}

impl<F: Fn(&str) -> Option<String>> Overlay<'_, F> {
    fn apply<T: FromStr>(&self, key: &str, field: &mut T) -> Result<(), ConfigError> {
        let Some(raw) = (self.lookup)(key) else {
            return Ok(());
        };
        *field = raw.trim().parse().map_err(|_| ConfigError::Invalid {
            key: key.to_string(),
            value: raw.clone(),
        })?;
        Ok(())
    }
}
