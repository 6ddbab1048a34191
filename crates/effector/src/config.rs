//! Runtime configuration
//!
//! All tunables have documented defaults and can be read from a TOML file
//! and overridden from `EFFECTOR_*` environment variables.

use crate::error::{EffectorError, EffectorResult};
use anyhow::Context;
use common::LoggingConfig;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

const ENV_PREFIX: &str = "EFFECTOR_";

/// Largest mailbox bound a semaphore can count
pub const MAX_MAILBOX_CAPACITY: usize = tokio::sync::Semaphore::MAX_PERMITS;

/// Largest broadcast buffer tokio accepts
pub const MAX_SUBSCRIBER_BUFFER: usize = usize::MAX >> 1;

/// Mailbox sizing and backpressure for one agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MailboxConfig {
    /// Maximum queued records for a FIFO mailbox
    pub capacity: usize,
    /// Service records by priority instead of arrival order
    pub prioritized: bool,
    /// Maximum queued records for a prioritized mailbox
    pub priority_queue_size: usize,
    /// How long a send may wait for mailbox space before failing
    pub backpressure_timeout_ms: u64,
}

impl Default for MailboxConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            prioritized: false,
            priority_queue_size: 100,
            backpressure_timeout_ms: 5000,
        }
    }
}

impl MailboxConfig {
    /// A FIFO mailbox with the given bound
    pub fn bounded(capacity: usize) -> Self {
        Self {
            capacity,
            ..Self::default()
        }
    }

    /// A priority mailbox with the given bound
    pub fn prioritized(priority_queue_size: usize) -> Self {
        Self {
            prioritized: true,
            priority_queue_size,
            ..Self::default()
        }
    }

    /// Saturates at `u64::MAX` milliseconds; a non-zero timeout below one
    /// millisecond rounds up to one.
    pub fn with_backpressure_timeout(mut self, timeout: Duration) -> Self {
        let millis = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self.backpressure_timeout_ms = if millis == 0 && !timeout.is_zero() {
            1
        } else {
            millis
        };
        self
    }

    pub fn backpressure_timeout(&self) -> Duration {
        Duration::from_millis(self.backpressure_timeout_ms)
    }

    /// Effective bound for the selected queue discipline
    pub fn effective_capacity(&self) -> usize {
        if self.prioritized {
            self.priority_queue_size
        } else {
            self.capacity
        }
    }

    pub fn validate(&self) -> EffectorResult<()> {
        if self.effective_capacity() == 0 {
            return Err(EffectorError::InvalidConfig(
                "mailbox capacity must be positive".to_string(),
            ));
        }
        if self.effective_capacity() > MAX_MAILBOX_CAPACITY {
            return Err(EffectorError::InvalidConfig(format!(
                "mailbox capacity must not exceed {MAX_MAILBOX_CAPACITY}"
            )));
        }
        if self.backpressure_timeout_ms == 0 {
            return Err(EffectorError::InvalidConfig(
                "backpressure timeout must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration for a registry and the agents it creates
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EffectorConfig {
    /// Maximum number of live agents in one registry
    pub max_agents: usize,
    /// Broadcast buffer per agent; slower subscribers observe a lag error
    pub subscriber_buffer: usize,
    /// How long terminate waits for an interrupted fiber to finish
    pub shutdown_timeout_ms: u64,
    /// Default mailbox for agents created without an explicit one
    pub mailbox: MailboxConfig,
    pub logging: LoggingConfig,
}

impl Default for EffectorConfig {
    fn default() -> Self {
        Self {
            max_agents: 1000,
            subscriber_buffer: 256,
            shutdown_timeout_ms: 5000,
            mailbox: MailboxConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl EffectorConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn validate(&self) -> EffectorResult<()> {
        if self.max_agents == 0 {
            return Err(EffectorError::InvalidConfig(
                "max_agents must be positive".to_string(),
            ));
        }
        if self.subscriber_buffer == 0 {
            return Err(EffectorError::InvalidConfig(
                "subscriber_buffer must be positive".to_string(),
            ));
        }
        if self.subscriber_buffer > MAX_SUBSCRIBER_BUFFER {
            return Err(EffectorError::InvalidConfig(format!(
                "subscriber_buffer must not exceed {MAX_SUBSCRIBER_BUFFER}"
            )));
        }
        self.mailbox.validate()
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(content).context("failed to parse effector config")?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file, then apply environment overrides
    pub async fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let mut config = Self::load_file(path).await?;
        config.apply_env_overrides()?;

        info!(path = %path.display(), "Loaded effector configuration");
        Ok(config)
    }

    /// Load from a TOML file only, ignoring the environment
    pub async fn load_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read config file {}", path.display()))?;

        Self::from_toml_str(&content)
            .with_context(|| format!("invalid config file {}", path.display()))
    }

    /// Override fields from `EFFECTOR_*` environment variables
    pub fn apply_env_overrides(&mut self) -> anyhow::Result<()> {
        if let Some(value) = env_value("MAX_AGENTS")? {
            self.max_agents = value;
        }
        if let Some(value) = env_value("SUBSCRIBER_BUFFER")? {
            self.subscriber_buffer = value;
        }
        if let Some(value) = env_value("MAILBOX_CAPACITY")? {
            self.mailbox.capacity = value;
        }
        if let Some(value) = env_value("MAILBOX_PRIORITIZED")? {
            self.mailbox.prioritized = value;
        }
        if let Some(value) = env_value("PRIORITY_QUEUE_SIZE")? {
            self.mailbox.priority_queue_size = value;
        }
        if let Some(value) = env_value("BACKPRESSURE_TIMEOUT_MS")? {
            self.mailbox.backpressure_timeout_ms = value;
        }
        if let Ok(level) = env::var(format!("{ENV_PREFIX}LOG_LEVEL")) {
            self.logging.level = level;
        }

        self.validate()?;
        Ok(())
    }
}

fn env_value<T>(suffix: &str) -> anyhow::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let key = format!("{ENV_PREFIX}{suffix}");
    match env::var(&key) {
        Ok(raw) => {
            debug!(key = %key, value = %raw, "Applying environment override");
            raw.trim()
                .parse::<T>()
                .map(Some)
                .map_err(|e| anyhow::anyhow!("invalid value for {}: {}", key, e))
        }
        Err(_) => Ok(None),
    }
}
