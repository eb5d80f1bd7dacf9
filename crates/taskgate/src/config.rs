//! Dispatch configuration
//!
//! Tunables for the work queue, its poll loop and the visibility reaper.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    /// Invalid configuration
    #[error("invalid dispatch configuration: {0}")]
    Invalid(String),
}

/// Work queue configuration
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use taskgate::DispatchConfig;
///
/// let config = DispatchConfig::default()
///     .with_poll_interval(Duration::from_millis(50))
///     .with_unack_grace_window(Duration::from_secs(30));
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DispatchConfig {
    /// How long a lease may go unacknowledged before the reaper releases it
    #[serde(with = "duration_millis")]
    pub unack_grace_window: Duration,

    /// Sleep between re-polls inside `pop`
    #[serde(with = "duration_millis")]
    pub poll_interval: Duration,

    /// Period of the background reaper
    #[serde(with = "duration_millis")]
    pub reaper_interval: Duration,

    /// Whether the work queue starts its reaper on construction
    pub reaper_enabled: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            unack_grace_window: Duration::from_secs(60),
            poll_interval: Duration::from_millis(200),
            reaper_interval: Duration::from_secs(60),
            reaper_enabled: true,
        }
    }
}

impl DispatchConfig {
    /// Create a new configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Create configuration from environment variables
    ///
    /// Environment variables (all optional, defaults otherwise):
    /// - `TASKGATE_UNACK_GRACE_MS`: Lease grace window in milliseconds
    /// - `TASKGATE_POLL_INTERVAL_MS`: Pop re-poll interval in milliseconds
    /// - `TASKGATE_REAPER_INTERVAL_MS`: Reaper period in milliseconds
    /// - `TASKGATE_REAPER_ENABLED`: "false" to disable the owned reaper
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            unack_grace_window: env_millis("TASKGATE_UNACK_GRACE_MS")
                .unwrap_or(defaults.unack_grace_window),
            poll_interval: env_millis("TASKGATE_POLL_INTERVAL_MS")
                .unwrap_or(defaults.poll_interval),
            reaper_interval: env_millis("TASKGATE_REAPER_INTERVAL_MS")
                .unwrap_or(defaults.reaper_interval),
            reaper_enabled: std::env::var("TASKGATE_REAPER_ENABLED")
                .map(|v| v.to_lowercase() != "false")
                .unwrap_or(defaults.reaper_enabled),
        }
    }

    /// Set the lease grace window
    pub fn with_unack_grace_window(mut self, window: Duration) -> Self {
        self.unack_grace_window = window;
        self
    }

    /// Set the pop re-poll interval
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the reaper period
    pub fn with_reaper_interval(mut self, interval: Duration) -> Self {
        self.reaper_interval = interval;
        self
    }

    /// Disable the reaper owned by the work queue
    pub fn without_reaper(mut self) -> Self {
        self.reaper_enabled = false;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "poll_interval must be greater than zero".into(),
            ));
        }
        if self.reaper_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "reaper_interval must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

fn env_millis(name: &str) -> Option<Duration> {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_millis)
}

/// Serde support for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
