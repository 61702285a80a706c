use std::path::Path;
use std::time::Duration;

use aip_resilience::{ReconnectionConfig, ReconnectionPolicy};
use aip_transport::TransportConfig;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{ConfigError, ConfigResult};

/// Top-level settings document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AipSettings {
    /// Heartbeat cadence.
    pub heartbeat: HeartbeatSettings,
    /// Reconnection backoff.
    pub reconnection: ReconnectionSettings,
    /// Operation deadlines.
    pub timeouts: TimeoutSettings,
    /// Socket parameters.
    pub transport: TransportSettings,
}

/// `[heartbeat]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HeartbeatSettings {
    /// Seconds between heartbeats.
    pub interval: f64,
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self { interval: 30.0 }
    }
}

/// `[reconnection]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReconnectionSettings {
    /// Backoff policy.
    pub policy: ReconnectionPolicy,
    /// Attempts before giving up.
    pub max_retries: u32,
    /// Base delay in seconds.
    pub initial_backoff: f64,
    /// Delay cap in seconds.
    pub max_backoff: f64,
    /// Exponential growth factor.
    pub multiplier: f64,
}

impl Default for ReconnectionSettings {
    fn default() -> Self {
        let config = ReconnectionConfig::default();
        Self {
            policy: config.policy,
            max_retries: config.max_retries,
            initial_backoff: config.initial_backoff.as_secs_f64(),
            max_backoff: config.max_backoff.as_secs_f64(),
            multiplier: config.multiplier,
        }
    }
}

/// `[timeouts]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TimeoutSettings {
    /// Fallback deadline for any operation.
    pub default: f64,
    /// Wait for a registration answer.
    pub registration: f64,
    /// Wait for a command batch to finish on the device.
    pub command: f64,
    /// Wait for a dispatched task to end.
    pub task: f64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            default: 30.0,
            registration: 30.0,
            command: 60.0,
            task: 600.0,
        }
    }
}

/// `[transport]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransportSettings {
    /// Seconds between keepalive pings.
    pub ping_interval: f64,
    /// Seconds of silence before the link is declared dead.
    pub ping_timeout: f64,
    /// Seconds allowed for a graceful close.
    pub close_timeout: f64,
    /// Seconds allowed for dialing.
    pub open_timeout: f64,
    /// Largest accepted message, in bytes.
    pub max_size: usize,
}

impl Default for TransportSettings {
    fn default() -> Self {
        let config = TransportConfig::default();
        Self {
            ping_interval: config.ping_interval().as_secs_f64(),
            ping_timeout: config.ping_timeout().as_secs_f64(),
            close_timeout: config.close_timeout().as_secs_f64(),
            open_timeout: config.open_timeout().as_secs_f64(),
            max_size: config.max_size(),
        }
    }
}

fn seconds(value: f64, what: &'static str) -> ConfigResult<Duration> {
    Duration::try_from_secs_f64(value).map_err(|_| ConfigError::Invalid(what))
}

fn positive(value: f64, what: &'static str) -> ConfigResult<Duration> {
    let duration = seconds(value, what)?;
    if duration.is_zero() {
        return Err(ConfigError::Invalid(what));
    }
    Ok(duration)
}

impl AipSettings {
    /// Reads and validates settings from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the file cannot be read, parsed or
    /// validated.
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(path = %path.display(), "loaded settings file");
        Self::parse(&content)
    }

    /// Parses and validates settings from TOML text.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] or a validation error.
    pub fn parse(content: &str) -> ConfigResult<Self> {
        let settings: Self = toml::from_str(content)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Checks every section.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first bad value.
    pub fn validate(&self) -> ConfigResult<()> {
        self.heartbeat_interval()?;
        self.default_timeout()?;
        self.registration_timeout()?;
        self.command_timeout()?;
        self.task_timeout()?;
        self.reconnection_config()?
            .validate()
            .map_err(|_| ConfigError::Invalid("reconnection backoff bounds are inconsistent"))?;
        self.transport_config()?
            .validate()
            .map_err(|_| ConfigError::Invalid("transport timeouts and size limit must be positive"))?;
        Ok(())
    }

    /// Heartbeat interval.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for a non-positive value.
    pub fn heartbeat_interval(&self) -> ConfigResult<Duration> {
        positive(self.heartbeat.interval, "heartbeat interval must be a positive number of seconds")
    }

    /// Fallback operation deadline.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for a non-positive value.
    pub fn default_timeout(&self) -> ConfigResult<Duration> {
        positive(self.timeouts.default, "default timeout must be a positive number of seconds")
    }

    /// Wait for a registration answer.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for a non-positive value.
    pub fn registration_timeout(&self) -> ConfigResult<Duration> {
        positive(
            self.timeouts.registration,
            "registration timeout must be a positive number of seconds",
        )
    }

    /// Wait for a command batch.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for a non-positive value.
    pub fn command_timeout(&self) -> ConfigResult<Duration> {
        positive(self.timeouts.command, "command timeout must be a positive number of seconds")
    }

    /// Wait for a dispatched task to end.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for a non-positive value.
    pub fn task_timeout(&self) -> ConfigResult<Duration> {
        positive(self.timeouts.task, "task timeout must be a positive number of seconds")
    }

    /// Builds the reconnection configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for negative or non-finite delays.
    pub fn reconnection_config(&self) -> ConfigResult<ReconnectionConfig> {
        let section = &self.reconnection;
        Ok(ReconnectionConfig {
            policy: section.policy,
            max_retries: section.max_retries,
            initial_backoff: seconds(section.initial_backoff, "initial backoff must be a non-negative number of seconds")?,
            max_backoff: seconds(section.max_backoff, "max backoff must be a non-negative number of seconds")?,
            multiplier: section.multiplier,
        })
    }

    /// Builds the transport configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for negative or non-finite values.
    pub fn transport_config(&self) -> ConfigResult<TransportConfig> {
        let section = &self.transport;
        Ok(TransportConfig::default()
            .with_ping_interval(seconds(section.ping_interval, "ping interval must be a non-negative number of seconds")?)
            .with_ping_timeout(seconds(section.ping_timeout, "ping timeout must be a non-negative number of seconds")?)
            .with_close_timeout(seconds(section.close_timeout, "close timeout must be a non-negative number of seconds")?)
            .with_open_timeout(seconds(section.open_timeout, "open timeout must be a non-negative number of seconds")?)
            .with_max_size(section.max_size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let settings = AipSettings::default();
        settings.validate().unwrap();
        assert_eq!(settings.heartbeat_interval().unwrap(), Duration::from_secs(30));
        assert_eq!(settings.transport_config().unwrap(), TransportConfig::default());
        assert_eq!(settings.reconnection_config().unwrap(), ReconnectionConfig::default());
    }

    #[test]
    fn partial_documents_fill_in_defaults() {
        let settings = AipSettings::parse(
            r#"
            [heartbeat]
            interval = 5

            [reconnection]
            policy = "linear_backoff"
            max_retries = 3
            initial_backoff = 0.5
            "#,
        )
        .unwrap();
        assert_eq!(settings.heartbeat_interval().unwrap(), Duration::from_secs(5));
        let reconnection = settings.reconnection_config().unwrap();
        assert_eq!(reconnection.policy, ReconnectionPolicy::LinearBackoff);
        assert_eq!(reconnection.initial_backoff, Duration::from_millis(500));
        assert_eq!(reconnection.max_backoff, Duration::from_secs(60));
        assert_eq!(settings.timeouts, TimeoutSettings::default());
    }

    #[test]
    fn rejects_unknown_fields_and_bad_values() {
        assert!(matches!(
            AipSettings::parse("[heartbeat]\nperiod = 3"),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            AipSettings::parse("[heartbeat]\ninterval = 0"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            AipSettings::parse("[reconnection]\ninitial_backoff = 90"),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn loads_from_a_file() {
        let path = std::env::temp_dir().join(format!("aip-settings-{}.toml", std::process::id()));
        std::fs::write(&path, "[timeouts]\ncommand = 12.5\n").unwrap();
        let settings = AipSettings::load(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(settings.command_timeout().unwrap(), Duration::from_millis(12_500));

        assert!(matches!(
            AipSettings::load("/definitely/not/here.toml"),
            Err(ConfigError::Io { .. })
        ));
    }
}
