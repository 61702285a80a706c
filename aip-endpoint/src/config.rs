//! Endpoint tuning shared by the server, device and constellation sides.

use std::num::NonZeroUsize;
use std::time::Duration;

use aip_config::AipSettings;
use aip_resilience::ReconnectionConfig;
use aip_transport::TransportConfig;

use crate::{EndpointError, EndpointResult};

const DEFAULT_MAX_SESSIONS: usize = 32;
const DEFAULT_TAP_CAPACITY: usize = 256;

/// Timeouts, reconnection and socket parameters for one endpoint.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EndpointConfig {
    heartbeat_interval: Duration,
    registration_timeout: Duration,
    command_timeout: Duration,
    task_timeout: Duration,
    default_timeout: Duration,
    reconnection: ReconnectionConfig,
    transport: TransportConfig,
    max_sessions: NonZeroUsize,
    tap_capacity: usize,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            registration_timeout: Duration::from_secs(30),
            command_timeout: Duration::from_secs(60),
            task_timeout: Duration::from_secs(600),
            default_timeout: Duration::from_secs(30),
            reconnection: ReconnectionConfig::default(),
            transport: TransportConfig::default(),
            max_sessions: NonZeroUsize::new(DEFAULT_MAX_SESSIONS).unwrap_or(NonZeroUsize::MIN),
            tap_capacity: DEFAULT_TAP_CAPACITY,
        }
    }
}

impl EndpointConfig {
    /// Builds a configuration from loaded settings.
    ///
    /// # Errors
    ///
    /// Returns [`EndpointError::Config`] when a setting is out of range.
    pub fn from_settings(settings: &AipSettings) -> EndpointResult<Self> {
        let config = Self {
            heartbeat_interval: settings.heartbeat_interval()?,
            registration_timeout: settings.registration_timeout()?,
            command_timeout: settings.command_timeout()?,
            task_timeout: settings.task_timeout()?,
            default_timeout: settings.default_timeout()?,
            reconnection: settings.reconnection_config()?,
            transport: settings.transport_config()?,
            ..Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Returns the heartbeat interval.
    #[must_use]
    pub const fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    /// Returns the wait for a registration answer.
    #[must_use]
    pub const fn registration_timeout(&self) -> Duration {
        self.registration_timeout
    }

    /// Returns the wait for a command batch.
    #[must_use]
    pub const fn command_timeout(&self) -> Duration {
        self.command_timeout
    }

    /// Returns the wait for a task to end.
    #[must_use]
    pub const fn task_timeout(&self) -> Duration {
        self.task_timeout
    }

    /// Returns the fallback deadline.
    #[must_use]
    pub const fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Returns the reconnection tuning.
    #[must_use]
    pub const fn reconnection(&self) -> &ReconnectionConfig {
        &self.reconnection
    }

    /// Returns the socket parameters.
    #[must_use]
    pub const fn transport(&self) -> TransportConfig {
        self.transport
    }

    /// Returns how many task sessions may run at once.
    #[must_use]
    pub const fn max_sessions(&self) -> NonZeroUsize {
        self.max_sessions
    }

    /// Returns how many inbound messages the tap buffers per subscriber.
    #[must_use]
    pub const fn tap_capacity(&self) -> usize {
        self.tap_capacity
    }

    /// Sets the heartbeat interval.
    #[must_use]
    pub const fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Sets the registration timeout.
    #[must_use]
    pub const fn with_registration_timeout(mut self, timeout: Duration) -> Self {
        self.registration_timeout = timeout;
        self
    }

    /// Sets the command timeout.
    #[must_use]
    pub const fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Sets the task timeout.
    #[must_use]
    pub const fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = timeout;
        self
    }

    /// Sets the fallback deadline.
    #[must_use]
    pub const fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Replaces the reconnection tuning.
    #[must_use]
    pub const fn with_reconnection(mut self, reconnection: ReconnectionConfig) -> Self {
        self.reconnection = reconnection;
        self
    }

    /// Replaces the socket parameters.
    #[must_use]
    pub const fn with_transport(mut self, transport: TransportConfig) -> Self {
        self.transport = transport;
        self
    }

    /// Caps concurrent task sessions.
    #[must_use]
    pub const fn with_max_sessions(mut self, max_sessions: NonZeroUsize) -> Self {
        self.max_sessions = max_sessions;
        self
    }

    /// Sets the inbound tap buffer size.
    #[must_use]
    pub const fn with_tap_capacity(mut self, capacity: usize) -> Self {
        self.tap_capacity = capacity;
        self
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`EndpointError::InvalidConfig`] when a duration is zero, the
    /// tap has no room, or a nested configuration is inconsistent.
    pub fn validate(&self) -> EndpointResult<()> {
        if self.heartbeat_interval.is_zero() {
            return Err(EndpointError::InvalidConfig(
                "heartbeat interval must be greater than zero",
            ));
        }
        if self.registration_timeout.is_zero()
            || self.command_timeout.is_zero()
            || self.task_timeout.is_zero()
            || self.default_timeout.is_zero()
        {
            return Err(EndpointError::InvalidConfig(
                "timeouts must be greater than zero",
            ));
        }
        if self.tap_capacity == 0 {
            return Err(EndpointError::InvalidConfig(
                "tap capacity must be greater than zero",
            ));
        }
        self.reconnection
            .validate()
            .map_err(|_| EndpointError::InvalidConfig("reconnection backoff bounds are inconsistent"))?;
        self.transport
            .validate()
            .map_err(|_| EndpointError::InvalidConfig("transport timeouts and size limit must be positive"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aip_resilience::ReconnectionPolicy;

    #[test]
    fn defaults_validate() {
        let config = EndpointConfig::default();
        config.validate().unwrap();
        assert_eq!(config.command_timeout(), Duration::from_secs(60));
        assert_eq!(config.max_sessions().get(), 32);
    }

    #[test]
    fn settings_flow_into_endpoint_config() {
        let settings = AipSettings::parse(
            "[heartbeat]\ninterval = 2\n[timeouts]\ntask = 5\n[reconnection]\npolicy = \"immediate\"\n",
        )
        .unwrap();
        let config = EndpointConfig::from_settings(&settings).unwrap();
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(2));
        assert_eq!(config.task_timeout(), Duration::from_secs(5));
        assert_eq!(config.reconnection().policy, ReconnectionPolicy::Immediate);
    }

    #[test]
    fn rejects_zero_durations() {
        let config = EndpointConfig::default().with_command_timeout(Duration::ZERO);
        assert!(matches!(config.validate(), Err(EndpointError::InvalidConfig(_))));
        let config = EndpointConfig::default().with_tap_capacity(0);
        assert!(config.validate().is_err());
    }
}
