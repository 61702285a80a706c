//! Socket limits and timeouts for WebSocket transports.

use std::time::Duration;

use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;

use crate::{TransportError, TransportResult};

/// Default keepalive ping interval.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(30);
/// Default silence tolerated before the connection is declared dead.
pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(180);
/// Default wait for a graceful close.
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(10);
/// Default wait for the opening handshake.
pub const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_secs(10);
/// Default frame size limit; large enough for screenshots.
pub const DEFAULT_MAX_SIZE: usize = 100 * 1024 * 1024;

/// Connection parameters shared by every transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportConfig {
    ping_interval: Duration,
    ping_timeout: Duration,
    close_timeout: Duration,
    open_timeout: Duration,
    max_size: usize,
}

impl TransportConfig {
    /// Sets the keepalive ping interval. Zero disables keepalive.
    #[must_use]
    pub const fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    /// Sets how long the connection may stay silent before it is declared dead.
    #[must_use]
    pub const fn with_ping_timeout(mut self, timeout: Duration) -> Self {
        self.ping_timeout = timeout;
        self
    }

    /// Sets the graceful-close timeout.
    #[must_use]
    pub const fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    /// Sets the opening handshake timeout.
    #[must_use]
    pub const fn with_open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = timeout;
        self
    }

    /// Sets the maximum frame size in bytes.
    #[must_use]
    pub const fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    /// Returns the keepalive ping interval.
    #[must_use]
    pub const fn ping_interval(&self) -> Duration {
        self.ping_interval
    }

    /// Returns the silence tolerance.
    #[must_use]
    pub const fn ping_timeout(&self) -> Duration {
        self.ping_timeout
    }

    /// Returns the graceful-close timeout.
    #[must_use]
    pub const fn close_timeout(&self) -> Duration {
        self.close_timeout
    }

    /// Returns the opening handshake timeout.
    #[must_use]
    pub const fn open_timeout(&self) -> Duration {
        self.open_timeout
    }

    /// Returns the maximum frame size in bytes.
    #[must_use]
    pub const fn max_size(&self) -> usize {
        self.max_size
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Protocol`] when a limit is zero or the ping
    /// timeout is shorter than the ping interval.
    pub fn validate(&self) -> TransportResult<()> {
        let invalid = |reason: &str| {
            Err(TransportError::Protocol {
                reason: format!("invalid transport configuration: {reason}"),
            })
        };
        if self.max_size == 0 {
            return invalid("max size must be greater than zero");
        }
        if self.close_timeout.is_zero() {
            return invalid("close timeout must be greater than zero");
        }
        if self.open_timeout.is_zero() {
            return invalid("open timeout must be greater than zero");
        }
        if !self.ping_interval.is_zero() && self.ping_timeout < self.ping_interval {
            return invalid("ping timeout cannot be shorter than the ping interval");
        }
        Ok(())
    }

    pub(crate) fn websocket_config(&self) -> WebSocketConfig {
        WebSocketConfig::default()
            .max_message_size(Some(self.max_size))
            .max_frame_size(Some(self.max_size))
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            ping_interval: DEFAULT_PING_INTERVAL,
            ping_timeout: DEFAULT_PING_TIMEOUT,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
            open_timeout: DEFAULT_OPEN_TIMEOUT,
            max_size: DEFAULT_MAX_SIZE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = TransportConfig::default();
        assert_eq!(config.ping_interval(), Duration::from_secs(30));
        assert_eq!(config.ping_timeout(), Duration::from_secs(180));
        assert_eq!(config.close_timeout(), Duration::from_secs(10));
        assert_eq!(config.max_size(), 100 * 1024 * 1024);
        config.validate().unwrap();
    }

    #[test]
    fn rejects_ping_timeout_below_interval() {
        let config = TransportConfig::default()
            .with_ping_interval(Duration::from_secs(10))
            .with_ping_timeout(Duration::from_secs(5));
        assert!(config.validate().is_err());

        let disabled = config.with_ping_interval(Duration::ZERO);
        disabled.validate().unwrap();
    }
}
