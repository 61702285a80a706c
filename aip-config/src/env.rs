//! `AIP_*` environment overrides.

use std::str::FromStr;

use tracing::debug;

use crate::{AipSettings, ConfigError, ConfigResult};

/// Prefix shared by every recognised variable.
pub const ENV_PREFIX: &str = "AIP_";

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> ConfigResult<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let name = format!("{ENV_PREFIX}{key}");
    let Some(raw) = lookup(&name) else {
        return Ok(None);
    };
    let value = raw.trim().parse::<T>().map_err(|err| ConfigError::InvalidValue {
        key: name.clone(),
        value: raw.clone(),
        reason: err.to_string(),
    })?;
    debug!(key = %name, value = %raw.trim(), "settings override from environment");
    Ok(Some(value))
}

macro_rules! override_from {
    ($lookup:expr, $($key:literal => $field:expr),+ $(,)?) => {
        $(
            if let Some(value) = parse($lookup, $key)? {
                $field = value;
            }
        )+
    };
}

impl AipSettings {
    /// Defaults overridden by the process environment, validated.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for unparsable or invalid values.
    pub fn from_env() -> ConfigResult<Self> {
        Self::default().with_env_overrides(|key| std::env::var(key).ok())
    }

    /// Applies `AIP_*` overrides read through `lookup`, then validates.
    ///
    /// Recognised keys: `HEARTBEAT_INTERVAL`, `RECONNECT_POLICY`,
    /// `MAX_RETRIES`, `INITIAL_BACKOFF`, `MAX_BACKOFF`, `BACKOFF_MULTIPLIER`,
    /// `DEFAULT_TIMEOUT`, `REGISTRATION_TIMEOUT`, `COMMAND_TIMEOUT`,
    /// `TASK_TIMEOUT`, `PING_INTERVAL`, `PING_TIMEOUT`, `CLOSE_TIMEOUT`,
    /// `OPEN_TIMEOUT` and `MAX_SIZE`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for unparsable or invalid values.
    pub fn with_env_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> ConfigResult<Self> {
        override_from!(&lookup,
            "HEARTBEAT_INTERVAL" => self.heartbeat.interval,
            "RECONNECT_POLICY" => self.reconnection.policy,
            "MAX_RETRIES" => self.reconnection.max_retries,
            "INITIAL_BACKOFF" => self.reconnection.initial_backoff,
            "MAX_BACKOFF" => self.reconnection.max_backoff,
            "BACKOFF_MULTIPLIER" => self.reconnection.multiplier,
            "DEFAULT_TIMEOUT" => self.timeouts.default,
            "REGISTRATION_TIMEOUT" => self.timeouts.registration,
            "COMMAND_TIMEOUT" => self.timeouts.command,
            "TASK_TIMEOUT" => self.timeouts.task,
            "PING_INTERVAL" => self.transport.ping_interval,
            "PING_TIMEOUT" => self.transport.ping_timeout,
            "CLOSE_TIMEOUT" => self.transport.close_timeout,
            "OPEN_TIMEOUT" => self.transport.open_timeout,
            "MAX_SIZE" => self.transport.max_size,
        );
        self.validate()?;
        Ok(self)
    }
}
