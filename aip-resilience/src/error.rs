use thiserror::Error;

/// Result alias for resilience configuration.
pub type ResilienceResult<T> = Result<T, ResilienceError>;

/// Errors raised while configuring resilience components.
#[derive(Debug, Error)]
pub enum ResilienceError {
    /// A configuration value was out of range.
    #[error("invalid resilience configuration: {0}")]
    InvalidConfig(&'static str),

    /// A policy name did not parse.
    #[error("unknown reconnection policy `{0}`")]
    UnknownPolicy(String),
}

/// Failure of one recovery step for a device.
#[derive(Debug, Error)]
#[error("recovery of device `{device_id}` failed: {reason}")]
pub struct RecoveryError {
    /// Device being recovered.
    pub device_id: String,
    /// What went wrong.
    pub reason: String,
}

impl RecoveryError {
    /// Builds a recovery error for `device_id`.
    #[must_use]
    pub fn new(device_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            reason: reason.into(),
        }
    }
}
