//! Backoff policies and the disconnection recovery sequence.

use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::{DeviceRecovery, ResilienceError, ResilienceResult};

/// Reason passed to [`DeviceRecovery::cancel_device_tasks`] after a lost link.
const DISCONNECT_REASON: &str = "device_disconnected";

/// How long to wait before each reconnection attempt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconnectionPolicy {
    /// Never reconnect.
    None,
    /// Retry without waiting.
    Immediate,
    /// Wait `initial * (attempt + 1)`.
    LinearBackoff,
    /// Wait `initial * multiplier ^ attempt`.
    #[default]
    ExponentialBackoff,
}

impl ReconnectionPolicy {
    /// Returns the snake_case policy name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Immediate => "immediate",
            Self::LinearBackoff => "linear_backoff",
            Self::ExponentialBackoff => "exponential_backoff",
        }
    }
}

impl fmt::Display for ReconnectionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReconnectionPolicy {
    type Err = ResilienceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "immediate" => Ok(Self::Immediate),
            "linear" | "linear_backoff" => Ok(Self::LinearBackoff),
            "exponential" | "exponential_backoff" => Ok(Self::ExponentialBackoff),
            other => Err(ResilienceError::UnknownPolicy(other.to_owned())),
        }
    }
}

/// Reconnection tuning.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconnectionConfig {
    /// Backoff policy.
    pub policy: ReconnectionPolicy,
    /// Attempts made before giving up.
    pub max_retries: u32,
    /// Base delay.
    pub initial_backoff: Duration,
    /// Upper bound on any single delay.
    pub max_backoff: Duration,
    /// Growth factor for exponential backoff.
    pub multiplier: f64,
}

impl ReconnectionConfig {
    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ResilienceError::InvalidConfig`] when the bounds are
    /// inconsistent or the multiplier is not a finite value of at least one.
    pub fn validate(&self) -> ResilienceResult<()> {
        if self.initial_backoff > self.max_backoff {
            return Err(ResilienceError::InvalidConfig(
                "initial backoff cannot exceed max backoff",
            ));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(ResilienceError::InvalidConfig(
                "backoff multiplier must be a finite value of at least 1.0",
            ));
        }
        if self.policy != ReconnectionPolicy::None && self.max_retries == 0 {
            return Err(ResilienceError::InvalidConfig(
                "max retries must be greater than zero unless the policy is none",
            ));
        }
        Ok(())
    }
}

impl Default for ReconnectionConfig {
    fn default() -> Self {
        Self {
            policy: ReconnectionPolicy::ExponentialBackoff,
            max_retries: 5,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            multiplier: 2.0,
        }
    }
}

/// Outcome of a reconnection run. Exhaustion is an expected outcome, not an
/// error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectResult {
    /// `true` when a reconnection attempt succeeded.
    pub success: bool,
    /// Attempts made.
    pub attempts: u32,
}

impl ReconnectResult {
    /// Reconnected after `attempts` tries.
    #[must_use]
    pub const fn succeeded(attempts: u32) -> Self {
        Self {
            success: true,
            attempts,
        }
    }

    /// Gave up after `attempts` tries.
    #[must_use]
    pub const fn exhausted(attempts: u32) -> Self {
        Self {
            success: false,
            attempts,
        }
    }
}

/// Policy-driven reconnection.
#[derive(Debug, Default)]
pub struct ReconnectionStrategy {
    config: ReconnectionConfig,
    attempts: AtomicU32,
}

impl ReconnectionStrategy {
    /// Creates a strategy.
    #[must_use]
    pub fn new(config: ReconnectionConfig) -> Self {
        Self {
            config,
            attempts: AtomicU32::new(0),
        }
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &ReconnectionConfig {
        &self.config
    }

    /// Attempts made by the run in progress, or by the last run if it
    /// exhausted its retries. Reset to zero by a successful reconnection.
    #[must_use]
    pub fn attempt_count(&self) -> u32 {
        self.attempts.load(Ordering::Acquire)
    }

    /// Clears the attempt counter.
    pub fn reset(&self) {
        self.attempts.store(0, Ordering::Release);
    }

    /// Delay before the zero-based `attempt`.
    #[must_use]
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let ReconnectionConfig {
            initial_backoff,
            max_backoff,
            multiplier,
            ..
        } = self.config;
        match self.config.policy {
            ReconnectionPolicy::None | ReconnectionPolicy::Immediate => Duration::ZERO,
            ReconnectionPolicy::LinearBackoff => initial_backoff
                .saturating_mul(attempt.saturating_add(1))
                .min(max_backoff),
            ReconnectionPolicy::ExponentialBackoff => {
                let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
                let secs = initial_backoff.as_secs_f64() * multiplier.powi(exponent);
                Duration::try_from_secs_f64(secs)
                    .unwrap_or(max_backoff)
                    .min(max_backoff)
            }
        }
    }

    /// Calls [`DeviceRecovery::reconnect_device`] up to `max_retries` times,
    /// sleeping the backoff before each attempt.
    pub async fn attempt_reconnection(
        &self,
        target: &dyn DeviceRecovery,
        device_id: &str,
    ) -> ReconnectResult {
        if self.config.policy == ReconnectionPolicy::None {
            return ReconnectResult::exhausted(0);
        }
        for attempt in 0..self.config.max_retries {
            let delay = self.backoff_for(attempt);
            self.attempts.store(attempt + 1, Ordering::Release);
            info!(
                %device_id,
                attempt = attempt + 1,
                max_retries = self.config.max_retries,
                ?delay,
                "attempting reconnection"
            );
            if !delay.is_zero() {
                sleep(delay).await;
            }
            if target.reconnect_device(device_id).await {
                info!(%device_id, attempts = attempt + 1, "device reconnected");
                self.reset();
                return ReconnectResult::succeeded(attempt + 1);
            }
            warn!(%device_id, attempt = attempt + 1, "reconnection attempt failed");
        }
        error!(
            %device_id,
            max_retries = self.config.max_retries,
            "reconnection attempts exhausted"
        );
        ReconnectResult::exhausted(self.config.max_retries)
    }

    /// Runs the recovery sequence for a lost device: cancel its tasks, report
    /// the disconnection, then reconnect unless the policy is
    /// [`ReconnectionPolicy::None`]. A failing step is logged and the
    /// sequence carries on.
    pub async fn handle_disconnection(
        &self,
        target: &dyn DeviceRecovery,
        device_id: &str,
    ) -> ReconnectResult {
        self.handle_disconnection_with(target, device_id, || async { Ok(()) })
            .await
    }

    /// [`handle_disconnection`](Self::handle_disconnection) plus a callback
    /// run after a successful reconnection. Callback errors are logged.
    pub async fn handle_disconnection_with<F, Fut>(
        &self,
        target: &dyn DeviceRecovery,
        device_id: &str,
        on_reconnect: F,
    ) -> ReconnectResult
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = anyhow::Result<()>> + Send,
    {
        warn!(%device_id, "handling device disconnection");

        if let Err(err) = target.cancel_device_tasks(device_id, DISCONNECT_REASON).await {
            error!(%device_id, %err, "cancelling device tasks failed");
        }
        if let Err(err) = target.on_device_disconnected(device_id).await {
            error!(%device_id, %err, "disconnection notification failed");
        }
        if self.config.policy == ReconnectionPolicy::None {
            info!(%device_id, "reconnection disabled by policy");
            return ReconnectResult::exhausted(0);
        }

        let outcome = self.attempt_reconnection(target, device_id).await;
        if outcome.success {
            if let Err(err) = on_reconnect().await {
                error!(%device_id, ?err, "reconnect callback failed");
            }
        }
        outcome
    }
}
