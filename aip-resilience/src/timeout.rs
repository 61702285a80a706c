//! Deadlines for fallible futures.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

/// Deadline applied when a call does not supply its own.
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Failure of an operation run under a deadline.
#[derive(Debug, Error)]
pub enum TimeoutError<E> {
    /// The deadline passed first.
    #[error("operation `{operation}` timed out after {timeout:?}")]
    Elapsed {
        /// Name of the operation.
        operation: String,
        /// Deadline that was exceeded.
        timeout: Duration,
    },

    /// The operation failed on its own.
    #[error("{0}")]
    Operation(E),
}

impl<E> TimeoutError<E> {
    /// Returns `true` for [`TimeoutError::Elapsed`].
    #[must_use]
    pub const fn is_elapsed(&self) -> bool {
        matches!(self, Self::Elapsed { .. })
    }
}

/// Wraps futures with a deadline. Expiry drops the wrapped future.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutManager {
    default_timeout: Duration,
}

impl Default for TimeoutManager {
    fn default() -> Self {
        Self::new(DEFAULT_OPERATION_TIMEOUT)
    }
}

impl TimeoutManager {
    /// Creates a manager with the given default deadline.
    #[must_use]
    pub const fn new(default_timeout: Duration) -> Self {
        Self { default_timeout }
    }

    /// Returns the default deadline.
    #[must_use]
    pub const fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Runs `operation`, failing with [`TimeoutError::Elapsed`] if it takes
    /// longer than `timeout` (or the default). Other errors are logged and
    /// passed through as [`TimeoutError::Operation`].
    ///
    /// # Errors
    ///
    /// See above.
    pub async fn with_timeout<F, T, E>(
        &self,
        operation: F,
        timeout: Option<Duration>,
        name: &str,
    ) -> Result<T, TimeoutError<E>>
    where
        F: Future<Output = Result<T, E>>,
        E: Display,
    {
        let timeout = timeout.unwrap_or(self.default_timeout);
        match tokio::time::timeout(timeout, operation).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => {
                warn!(operation = %name, %err, "operation failed");
                Err(TimeoutError::Operation(err))
            }
            Err(_) => {
                warn!(operation = %name, ?timeout, "operation timed out");
                Err(TimeoutError::Elapsed {
                    operation: name.to_owned(),
                    timeout,
                })
            }
        }
    }

    /// Like [`with_timeout`](Self::with_timeout), but an expired deadline
    /// yields `Ok(None)`.
    ///
    /// # Errors
    ///
    /// Returns the operation's own error.
    pub async fn with_timeout_or_none<F, T, E>(
        &self,
        operation: F,
        timeout: Option<Duration>,
        name: &str,
    ) -> Result<Option<T>, E>
    where
        F: Future<Output = Result<T, E>>,
        E: Display,
    {
        match self.with_timeout(operation, timeout, name).await {
            Ok(value) => Ok(Some(value)),
            Err(TimeoutError::Elapsed { .. }) => {
                debug!(operation = %name, "deadline passed; returning nothing");
                Ok(None)
            }
            Err(TimeoutError::Operation(err)) => Err(err),
        }
    }
}
