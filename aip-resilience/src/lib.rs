//! Resilience building blocks shared by AIP endpoints.
//!
//! - [`ReconnectionStrategy`] computes backoff delays and drives the
//!   cancel, notify, reconnect sequence that follows a lost connection.
//! - [`HeartbeatManager`] keeps one heartbeat loop per client id.
//! - [`TimeoutManager`] puts a deadline on any fallible future.
//!
//! Endpoints plug into the strategy by implementing [`DeviceRecovery`].

#![warn(missing_docs, clippy::pedantic)]

mod error;
mod heartbeat;
mod reconnect;
mod recovery;
mod timeout;

pub use error::{RecoveryError, ResilienceError, ResilienceResult};
pub use heartbeat::HeartbeatManager;
pub use reconnect::{ReconnectResult, ReconnectionConfig, ReconnectionPolicy, ReconnectionStrategy};
pub use recovery::DeviceRecovery;
pub use timeout::{DEFAULT_OPERATION_TIMEOUT, TimeoutError, TimeoutManager};
