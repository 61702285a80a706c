//! Runtime settings for AIP endpoints.
//!
//! [`AipSettings`] groups the knobs an endpoint needs: heartbeat cadence,
//! reconnection backoff, operation deadlines and socket parameters. Settings
//! come from a TOML file, from `AIP_*` environment variables, or both (the
//! environment wins). Every duration is written in seconds.

#![warn(missing_docs, clippy::pedantic)]

mod env;
mod error;
mod schema;

pub use env::ENV_PREFIX;
pub use error::{ConfigError, ConfigResult};
pub use schema::{AipSettings, HeartbeatSettings, ReconnectionSettings, TimeoutSettings, TransportSettings};
