//! Agent Interaction Protocol runtime facade.
//!
//! Depend on this crate via `cargo add aip-agents`. It bundles the runtime
//! crates behind feature flags so downstream users can pull in only the
//! layers their devices, servers or constellations need.

#![warn(missing_docs, clippy::pedantic)]

/// Message model, identifiers and background tasks.
pub use aip_primitives as primitives;

/// WebSocket and in-memory transports (enabled by `transport` feature).
#[cfg(feature = "transport")]
pub use aip_transport as transport;

/// Message interception hooks (enabled by `extensions` feature).
#[cfg(feature = "extensions")]
pub use aip_extensions as extensions;

/// Request/reply protocols over a transport (enabled by `protocol` feature).
#[cfg(feature = "protocol")]
pub use aip_protocol as protocol;

/// Reconnection, heartbeats and deadlines (enabled by `resilience` feature).
#[cfg(feature = "resilience")]
pub use aip_resilience as resilience;

/// Device, server and constellation endpoints (enabled by `endpoint` feature).
#[cfg(feature = "endpoint")]
pub use aip_endpoint as endpoint;

/// File and environment settings (enabled by `config` feature).
#[cfg(feature = "config")]
pub use aip_config as config;

/// Tracing subscriber setup (enabled by `telemetry` feature).
#[cfg(feature = "telemetry")]
pub use aip_telemetry as telemetry;
