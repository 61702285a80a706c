//! Shared error definitions for AIP primitives.

use thiserror::Error;

/// Result alias used throughout the primitives crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while manipulating primitive protocol types.
#[derive(Debug, Error)]
pub enum Error {
    /// The provided correlation identifier was empty or whitespace.
    #[error("invalid correlation id `{id}`: {reason}")]
    InvalidCorrelationId {
        /// The offending identifier string.
        id: String,
        /// Human-readable reason for rejection.
        reason: &'static str,
    },

    /// A message could not be encoded to or decoded from JSON.
    #[error("message serialization failed: {source}")]
    Serialization {
        /// Underlying `serde_json` failure.
        #[from]
        source: serde_json::Error,
    },
}
