use std::time::Duration;

use aip_primitives::CorrelationId;
use aip_transport::TransportError;
use thiserror::Error;

/// Result alias for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors surfaced by the protocol layer.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The transport failed underneath the protocol.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A frame did not decode into the expected message type.
    #[error("failed to decode {expected}: {reason}")]
    Decode {
        /// Message type the caller expected.
        expected: &'static str,
        /// Decoder failure.
        reason: String,
    },

    /// A message could not be encoded.
    #[error("failed to encode {message_type} message: {reason}")]
    Encode {
        /// Wire name of the message type.
        message_type: &'static str,
        /// Encoder failure.
        reason: String,
    },

    /// A request was registered under an id that is still pending.
    #[error("correlation id `{id}` is already pending")]
    DuplicateCorrelation {
        /// Offending identifier.
        id: CorrelationId,
    },

    /// A pending request was failed before a reply arrived.
    #[error("request cancelled: {reason}")]
    Cancelled {
        /// Why the request was abandoned.
        reason: String,
    },

    /// An operation missed its deadline.
    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        /// Operation that expired.
        operation: String,
        /// Deadline that was exceeded.
        timeout: Duration,
    },

    /// The peer answered with an error status.
    #[error("peer reported an error: {error}")]
    Remote {
        /// Error text sent by the peer.
        error: String,
    },

    /// A message failed validation.
    #[error("invalid {message_type} message: {reason}")]
    Invalid {
        /// Wire name of the message type.
        message_type: &'static str,
        /// Missing or malformed field.
        reason: &'static str,
    },
}

impl ProtocolError {
    /// Convenience helper to construct cancellation errors.
    #[must_use]
    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::Cancelled {
            reason: reason.into(),
        }
    }

    /// Returns `true` when the error means the connection is gone.
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Self::Transport(err) if err.is_connection_closed())
    }
}
