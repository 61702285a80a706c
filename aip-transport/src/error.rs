//! Transport error type.

use std::io;

use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Result alias for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Errors surfaced by transports.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The peer closed the connection, or it was never opened. Recoverable by
    /// reconnecting.
    #[error("connection closed: {reason}")]
    ConnectionClosed {
        /// What ended the connection.
        reason: String,
    },

    /// Operation attempted while no connection is open.
    #[error("transport is not connected")]
    NotConnected,

    /// Transient I/O failure on an otherwise open socket.
    #[error("transport I/O error: {source}")]
    Io {
        /// Underlying I/O failure.
        #[from]
        source: io::Error,
    },

    /// Opening the connection failed.
    #[error("failed to connect to {url}: {reason}")]
    Connect {
        /// Address that was dialled.
        url: String,
        /// Failure description.
        reason: String,
    },

    /// A frame exceeded the configured size limit.
    #[error("frame too large: {reason}")]
    MessageTooLarge {
        /// Failure description.
        reason: String,
    },

    /// The peer violated the WebSocket protocol.
    #[error("websocket protocol error: {reason}")]
    Protocol {
        /// Failure description.
        reason: String,
    },

    /// A frame of the wrong type arrived.
    #[error("expected a {expected} frame, received {found}")]
    UnexpectedFrame {
        /// Frame type the caller asked for.
        expected: &'static str,
        /// Frame type that arrived.
        found: &'static str,
    },

    /// The transport cannot perform the requested operation.
    #[error("{operation} is not supported by a {transport} transport")]
    Unsupported {
        /// Rejected operation.
        operation: &'static str,
        /// Transport flavour.
        transport: &'static str,
    },
}

impl TransportError {
    /// Creates a connection-closed error.
    #[must_use]
    pub fn closed(reason: impl Into<String>) -> Self {
        Self::ConnectionClosed {
            reason: reason.into(),
        }
    }

    /// Returns `true` when the connection is gone, as opposed to a transient
    /// failure on a live connection.
    #[must_use]
    pub fn is_connection_closed(&self) -> bool {
        matches!(self, Self::ConnectionClosed { .. } | Self::NotConnected)
    }
}

impl From<tungstenite::Error> for TransportError {
    fn from(err: tungstenite::Error) -> Self {
        use tungstenite::error::ProtocolError;

        match err {
            tungstenite::Error::ConnectionClosed => Self::closed("closed by peer"),
            tungstenite::Error::AlreadyClosed => Self::closed("already closed"),
            tungstenite::Error::Io(source) => match source.kind() {
                io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::BrokenPipe
                | io::ErrorKind::NotConnected
                | io::ErrorKind::UnexpectedEof => Self::closed(source.to_string()),
                _ => Self::Io { source },
            },
            tungstenite::Error::Capacity(reason) => Self::MessageTooLarge {
                reason: reason.to_string(),
            },
            tungstenite::Error::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                Self::closed("reset without closing handshake")
            }
            other => Self::Protocol {
                reason: other.to_string(),
            },
        }
    }
}
