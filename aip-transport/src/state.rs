//! Connection states a transport moves through.

use std::fmt;

/// Connection lifecycle of a transport.
///
/// `Disconnected → Connecting → Connected → (Disconnecting → Disconnected | Error)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportState {
    /// No socket is open.
    Disconnected,
    /// Opening handshake in progress.
    Connecting,
    /// Frames can be exchanged.
    Connected,
    /// Closing handshake in progress.
    Disconnecting,
    /// The socket failed; it must be closed and reopened.
    Error,
}

impl TransportState {
    /// Returns `true` for states in which the connection cannot carry frames.
    #[must_use]
    pub const fn is_closed(self) -> bool {
        matches!(self, Self::Disconnected | Self::Error)
    }
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnecting => "disconnecting",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}
