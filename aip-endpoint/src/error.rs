use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use aip_config::ConfigError;
use aip_protocol::ProtocolError;
use aip_resilience::TimeoutError;
use aip_transport::TransportError;
use thiserror::Error;

use crate::{EndpointState, LifecycleError};

/// Result alias for endpoint operations.
pub type EndpointResult<T> = Result<T, EndpointError>;

/// Errors surfaced by endpoints.
#[derive(Debug, Error)]
pub enum EndpointError {
    /// A lifecycle transition was rejected.
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    /// The protocol layer failed.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The transport failed outside any protocol call.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Endpoint configuration could not be derived from settings.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Endpoint configuration was invalid.
    #[error("invalid endpoint configuration: {0}")]
    InvalidConfig(&'static str),

    /// An operation missed its deadline.
    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        /// Operation that expired.
        operation: String,
        /// Deadline that was exceeded.
        timeout: Duration,
    },

    /// No live link exists to the addressed peer.
    #[error("not connected to `{target}`")]
    NotConnected {
        /// Peer that was addressed.
        target: String,
    },

    /// The endpoint must be running for this operation.
    #[error("endpoint `{endpoint}` is {state}, not running")]
    NotRunning {
        /// Endpoint label.
        endpoint: String,
        /// State the endpoint was in.
        state: EndpointState,
    },

    /// The server refused or never answered a registration.
    #[error("registration of `{client_id}` failed: {reason}")]
    Registration {
        /// Client that tried to register.
        client_id: String,
        /// Reason reported by the registration handshake.
        reason: String,
    },

    /// Every reconnection attempt failed.
    #[error("could not reconnect `{device_id}` after {attempts} attempts")]
    ReconnectionExhausted {
        /// Device whose link was lost.
        device_id: String,
        /// Attempts made.
        attempts: u32,
    },

    /// A message was addressed to a client the server does not know.
    #[error("client `{client_id}` is not registered")]
    UnknownClient {
        /// Client that was addressed.
        client_id: String,
    },

    /// Binding the listener failed.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Requested address.
        addr: SocketAddr,
        /// Underlying failure.
        #[source]
        source: io::Error,
    },

    /// The session scheduler no longer accepts work.
    #[error("session scheduler is closed")]
    SchedulerClosed,

    /// The inbound tap closed while a receiver was waiting.
    #[error("inbound message stream closed")]
    TapClosed,
}

impl<E: Into<EndpointError>> From<TimeoutError<E>> for EndpointError {
    fn from(err: TimeoutError<E>) -> Self {
        match err {
            TimeoutError::Elapsed { operation, timeout } => Self::Timeout { operation, timeout },
            TimeoutError::Operation(err) => err.into(),
        }
    }
}

impl EndpointError {
    /// Returns `true` when the error means a link is gone.
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        match self {
            Self::Protocol(err) => err.is_connection_error(),
            Self::Transport(err) => err.is_connection_closed(),
            Self::NotConnected { .. } => true,
            _ => false,
        }
    }
}
