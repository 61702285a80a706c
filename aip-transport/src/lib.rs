//! Frame transports for the Agent Interaction Protocol.
//!
//! A [`Transport`] moves whole text or binary frames over one long-lived
//! connection. Upper layers never see which socket library sits underneath:
//! [`WebSocketTransport`] hides server-accepted and client-initiated sockets
//! behind a [`SocketAdapter`], and [`MemoryTransport`] provides an in-process
//! pair with identical semantics.

#![warn(missing_docs, clippy::pedantic)]

mod adapter;
mod config;
mod error;
mod frame;
mod memory;
mod state;
mod websocket;

use async_trait::async_trait;
use bytes::Bytes;

pub use adapter::{AdapterKind, SocketAdapter, TungsteniteAdapter};
pub use config::TransportConfig;
pub use error::{TransportError, TransportResult};
pub use frame::Frame;
pub use memory::MemoryTransport;
pub use state::TransportState;
pub use websocket::WebSocketTransport;

/// Duplex frame channel over a single connection.
///
/// Sends are serialized internally, so several tasks may share one transport.
/// Only one task should drive the receive side at a time.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Opens the connection.
    async fn connect(&self, url: &str) -> TransportResult<()>;

    /// Sends one text frame.
    async fn send(&self, text: &str) -> TransportResult<()>;

    /// Waits for the next text frame. A binary frame holding valid UTF-8 is
    /// accepted as text.
    async fn receive(&self) -> TransportResult<String>;

    /// Sends one binary frame.
    async fn send_binary(&self, data: Bytes) -> TransportResult<()>;

    /// Waits for the next frame and returns its raw bytes.
    async fn receive_binary(&self) -> TransportResult<Bytes>;

    /// Waits for the next frame, whatever its type.
    async fn receive_auto(&self) -> TransportResult<Frame>;

    /// Closes the connection. Calling it again is a no-op.
    async fn close(&self) -> TransportResult<()>;

    /// Resolves once the connection is no longer usable.
    async fn wait_closed(&self);

    /// Returns the current connection state.
    fn state(&self) -> TransportState;

    /// Returns `true` while frames can be exchanged.
    fn is_connected(&self) -> bool {
        self.state() == TransportState::Connected
    }
}

pub(crate) fn frame_to_text(frame: Frame) -> TransportResult<String> {
    match frame {
        Frame::Text(text) => Ok(text),
        Frame::Binary(data) => String::from_utf8(data.to_vec()).map_err(|_| {
            TransportError::UnexpectedFrame {
                expected: "text",
                found: "binary",
            }
        }),
    }
}
