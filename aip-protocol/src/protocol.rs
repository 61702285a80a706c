//! Base protocol shared by every sub-protocol.

use std::any::type_name;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use aip_extensions::{AipExtension, ExtensionChain};
use aip_primitives::{ClientMessage, ClientMessageType, ServerMessage, ServerMessageType, WireMessage};
use aip_transport::Transport;
use bytes::Bytes;
use tracing::{debug, trace};

use crate::pending::PendingRequests;
use crate::{ProtocolError, ProtocolResult};

/// Builder for [`AipProtocol`] instances.
pub struct ProtocolBuilder {
    transport: Arc<dyn Transport>,
    peer: String,
    extensions: ExtensionChain,
}

impl ProtocolBuilder {
    /// Starts a builder over the supplied transport.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            peer: "peer".to_owned(),
            extensions: ExtensionChain::default(),
        }
    }

    /// Sets the label identifying the remote side in logs and extension hooks.
    #[must_use]
    pub fn peer(mut self, peer: impl Into<String>) -> Self {
        self.peer = peer.into();
        self
    }

    /// Installs the extension chain.
    #[must_use]
    pub fn extensions(mut self, extensions: ExtensionChain) -> Self {
        self.extensions = extensions;
        self
    }

    /// Builds the protocol. Extensions are told about the connection when the
    /// transport is already connected.
    #[must_use]
    pub fn build(self) -> AipProtocol {
        let protocol = AipProtocol {
            inner: Arc::new(Inner {
                transport: self.transport,
                peer: self.peer,
                extensions: self.extensions,
                replies: PendingRequests::new(),
                results: PendingRequests::new(),
                closed: AtomicBool::new(false),
            }),
        };
        if protocol.is_connected() {
            let _ = protocol.inner.extensions.on_connection_established(protocol.peer());
        }
        protocol
    }
}

struct Inner {
    transport: Arc<dyn Transport>,
    peer: String,
    extensions: ExtensionChain,
    replies: PendingRequests<ServerMessage>,
    results: PendingRequests<ClientMessage>,
    closed: AtomicBool,
}

/// Typed messaging over one transport.
///
/// Cloning is cheap and every clone shares the transport and both pending
/// tables, so several sub-protocols can be layered over one connection.
/// Replies are matched by correlation id: client-side requests wait in
/// [`replies`](Self::replies), server-side command batches in
/// [`results`](Self::results).
#[derive(Clone)]
pub struct AipProtocol {
    inner: Arc<Inner>,
}

impl fmt::Debug for AipProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AipProtocol")
            .field("peer", &self.inner.peer)
            .field("state", &self.inner.transport.state())
            .field("pending_replies", &self.inner.replies.len())
            .field("pending_results", &self.inner.results.len())
            .field("extensions", &self.inner.extensions)
            .finish()
    }
}

impl AipProtocol {
    /// Creates a protocol with no extensions.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::builder(transport).build()
    }

    /// Creates a builder.
    #[must_use]
    pub fn builder(transport: Arc<dyn Transport>) -> ProtocolBuilder {
        ProtocolBuilder::new(transport)
    }

    /// Returns the underlying transport.
    #[must_use]
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.inner.transport
    }

    /// Returns the peer label.
    #[must_use]
    pub fn peer(&self) -> &str {
        &self.inner.peer
    }

    /// Returns the installed extensions.
    #[must_use]
    pub fn extensions(&self) -> &ExtensionChain {
        &self.inner.extensions
    }

    /// Requests awaiting a server reply, keyed by `request_id`.
    #[must_use]
    pub fn replies(&self) -> &PendingRequests<ServerMessage> {
        &self.inner.replies
    }

    /// Command batches awaiting results, keyed by `response_id`.
    #[must_use]
    pub fn results(&self) -> &PendingRequests<ClientMessage> {
        &self.inner.results
    }

    /// Returns `true` when both handles share one underlying connection.
    #[must_use]
    pub fn same_connection(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Returns `true` while the transport is connected.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.transport.is_connected()
    }

    /// Encodes and sends one message.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Encode`] or [`ProtocolError::Transport`].
    pub async fn send_message<M: WireMessage>(&self, message: &M) -> ProtocolResult<()> {
        let envelope = message.envelope();
        let text = message.to_json().map_err(|err| ProtocolError::Encode {
            message_type: envelope.type_name(),
            reason: err.to_string(),
        })?;

        if let Err(err) = self.inner.transport.send(&text).await {
            let err = ProtocolError::from(err);
            self.report(&err);
            return Err(err);
        }
        trace!(peer = %self.inner.peer, message_type = envelope.type_name(), "message sent");
        let _ = self.inner.extensions.on_message_sent(&self.inner.peer, envelope);
        Ok(())
    }

    /// Waits for the next frame and decodes it as `M`.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Transport`] when the connection fails and
    /// [`ProtocolError::Decode`] when the frame is not a valid `M`.
    pub async fn receive_message<M: WireMessage>(&self) -> ProtocolResult<M> {
        let text = match self.inner.transport.receive().await {
            Ok(text) => text,
            Err(err) => {
                let err = ProtocolError::from(err);
                self.report(&err);
                return Err(err);
            }
        };
        match M::from_json(&text) {
            Ok(message) => {
                let _ = self
                    .inner
                    .extensions
                    .on_message_received(&self.inner.peer, message.envelope());
                Ok(message)
            }
            Err(err) => {
                let err = ProtocolError::Decode {
                    expected: short_type_name::<M>(),
                    reason: err.to_string(),
                };
                self.report(&err);
                Err(err)
            }
        }
    }

    /// Sends a raw binary frame outside the JSON control channel.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Transport`] on failure.
    pub async fn send_binary(&self, data: Bytes) -> ProtocolResult<()> {
        Ok(self.inner.transport.send_binary(data).await?)
    }

    /// Waits for the next frame and returns its raw bytes.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Transport`] on failure.
    pub async fn receive_binary(&self) -> ProtocolResult<Bytes> {
        Ok(self.inner.transport.receive_binary().await?)
    }

    /// Resolves the pending request a server message answers.
    ///
    /// Returns `true` if a waiter consumed the message.
    pub fn route_reply(&self, message: &ServerMessage) -> bool {
        if message.kind == ServerMessageType::Command {
            return false;
        }
        let Some(id) = &message.response_id else {
            return false;
        };
        self.inner.replies.resolve(id, message.clone())
    }

    /// Resolves the pending command batch a client message answers.
    ///
    /// Returns `true` if a waiter consumed the message.
    pub fn route_result(&self, message: &ClientMessage) -> bool {
        if !matches!(
            message.kind,
            ClientMessageType::CommandResults | ClientMessageType::Error
        ) {
            return false;
        }
        let Some(id) = &message.prev_response_id else {
            return false;
        };
        self.inner.results.resolve(id, message.clone())
    }

    /// Fails every pending request in both tables.
    pub fn fail_pending(&self, reason: &str) -> usize {
        self.inner.replies.fail_all(reason) + self.inner.results.fail_all(reason)
    }

    /// Fails pending requests and closes the transport. Repeated calls only
    /// re-close the (idempotent) transport.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Transport`] when closing fails.
    pub async fn close(&self) -> ProtocolResult<()> {
        let first = !self.inner.closed.swap(true, Ordering::AcqRel);
        if first {
            let failed = self.fail_pending("protocol closed");
            debug!(peer = %self.inner.peer, failed, "closing protocol");
        }
        self.inner.transport.close().await?;
        if first {
            let _ = self.inner.extensions.on_connection_closed(&self.inner.peer);
        }
        Ok(())
    }

    pub(crate) fn report(&self, err: &ProtocolError) {
        let _ = self.inner.extensions.on_error(&self.inner.peer, err);
    }
}

fn short_type_name<M>() -> &'static str {
    let full = type_name::<M>();
    full.rsplit("::").next().unwrap_or(full)
}

/// Declares a sub-protocol newtype that dereferences to [`AipProtocol`].
macro_rules! sub_protocol {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone)]
        pub struct $name {
            protocol: $crate::AipProtocol,
        }

        impl $name {
            /// Layers this sub-protocol over an existing protocol.
            #[must_use]
            pub fn new(protocol: $crate::AipProtocol) -> Self {
                Self { protocol }
            }

            /// Returns the shared base protocol.
            #[must_use]
            pub fn protocol(&self) -> &$crate::AipProtocol {
                &self.protocol
            }
        }

        impl ::std::ops::Deref for $name {
            type Target = $crate::AipProtocol;

            fn deref(&self) -> &Self::Target {
                &self.protocol
            }
        }

        impl From<$crate::AipProtocol> for $name {
            fn from(protocol: $crate::AipProtocol) -> Self {
                Self::new(protocol)
            }
        }
    };
}

pub(crate) use sub_protocol;
