//! Broadcast of inbound messages to ad-hoc receivers.

use std::time::Duration;

use aip_primitives::{ClientMessage, ClientMessageType, ServerMessage, ServerMessageType};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, trace};

use crate::{EndpointError, EndpointResult};

/// Messages whose type can be matched by [`InboundTap::wait_for_kind`].
pub trait InboundKind: Clone + Send + 'static {
    /// Message type enumeration.
    type Kind: Copy + PartialEq + std::fmt::Debug + Send + Sync;

    /// Returns the message type.
    fn kind(&self) -> Self::Kind;
}

impl InboundKind for ClientMessage {
    type Kind = ClientMessageType;

    fn kind(&self) -> ClientMessageType {
        self.kind
    }
}

impl InboundKind for ServerMessage {
    type Kind = ServerMessageType;

    fn kind(&self) -> ServerMessageType {
        self.kind
    }
}

/// Copy of every message the receive loop takes off the socket.
///
/// Receivers subscribe instead of reading the transport, so they never race
/// the loop. Only messages published after subscribing are seen.
#[derive(Debug)]
pub struct InboundTap<M> {
    sender: broadcast::Sender<M>,
}

impl<M: InboundKind> InboundTap<M> {
    /// Creates a tap buffering up to `capacity` messages per subscriber.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publishes a message. Without subscribers the message is dropped.
    pub fn publish(&self, message: &M) {
        if self.sender.receiver_count() > 0 {
            let _ = self.sender.send(message.clone());
        }
    }

    /// Subscribes to messages published from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<M> {
        self.sender.subscribe()
    }

    /// Waits up to `timeout` for a message of type `kind`.
    ///
    /// # Errors
    ///
    /// Returns [`EndpointError::Timeout`] when nothing matches in time.
    pub async fn wait_for_kind(&self, kind: M::Kind, timeout: Duration) -> EndpointResult<M> {
        Self::wait_on(self.subscribe(), |message: &M| message.kind() == kind, timeout).await
    }

    /// Waits on an existing subscription for the first message matching
    /// `predicate`. Subscribe before triggering the reply to avoid missing it.
    ///
    /// # Errors
    ///
    /// Returns [`EndpointError::Timeout`] when nothing matches in time, or
    /// [`EndpointError::TapClosed`] when the tap is dropped.
    pub async fn wait_on(
        mut receiver: broadcast::Receiver<M>,
        predicate: impl Fn(&M) -> bool + Send,
        timeout: Duration,
    ) -> EndpointResult<M> {
        let wait = async {
            loop {
                match receiver.recv().await {
                    Ok(message) if predicate(&message) => return Ok(message),
                    Ok(message) => trace!(kind = ?message.kind(), "tap message skipped"),
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(skipped, "tap receiver lagged");
                    }
                    Err(RecvError::Closed) => return Err(EndpointError::TapClosed),
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .unwrap_or_else(|_| {
                Err(EndpointError::Timeout {
                    operation: "receive".into(),
                    timeout,
                })
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aip_primitives::ClientType;

    #[tokio::test]
    async fn waits_for_the_requested_kind() {
        let tap = InboundTap::<ClientMessage>::new(8);
        let receiver = tap.subscribe();
        tap.publish(&ClientMessage::new(ClientMessageType::Heartbeat, "dev1", ClientType::Device));
        tap.publish(&ClientMessage::new(ClientMessageType::Task, "dev1", ClientType::Device));

        let message = InboundTap::wait_on(
            receiver,
            |m: &ClientMessage| m.kind == ClientMessageType::Task,
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        assert_eq!(message.kind, ClientMessageType::Task);
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_without_a_match() {
        let tap = InboundTap::<ServerMessage>::new(8);
        let err = tap
            .wait_for_kind(ServerMessageType::TaskEnd, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, EndpointError::Timeout { .. }));
    }
}
