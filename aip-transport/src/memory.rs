//! In-process transport pair.

use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, watch};

use crate::{Frame, Transport, TransportError, TransportResult, TransportState};

/// One end of a connected in-memory transport pair.
///
/// Frames sent on one end arrive in order on the other. Closing either end
/// makes the peer's pending and future receives fail with
/// [`TransportError::ConnectionClosed`].
#[derive(Debug)]
pub struct MemoryTransport {
    outbound: Mutex<Option<mpsc::UnboundedSender<Frame>>>,
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<Frame>>,
    state: watch::Sender<TransportState>,
}

impl MemoryTransport {
    /// Creates two connected ends.
    #[must_use]
    pub fn pair() -> (Self, Self) {
        let (left_tx, right_rx) = mpsc::unbounded_channel();
        let (right_tx, left_rx) = mpsc::unbounded_channel();
        (Self::end(left_tx, left_rx), Self::end(right_tx, right_rx))
    }

    fn end(outbound: mpsc::UnboundedSender<Frame>, inbound: mpsc::UnboundedReceiver<Frame>) -> Self {
        let (state, _) = watch::channel(TransportState::Connected);
        Self {
            outbound: Mutex::new(Some(outbound)),
            inbound: tokio::sync::Mutex::new(inbound),
            state,
        }
    }

    /// Returns the next queued frame without waiting, if one is available and
    /// no other task is receiving.
    #[must_use]
    pub fn try_receive(&self) -> Option<Frame> {
        self.inbound.try_lock().ok()?.try_recv().ok()
    }

    fn push(&self, frame: Frame) -> TransportResult<()> {
        if self.state() != TransportState::Connected {
            return Err(TransportError::NotConnected);
        }
        let guard = self.outbound.lock().unwrap_or_else(PoisonError::into_inner);
        let sender = guard.as_ref().ok_or(TransportError::NotConnected)?;
        sender.send(frame).map_err(|_| {
            self.state.send_replace(TransportState::Disconnected);
            TransportError::closed("peer dropped")
        })
    }

    async fn pull(&self) -> TransportResult<Frame> {
        if self.state() != TransportState::Connected {
            return Err(TransportError::NotConnected);
        }
        let mut closed = self.state.subscribe();
        let mut inbound = self.inbound.lock().await;
        tokio::select! {
            frame = inbound.recv() => frame.ok_or_else(|| {
                self.state.send_replace(TransportState::Disconnected);
                TransportError::closed("peer closed")
            }),
            _ = closed.wait_for(|state| *state != TransportState::Connected) => {
                Err(TransportError::closed("transport closed locally"))
            }
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self, _url: &str) -> TransportResult<()> {
        if self.is_connected() {
            return Ok(());
        }
        Err(TransportError::Unsupported {
            operation: "reconnect",
            transport: "in-memory",
        })
    }

    async fn send(&self, text: &str) -> TransportResult<()> {
        self.push(Frame::Text(text.to_owned()))
    }

    async fn receive(&self) -> TransportResult<String> {
        crate::frame_to_text(self.pull().await?)
    }

    async fn send_binary(&self, data: Bytes) -> TransportResult<()> {
        self.push(Frame::Binary(data))
    }

    async fn receive_binary(&self) -> TransportResult<Bytes> {
        Ok(self.pull().await?.into_bytes())
    }

    async fn receive_auto(&self) -> TransportResult<Frame> {
        self.pull().await
    }

    async fn close(&self) -> TransportResult<()> {
        self.outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.state.send_replace(TransportState::Disconnected);
        Ok(())
    }

    async fn wait_closed(&self) {
        let mut state = self.state.subscribe();
        let _ = state.wait_for(|state| state.is_closed()).await;
    }

    fn state(&self) -> TransportState {
        *self.state.borrow()
    }
}
