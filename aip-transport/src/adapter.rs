//! Socket adapters hiding which side opened a WebSocket connection.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, trace};

use crate::{Frame, TransportError, TransportResult};

/// Which side initiated the underlying connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdapterKind {
    /// Socket accepted by a listening server.
    ServerAccepted,
    /// Socket dialled by a client.
    ClientInitiated,
}

impl fmt::Display for AdapterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ServerAccepted => f.write_str("server-accepted"),
            Self::ClientInitiated => f.write_str("client-initiated"),
        }
    }
}

/// Minimal socket capability a transport delegates to.
#[async_trait]
pub trait SocketAdapter: Send + Sync {
    /// Returns which side opened the socket.
    fn kind(&self) -> AdapterKind;

    /// Writes one data frame.
    async fn send_frame(&self, frame: Frame) -> TransportResult<()>;

    /// Writes a keepalive ping.
    async fn send_ping(&self) -> TransportResult<()>;

    /// Reads the next data frame, absorbing control frames.
    async fn recv_frame(&self) -> TransportResult<Frame>;

    /// Starts the closing handshake, giving up after `timeout`.
    async fn close(&self, timeout: Duration) -> TransportResult<()>;

    /// Returns `true` until the socket is closed from either side.
    fn is_open(&self) -> bool;

    /// Returns how long ago any frame, control frames included, was received.
    fn idle_for(&self) -> Duration;
}

/// [`SocketAdapter`] over a `tokio-tungstenite` stream.
///
/// The sink and the stream are locked independently so a blocked reader never
/// delays a writer.
pub struct TungsteniteAdapter<S> {
    kind: AdapterKind,
    sink: Mutex<SplitSink<WebSocketStream<S>, Message>>,
    stream: Mutex<SplitStream<WebSocketStream<S>>>,
    open: AtomicBool,
    epoch: Instant,
    last_seen_ms: AtomicU64,
}

impl<S> fmt::Debug for TungsteniteAdapter<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TungsteniteAdapter")
            .field("kind", &self.kind)
            .field("open", &self.open.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl<S> TungsteniteAdapter<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Wraps an established WebSocket stream.
    #[must_use]
    pub fn new(kind: AdapterKind, socket: WebSocketStream<S>) -> Self {
        let (sink, stream) = socket.split();
        Self {
            kind,
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
            open: AtomicBool::new(true),
            epoch: Instant::now(),
            last_seen_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let elapsed = u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.last_seen_ms.store(elapsed, Ordering::Release);
    }

    fn mark_closed(&self) {
        self.open.store(false, Ordering::Release);
    }

    async fn write(&self, message: Message) -> TransportResult<()> {
        if !self.is_open() {
            return Err(TransportError::closed("socket already closed"));
        }
        let mut sink = self.sink.lock().await;
        sink.send(message).await.map_err(|err| {
            let err = TransportError::from(err);
            if err.is_connection_closed() {
                self.mark_closed();
            }
            err
        })
    }
}

#[async_trait]
impl<S> SocketAdapter for TungsteniteAdapter<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn kind(&self) -> AdapterKind {
        self.kind
    }

    async fn send_frame(&self, frame: Frame) -> TransportResult<()> {
        let message = match frame {
            Frame::Text(text) => Message::text(text),
            Frame::Binary(data) => Message::binary(data),
        };
        self.write(message).await
    }

    async fn send_ping(&self) -> TransportResult<()> {
        self.write(Message::Ping(Bytes::new())).await
    }

    async fn recv_frame(&self) -> TransportResult<Frame> {
        let mut stream = self.stream.lock().await;
        loop {
            let Some(next) = stream.next().await else {
                self.mark_closed();
                return Err(TransportError::closed("stream ended"));
            };
            let message = match next {
                Ok(message) => message,
                Err(err) => {
                    let err = TransportError::from(err);
                    if err.is_connection_closed() {
                        self.mark_closed();
                    }
                    return Err(err);
                }
            };
            self.touch();
            match message {
                Message::Text(text) => return Ok(Frame::Text(text.as_str().to_owned())),
                Message::Binary(data) => return Ok(Frame::Binary(data)),
                Message::Close(close) => {
                    debug!(kind = %self.kind, ?close, "peer sent close frame");
                    self.mark_closed();
                    return Err(TransportError::closed("closed by peer"));
                }
                // tungstenite answers pings itself.
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {
                    trace!(kind = %self.kind, "control frame received");
                }
            }
        }
    }

    async fn close(&self, timeout: Duration) -> TransportResult<()> {
        if !self.open.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let mut sink = self.sink.lock().await;
        match tokio::time::timeout(timeout, sink.close()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => match TransportError::from(err) {
                err if err.is_connection_closed() => Ok(()),
                err => Err(err),
            },
            Err(_) => {
                debug!(kind = %self.kind, ?timeout, "close handshake timed out");
                Ok(())
            }
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn idle_for(&self) -> Duration {
        let last_seen = Duration::from_millis(self.last_seen_ms.load(Ordering::Acquire));
        self.epoch.elapsed().saturating_sub(last_seen)
    }
}
