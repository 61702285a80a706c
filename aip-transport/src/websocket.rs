//! WebSocket transport over `tokio-tungstenite`.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use aip_primitives::BackgroundTask;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::adapter::{AdapterKind, SocketAdapter, TungsteniteAdapter};
use crate::{Frame, Transport, TransportConfig, TransportError, TransportResult, TransportState};

/// WebSocket-backed [`Transport`].
///
/// The socket flavour is fixed at construction: [`WebSocketTransport::client`]
/// dials out with [`connect`](Transport::connect), while
/// [`WebSocketTransport::accept`] wraps a socket a listener accepted and can
/// never dial.
pub struct WebSocketTransport {
    origin: AdapterKind,
    config: TransportConfig,
    adapter: RwLock<Option<Arc<dyn SocketAdapter>>>,
    state: Arc<watch::Sender<TransportState>>,
    keepalive: Mutex<Option<BackgroundTask>>,
}

impl fmt::Debug for WebSocketTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocketTransport")
            .field("origin", &self.origin)
            .field("state", &*self.state.borrow())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl WebSocketTransport {
    /// Creates a disconnected client transport.
    #[must_use]
    pub fn client(config: TransportConfig) -> Self {
        Self::with_origin(AdapterKind::ClientInitiated, config)
    }

    /// Performs the server side of the WebSocket handshake on an accepted
    /// stream.
    ///
    /// # Errors
    ///
    /// Returns a [`TransportError`] when the handshake fails or does not finish
    /// within the open timeout.
    pub async fn accept<S>(stream: S, config: TransportConfig) -> TransportResult<Self>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let transport = Self::with_origin(AdapterKind::ServerAccepted, config);
        transport.set_state(TransportState::Connecting);
        let handshake = tokio_tungstenite::accept_async_with_config(
            stream,
            Some(config.websocket_config()),
        );
        let socket = match tokio::time::timeout(config.open_timeout(), handshake).await {
            Ok(Ok(socket)) => socket,
            Ok(Err(err)) => {
                transport.set_state(TransportState::Error);
                return Err(err.into());
            }
            Err(_) => {
                transport.set_state(TransportState::Error);
                return Err(TransportError::closed("websocket handshake timed out"));
            }
        };
        transport.install(Arc::new(TungsteniteAdapter::new(
            AdapterKind::ServerAccepted,
            socket,
        )));
        Ok(transport)
    }

    /// Wraps an already established socket adapter.
    #[must_use]
    pub fn from_adapter(adapter: Arc<dyn SocketAdapter>, config: TransportConfig) -> Self {
        let transport = Self::with_origin(adapter.kind(), config);
        transport.install(adapter);
        transport
    }

    fn with_origin(origin: AdapterKind, config: TransportConfig) -> Self {
        let (state, _) = watch::channel(TransportState::Disconnected);
        Self {
            origin,
            config,
            adapter: RwLock::new(None),
            state: Arc::new(state),
            keepalive: Mutex::new(None),
        }
    }

    /// Returns which side opened the socket.
    #[must_use]
    pub const fn origin(&self) -> AdapterKind {
        self.origin
    }

    /// Returns the transport configuration.
    #[must_use]
    pub const fn config(&self) -> &TransportConfig {
        &self.config
    }

    fn set_state(&self, next: TransportState) {
        self.state.send_if_modified(|state| {
            if *state == next {
                return false;
            }
            debug!(origin = %self.origin, from = %state, to = %next, "transport state change");
            *state = next;
            true
        });
    }

    fn install(&self, adapter: Arc<dyn SocketAdapter>) {
        *self.adapter.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&adapter));
        self.set_state(TransportState::Connected);

        if self.config.ping_interval().is_zero() {
            return;
        }
        let state = Arc::clone(&self.state);
        let config = self.config;
        let task = BackgroundTask::spawn("websocket-keepalive", move |stop| {
            run_keepalive(adapter, state, config, stop)
        });
        let previous = self
            .keepalive
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(task);
        drop(previous);
    }

    fn adapter(&self) -> TransportResult<Arc<dyn SocketAdapter>> {
        if self.state() != TransportState::Connected {
            return Err(TransportError::NotConnected);
        }
        self.adapter
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(TransportError::NotConnected)
    }

    fn note_failure(&self, err: &TransportError) {
        if err.is_connection_closed() {
            self.set_state(TransportState::Disconnected);
        } else if !matches!(err, TransportError::MessageTooLarge { .. }) {
            self.set_state(TransportState::Error);
        }
    }

    async fn send_frame(&self, frame: Frame) -> TransportResult<()> {
        if frame.len() > self.config.max_size() {
            return Err(TransportError::MessageTooLarge {
                reason: format!(
                    "{} byte {} frame exceeds the {} byte limit",
                    frame.len(),
                    frame.kind(),
                    self.config.max_size()
                ),
            });
        }
        let adapter = self.adapter()?;
        adapter.send_frame(frame).await.inspect_err(|err| self.note_failure(err))
    }

    async fn recv_frame(&self) -> TransportResult<Frame> {
        let adapter = self.adapter()?;
        let mut state = self.state.subscribe();
        tokio::select! {
            frame = adapter.recv_frame() => frame.inspect_err(|err| self.note_failure(err)),
            _ = state.wait_for(|state| *state != TransportState::Connected) => {
                Err(TransportError::closed("transport closed locally"))
            }
        }
    }
}

async fn run_keepalive(
    adapter: Arc<dyn SocketAdapter>,
    state: Arc<watch::Sender<TransportState>>,
    config: TransportConfig,
    mut stop: aip_primitives::StopSignal,
) {
    let mut interval = tokio::time::interval(config.ping_interval());
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval.tick().await;

    loop {
        tokio::select! {
            () = stop.stopped() => break,
            _ = interval.tick() => {}
        }
        if !adapter.is_open() {
            break;
        }
        if adapter.idle_for() > config.ping_timeout() {
            warn!(
                kind = %adapter.kind(),
                idle = ?adapter.idle_for(),
                "no frames within ping timeout; closing connection"
            );
            state.send_replace(TransportState::Error);
            if let Err(err) = adapter.close(config.close_timeout()).await {
                debug!(?err, "close after ping timeout failed");
            }
            break;
        }
        if let Err(err) = adapter.send_ping().await {
            warn!(kind = %adapter.kind(), ?err, "keepalive ping failed");
            let next = if err.is_connection_closed() {
                TransportState::Disconnected
            } else {
                TransportState::Error
            };
            state.send_replace(next);
            break;
        }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&self, url: &str) -> TransportResult<()> {
        if self.origin == AdapterKind::ServerAccepted {
            return Err(TransportError::Unsupported {
                operation: "connect",
                transport: "server-accepted websocket",
            });
        }
        if self.is_connected() {
            return Ok(());
        }
        self.config.validate()?;
        self.set_state(TransportState::Connecting);

        let dial = tokio_tungstenite::connect_async_with_config(
            url,
            Some(self.config.websocket_config()),
            false,
        );
        let socket = match tokio::time::timeout(self.config.open_timeout(), dial).await {
            Ok(Ok((socket, _response))) => socket,
            Ok(Err(err)) => {
                self.set_state(TransportState::Error);
                return Err(TransportError::Connect {
                    url: url.to_owned(),
                    reason: err.to_string(),
                });
            }
            Err(_) => {
                self.set_state(TransportState::Error);
                return Err(TransportError::Connect {
                    url: url.to_owned(),
                    reason: format!("timed out after {:?}", self.config.open_timeout()),
                });
            }
        };

        info!(%url, "websocket connected");
        self.install(Arc::new(TungsteniteAdapter::new(
            AdapterKind::ClientInitiated,
            socket,
        )));
        Ok(())
    }

    async fn send(&self, text: &str) -> TransportResult<()> {
        self.send_frame(Frame::Text(text.to_owned())).await
    }

    async fn receive(&self) -> TransportResult<String> {
        crate::frame_to_text(self.recv_frame().await?)
    }

    async fn send_binary(&self, data: Bytes) -> TransportResult<()> {
        self.send_frame(Frame::Binary(data)).await
    }

    async fn receive_binary(&self) -> TransportResult<Bytes> {
        Ok(self.recv_frame().await?.into_bytes())
    }

    async fn receive_auto(&self) -> TransportResult<Frame> {
        self.recv_frame().await
    }

    async fn close(&self) -> TransportResult<()> {
        let adapter = self
            .adapter
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let keepalive = self
            .keepalive
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(task) = keepalive {
            task.stop().await;
        }
        if let Some(adapter) = adapter {
            self.set_state(TransportState::Disconnecting);
            if let Err(err) = adapter.close(self.config.close_timeout()).await {
                debug!(?err, "websocket close handshake failed");
            }
            info!(origin = %self.origin, "websocket closed");
        }
        self.set_state(TransportState::Disconnected);
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tokio::net::TcpListener;

    async fn loopback_pair(config: TransportConfig) -> (WebSocketTransport, WebSocketTransport) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            WebSocketTransport::accept(stream, config).await.unwrap()
        });
        let client = WebSocketTransport::client(config);
        client.connect(&format!("ws://{addr}")).await.unwrap();
        (server.await.unwrap(), client)
    }

    #[tokio::test]
    async fn exchanges_text_and_binary_frames() {
        let (server, client) = loopback_pair(TransportConfig::default()).await;

        client.send("{\"hello\":1}").await.unwrap();
        assert_eq!(server.receive().await.unwrap(), "{\"hello\":1}");

        server.send_binary(Bytes::from_static(b"\x00\x01")).await.unwrap();
        assert_eq!(
            client.receive_auto().await.unwrap(),
            Frame::Binary(Bytes::from_static(b"\x00\x01"))
        );

        client.send("auto").await.unwrap();
        assert_eq!(server.receive_auto().await.unwrap(), Frame::Text("auto".into()));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (server, client) = loopback_pair(TransportConfig::default()).await;

        for _ in 0..3 {
            client.close().await.unwrap();
            assert_eq!(client.state(), TransportState::Disconnected);
        }
        drop(server);
    }

    #[tokio::test]
    async fn peer_close_surfaces_as_connection_closed() {
        let (server, client) = loopback_pair(TransportConfig::default()).await;

        client.close().await.unwrap();
        let err = server.receive().await.expect_err("peer closed");
        assert!(err.is_connection_closed());
        assert_eq!(server.state(), TransportState::Disconnected);

        let err = server.send("late").await.expect_err("send after close");
        assert!(err.is_connection_closed());
    }

    #[tokio::test]
    async fn accepted_transport_cannot_dial() {
        let (server, _client) = loopback_pair(TransportConfig::default()).await;
        let err = server.connect("ws://127.0.0.1:1").await.expect_err("server cannot dial");
        assert!(matches!(err, TransportError::Unsupported { .. }));
        assert_eq!(server.origin(), AdapterKind::ServerAccepted);
    }

    #[tokio::test]
    async fn oversized_frames_are_rejected_before_sending() {
        let config = TransportConfig::default().with_max_size(8);
        let (_server, client) = loopback_pair(config).await;
        let err = client.send("0123456789").await.expect_err("too large");
        assert!(matches!(err, TransportError::MessageTooLarge { .. }));
        assert!(client.is_connected());
    }

    #[tokio::test]
    async fn connect_failure_moves_to_error() {
        let client = WebSocketTransport::client(
            TransportConfig::default().with_open_timeout(Duration::from_secs(2)),
        );
        let err = client.connect("ws://127.0.0.1:1").await.expect_err("nothing listens");
        assert!(matches!(err, TransportError::Connect { .. }));
        assert_eq!(client.state(), TransportState::Error);
    }
}
