//! How client-side endpoints open their transports.

use std::fmt;
use std::sync::Arc;

use aip_transport::{MemoryTransport, Transport, TransportConfig, WebSocketTransport};
use async_trait::async_trait;
use tracing::debug;

use crate::{DeviceServerEndpoint, EndpointResult};

/// Opens a connected transport to `url`.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Dials `url` and returns the connected transport.
    async fn connect(&self, url: &str) -> EndpointResult<Arc<dyn Transport>>;
}

/// Dials `ws://` URLs.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector {
    config: TransportConfig,
}

impl WebSocketConnector {
    /// Creates a connector using `config` for every socket it opens.
    #[must_use]
    pub const fn new(config: TransportConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, url: &str) -> EndpointResult<Arc<dyn Transport>> {
        let transport = WebSocketTransport::client(self.config);
        transport.connect(url).await?;
        Ok(Arc::new(transport))
    }
}

/// Connects straight to a server in the same process over a memory pair.
/// The URL is ignored.
#[derive(Clone)]
pub struct InProcessConnector {
    server: DeviceServerEndpoint,
}

impl fmt::Debug for InProcessConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InProcessConnector").finish_non_exhaustive()
    }
}

impl InProcessConnector {
    /// Connects to `server`.
    #[must_use]
    pub fn new(server: DeviceServerEndpoint) -> Self {
        Self { server }
    }
}

#[async_trait]
impl Connector for InProcessConnector {
    async fn connect(&self, url: &str) -> EndpointResult<Arc<dyn Transport>> {
        let (client_end, server_end) = MemoryTransport::pair();
        self.server.serve_transport(Arc::new(server_end))?;
        debug!(%url, "in-process link opened");
        Ok(Arc::new(client_end))
    }
}
