//! Registered client-side link shared by the device client and the
//! constellation.
//!
//! A [`Link`] owns the protocol, its heartbeat and a listen loop. The loop
//! stays parked until the owner opens the [`LinkGate`], so a connection that
//! dies right after registration is only reported once the owner has stored
//! the link and marked itself running.

use aip_extensions::ExtensionChain;
use aip_primitives::{BackgroundTask, ClientMessage, ServerMessage, StopSignal};
use aip_protocol::{AipProtocol, HeartbeatProtocol, ProtocolError, RegistrationProtocol};
use aip_resilience::HeartbeatManager;
use async_trait::async_trait;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::{Connector, EndpointConfig, EndpointError, EndpointResult};

/// Endpoint that receives what a [`Link`] hears.
#[async_trait]
pub(crate) trait LinkOwner: Clone + Send + Sync + 'static {
    /// Handles one decoded message from the server.
    async fn on_message(&self, protocol: &AipProtocol, message: ServerMessage);

    /// Called once when the link under `key` fails.
    fn on_lost(&self, key: &str, protocol: &AipProtocol);
}

/// What [`Link::open`] dials and how it registers.
pub(crate) struct LinkRequest<'a> {
    pub(crate) connector: &'a dyn Connector,
    pub(crate) url: &'a str,
    /// Name the owner files the link under.
    pub(crate) key: &'a str,
    pub(crate) registration: ClientMessage,
    pub(crate) config: &'a EndpointConfig,
    pub(crate) extensions: &'a ExtensionChain,
}

pub(crate) struct Link {
    id: String,
    protocol: AipProtocol,
    heartbeat: HeartbeatManager,
    listen: BackgroundTask,
}

/// Releases the listen loop of a freshly opened [`Link`]. Dropping it
/// unopened ends the loop.
#[must_use]
pub(crate) struct LinkGate(oneshot::Sender<()>);

impl LinkGate {
    pub(crate) fn open(self) {
        let _ = self.0.send(());
    }
}

impl Link {
    /// Dials, registers and starts heartbeating. The listen loop waits for
    /// the returned gate.
    pub(crate) async fn open<O: LinkOwner>(owner: O, request: LinkRequest<'_>) -> EndpointResult<(Self, LinkGate)> {
        let LinkRequest {
            connector,
            url,
            key,
            registration,
            config,
            extensions,
        } = request;
        let id = registration.client_id.clone();
        let client_type = registration.client_type;

        let transport = connector.connect(url).await?;
        let protocol = AipProtocol::builder(transport)
            .peer(format!("{url}#{key}"))
            .extensions(extensions.clone())
            .build();
        let outcome = RegistrationProtocol::new(protocol.clone())
            .register(registration, config.registration_timeout())
            .await;
        if !outcome.success {
            let _ = protocol.close().await;
            return Err(EndpointError::Registration {
                client_id: id,
                reason: outcome.error.unwrap_or_default(),
            });
        }

        let heartbeat = HeartbeatManager::new(HeartbeatProtocol::new(protocol.clone()).with_client_type(client_type));
        heartbeat.start_heartbeat(&id, config.heartbeat_interval()).await;
        let (gate, armed) = oneshot::channel();
        let key = key.to_owned();
        let listen_protocol = protocol.clone();
        let listen = BackgroundTask::spawn(format!("listen-{id}"), move |stop| {
            listen(owner, key, listen_protocol, armed, stop)
        });
        Ok((
            Self {
                id,
                protocol,
                heartbeat,
                listen,
            },
            LinkGate(gate),
        ))
    }

    /// Client id the link registered under.
    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn protocol(&self) -> &AipProtocol {
        &self.protocol
    }

    pub(crate) async fn shutdown(self) {
        self.heartbeat.stop_all().await;
        if let Err(err) = self.protocol.close().await {
            debug!(link_id = %self.id, %err, "link close failed");
        }
        self.listen.stop().await;
    }
}

async fn listen<O: LinkOwner>(
    owner: O,
    key: String,
    protocol: AipProtocol,
    armed: oneshot::Receiver<()>,
    mut stop: StopSignal,
) {
    tokio::select! {
        () = stop.stopped() => return,
        armed = armed => {
            if armed.is_err() {
                return;
            }
        }
    }
    loop {
        let received = tokio::select! {
            () = stop.stopped() => return,
            received = protocol.receive_message::<ServerMessage>() => received,
        };
        match received {
            Ok(message) => owner.on_message(&protocol, message).await,
            Err(err @ ProtocolError::Decode { .. }) => {
                warn!(%key, %err, "dropping undecodable message");
            }
            Err(err) => {
                warn!(%key, %err, "link to server lost");
                owner.on_lost(&key, &protocol);
                return;
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use aip_protocol::{AipProtocol, RegistrationProtocol};
    use aip_transport::{MemoryTransport, Transport};
    use async_trait::async_trait;

    use crate::{Connector, EndpointError, EndpointResult, lock};

    /// Answers registrations on its own, without a device server.
    pub(crate) struct ScriptedServer {
        dials: AtomicUsize,
        hang_up: bool,
        server_end: Mutex<Option<AipProtocol>>,
    }

    impl ScriptedServer {
        /// Accepts every dial and keeps the server end of the latest one.
        pub(crate) fn keeping() -> Self {
            Self {
                dials: AtomicUsize::new(0),
                hang_up: false,
                server_end: Mutex::new(None),
            }
        }

        /// Closes the first link right after confirming it and refuses
        /// every later dial.
        pub(crate) fn hanging_up() -> Self {
            Self {
                hang_up: true,
                ..Self::keeping()
            }
        }

        pub(crate) fn dials(&self) -> usize {
            self.dials.load(Ordering::SeqCst)
        }

        pub(crate) fn take_server_end(&self) -> Option<AipProtocol> {
            lock(&self.server_end).take()
        }
    }

    #[async_trait]
    impl Connector for ScriptedServer {
        async fn connect(&self, url: &str) -> EndpointResult<Arc<dyn Transport>> {
            let dial = self.dials.fetch_add(1, Ordering::SeqCst);
            if self.hang_up && dial > 0 {
                return Err(EndpointError::NotConnected { target: url.to_owned() });
            }
            let (client_end, server_end) = MemoryTransport::pair();
            let server = AipProtocol::new(Arc::new(server_end));
            if !self.hang_up {
                *lock(&self.server_end) = Some(server.clone());
            }
            let hang_up = self.hang_up;
            tokio::spawn(async move {
                let registration = RegistrationProtocol::new(server.clone());
                if let Ok(message) = registration.await_registration(Duration::from_secs(5)).await {
                    let _ = registration.send_registration_confirmation(message.request_id).await;
                }
                if hang_up {
                    let _ = server.close().await;
                }
            });
            Ok(Arc::new(client_end))
        }
    }
}
