//! Orchestrator endpoint holding one server link per target device.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use aip_extensions::ExtensionChain;
use aip_primitives::{BackgroundTask, ClientMessage, ClientType, Metadata, ServerMessage, ServerMessageType};
use aip_protocol::{
    AipProtocol, DeviceInfoProtocol, ProtocolError, RegistrationProtocol, TaskExecutionProtocol,
    TaskRequest,
};
use aip_resilience::{DeviceRecovery, ReconnectionStrategy, RecoveryError, TimeoutManager};
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::{
    AipEndpoint, Connector, EndpointConfig, EndpointError, EndpointEvent, EndpointResult,
    EndpointState, InboundTap, Lifecycle, WebSocketConnector, lock,
};
use crate::link::{Link, LinkOwner, LinkRequest};

/// Builder for [`ConstellationEndpoint`].
pub struct ConstellationBuilder {
    constellation_id: String,
    metadata: Metadata,
    config: EndpointConfig,
    extensions: ExtensionChain,
    connector: Option<Arc<dyn Connector>>,
}

impl ConstellationBuilder {
    /// Metadata sent with every device registration.
    #[must_use]
    pub fn metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Replaces the endpoint configuration.
    #[must_use]
    pub fn config(mut self, config: EndpointConfig) -> Self {
        self.config = config;
        self
    }

    /// Installs extensions on every link.
    #[must_use]
    pub fn extensions(mut self, extensions: ExtensionChain) -> Self {
        self.extensions = extensions;
        self
    }

    /// Replaces the WebSocket dialer.
    #[must_use]
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Builds the endpoint in the [`EndpointState::Created`] state.
    ///
    /// # Errors
    ///
    /// Returns [`EndpointError::InvalidConfig`] for an invalid configuration.
    pub fn build(self) -> EndpointResult<ConstellationEndpoint> {
        self.config.validate()?;
        let connector = self.connector.unwrap_or_else(|| {
            Arc::new(WebSocketConnector::new(self.config.transport())) as Arc<dyn Connector>
        });
        Ok(ConstellationEndpoint {
            inner: Arc::new(ConstellationInner {
                lifecycle: Lifecycle::new(self.constellation_id.clone()),
                constellation_id: self.constellation_id,
                metadata: self.metadata,
                connector,
                strategy: ReconnectionStrategy::new(*self.config.reconnection()),
                timeouts: TimeoutManager::new(self.config.default_timeout()),
                tap: InboundTap::new(self.config.tap_capacity()),
                config: self.config,
                extensions: self.extensions,
                links: Mutex::new(HashMap::new()),
                addresses: Mutex::new(HashMap::new()),
                recovering: Mutex::new(HashSet::new()),
                recoveries: Mutex::new(HashMap::new()),
            }),
        })
    }
}

struct ConstellationInner {
    constellation_id: String,
    metadata: Metadata,
    connector: Arc<dyn Connector>,
    config: EndpointConfig,
    extensions: ExtensionChain,
    lifecycle: Lifecycle,
    strategy: ReconnectionStrategy,
    timeouts: TimeoutManager,
    tap: InboundTap<ServerMessage>,
    links: Mutex<HashMap<String, Link>>,
    addresses: Mutex<HashMap<String, String>>,
    recovering: Mutex<HashSet<String>>,
    recoveries: Mutex<HashMap<String, BackgroundTask>>,
}

/// Dispatches tasks to devices, one registered server link per device.
///
/// Each link registers as `"{constellation_id}@{device_id}"` targeting its
/// device. A lost link is recovered on its own: its pending requests fail,
/// other devices are untouched, and the device is re-dialled at the address
/// given to [`connect_to_device`](Self::connect_to_device).
#[derive(Clone)]
pub struct ConstellationEndpoint {
    inner: Arc<ConstellationInner>,
}

impl fmt::Debug for ConstellationEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConstellationEndpoint")
            .field("constellation_id", &self.inner.constellation_id)
            .field("state", &self.inner.lifecycle.state())
            .field("devices", &self.connected_devices())
            .finish()
    }
}

impl ConstellationEndpoint {
    /// Starts a builder.
    #[must_use]
    pub fn builder(constellation_id: impl Into<String>) -> ConstellationBuilder {
        ConstellationBuilder {
            constellation_id: constellation_id.into(),
            metadata: Metadata::new(),
            config: EndpointConfig::default(),
            extensions: ExtensionChain::default(),
            connector: None,
        }
    }

    /// Returns the constellation id.
    #[must_use]
    pub fn constellation_id(&self) -> &str {
        &self.inner.constellation_id
    }

    /// Client id the link to `device_id` registers under.
    #[must_use]
    pub fn link_id(&self, device_id: &str) -> String {
        format!("{}@{device_id}", self.inner.constellation_id)
    }

    /// Subscribes to every message received on any link.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ServerMessage> {
        self.inner.tap.subscribe()
    }

    /// Opens and registers a link to `device_id` through the server at
    /// `server_url`. The address is kept for reconnection.
    ///
    /// # Errors
    ///
    /// Returns [`EndpointError::NotRunning`] before `start`, the dial failure,
    /// or [`EndpointError::Registration`] when the server rejects the link,
    /// for example because the device is not connected.
    pub async fn connect_to_device(&self, device_id: &str, server_url: &str) -> EndpointResult<()> {
        self.ensure_running()?;
        lock(&self.inner.addresses).insert(device_id.to_owned(), server_url.to_owned());
        self.open_link(device_id).await
    }

    /// Sends a task to `device_id` and waits for its TASK_END.
    ///
    /// # Errors
    ///
    /// Returns [`EndpointError::NotConnected`] without a link, or the protocol
    /// failure, including a timeout after the configured task deadline.
    pub async fn send_task_to_device(
        &self,
        device_id: &str,
        task: TaskRequest,
    ) -> EndpointResult<ServerMessage> {
        let (link_id, protocol) = self.link(device_id)?;
        let tasks = TaskExecutionProtocol::new(protocol);
        let reply = tasks
            .dispatch_task(&link_id, ClientType::Constellation, task.for_device(device_id))
            .await?;
        debug!(%device_id, request_id = %reply.id(), "task dispatched");
        Ok(reply.wait_timeout(self.inner.config.task_timeout()).await?)
    }

    /// Asks the server what `device_id` advertised at registration.
    ///
    /// # Errors
    ///
    /// Returns [`EndpointError::NotConnected`] without a link, or the protocol
    /// failure.
    pub async fn request_device_info(&self, device_id: &str) -> EndpointResult<Value> {
        let (link_id, protocol) = self.link(device_id)?;
        let info = DeviceInfoProtocol::new(protocol);
        Ok(info
            .request_device_info(&link_id, device_id, None, self.inner.config.default_timeout())
            .await?)
    }

    /// Closes the link to `device_id` and forgets its address, so it is not
    /// reconnected. Returns `false` if no link existed.
    pub async fn disconnect_device(&self, device_id: &str) -> bool {
        lock(&self.inner.addresses).remove(device_id);
        let recovery = lock(&self.inner.recoveries).remove(device_id);
        if let Some(recovery) = recovery {
            recovery.stop().await;
        }
        lock(&self.inner.recovering).remove(device_id);
        let link = lock(&self.inner.links).remove(device_id);
        let Some(link) = link else {
            return false;
        };
        link.shutdown().await;
        info!(%device_id, "device link closed");
        true
    }

    /// Returns `true` while the link to `device_id` is up.
    #[must_use]
    pub fn is_device_connected(&self, device_id: &str) -> bool {
        lock(&self.inner.links)
            .get(device_id)
            .is_some_and(|link| link.protocol().is_connected())
    }

    /// Devices with a link, sorted.
    #[must_use]
    pub fn connected_devices(&self) -> Vec<String> {
        let mut devices: Vec<_> = lock(&self.inner.links).keys().cloned().collect();
        devices.sort();
        devices
    }

    fn ensure_running(&self) -> EndpointResult<()> {
        let state = self.inner.lifecycle.state();
        if state.is_running() {
            Ok(())
        } else {
            Err(EndpointError::NotRunning {
                endpoint: self.inner.constellation_id.clone(),
                state,
            })
        }
    }

    fn link(&self, device_id: &str) -> EndpointResult<(String, AipProtocol)> {
        lock(&self.inner.links)
            .get(device_id)
            .map(|link| (link.id().to_owned(), link.protocol().clone()))
            .ok_or_else(|| EndpointError::NotConnected {
                target: device_id.to_owned(),
            })
    }

    async fn open_link(&self, device_id: &str) -> EndpointResult<()> {
        let inner = &self.inner;
        let server_url = lock(&inner.addresses)
            .get(device_id)
            .cloned()
            .ok_or_else(|| EndpointError::NotConnected {
                target: device_id.to_owned(),
            })?;
        let registration = RegistrationProtocol::constellation_registration(
            &self.link_id(device_id),
            device_id,
            inner.metadata.clone(),
        );
        let (link, gate) = Link::open(
            self.clone(),
            LinkRequest {
                connector: inner.connector.as_ref(),
                url: &server_url,
                key: device_id,
                registration,
                config: &inner.config,
                extensions: &inner.extensions,
            },
        )
        .await?;
        let link_id = link.id().to_owned();
        let previous = lock(&inner.links).insert(device_id.to_owned(), link);
        if let Some(previous) = previous {
            previous.shutdown().await;
        }
        if let Err(err) = self.ensure_running() {
            // stopped while dialling; the drained table never saw this link
            let stale = lock(&inner.links).remove(device_id);
            if let Some(stale) = stale {
                stale.shutdown().await;
            }
            return Err(err);
        }
        gate.open();
        info!(%device_id, %link_id, %server_url, "device link registered");
        Ok(())
    }

    /// Starts recovery of `device_id` unless `lost` was already replaced or
    /// a recovery for the device is under way.
    fn link_lost(&self, device_id: &str, lost: &AipProtocol) {
        let current = lock(&self.inner.links)
            .get(device_id)
            .is_some_and(|link| link.protocol().same_connection(lost));
        if !current
            || !self.inner.lifecycle.state().is_running()
            || !lock(&self.inner.recovering).insert(device_id.to_owned())
        {
            return;
        }
        let endpoint = self.clone();
        let device = device_id.to_owned();
        let task = BackgroundTask::spawn(format!("recovery-{device_id}"), move |mut stop| async move {
            tokio::select! {
                () = stop.stopped() => {}
                () = endpoint.recover_device(&device) => {}
            }
            lock(&endpoint.inner.recovering).remove(&device);
        });
        let _finished = lock(&self.inner.recoveries).insert(device_id.to_owned(), task);
    }

    async fn recover_device(&self, device_id: &str) {
        let outcome = self.inner.strategy.handle_disconnection(self, device_id).await;
        if !outcome.success {
            warn!(%device_id, attempts = outcome.attempts, "device link not recovered");
        }
    }
}

#[async_trait]
impl LinkOwner for ConstellationEndpoint {
    async fn on_message(&self, protocol: &AipProtocol, message: ServerMessage) {
        self.inner.tap.publish(&message);
        if !protocol.route_reply(&message) && message.kind != ServerMessageType::Heartbeat {
            debug!(peer = protocol.peer(), kind = message.kind.as_str(), "unsolicited server message");
        }
    }

    fn on_lost(&self, device_id: &str, protocol: &AipProtocol) {
        self.link_lost(device_id, protocol);
    }
}

#[async_trait]
impl DeviceRecovery for ConstellationEndpoint {
    async fn reconnect_device(&self, device_id: &str) -> bool {
        if self.ensure_running().is_err() {
            return false;
        }
        if !lock(&self.inner.addresses).contains_key(device_id) {
            debug!(%device_id, "no recorded address; not reconnecting");
            return false;
        }
        match self.open_link(device_id).await {
            Ok(()) => true,
            Err(err) => {
                warn!(%device_id, %err, "device link reconnection failed");
                false
            }
        }
    }

    async fn cancel_device_tasks(&self, device_id: &str, reason: &str) -> Result<(), RecoveryError> {
        let protocol = lock(&self.inner.links)
            .get(device_id)
            .map(|link| link.protocol().clone());
        if let Some(protocol) = protocol {
            let failed = protocol.fail_pending(reason);
            debug!(%device_id, failed, "pending requests failed");
        }
        Ok(())
    }

    async fn on_device_disconnected(&self, device_id: &str) -> Result<(), RecoveryError> {
        let link = lock(&self.inner.links).remove(device_id);
        if let Some(link) = link {
            link.shutdown().await;
        }
        info!(%device_id, "device link dropped");
        Ok(())
    }
}

#[async_trait]
impl AipEndpoint for ConstellationEndpoint {
    type Inbound = ServerMessage;
    type Outbound = ClientMessage;

    async fn start(&self) -> EndpointResult<()> {
        self.inner.lifecycle.transition(EndpointEvent::Start)?;
        self.inner.lifecycle.transition(EndpointEvent::Connected)?;
        info!(constellation_id = %self.inner.constellation_id, "constellation started");
        Ok(())
    }

    async fn stop(&self) -> EndpointResult<()> {
        self.inner.lifecycle.transition(EndpointEvent::Stop)?;
        let recoveries: Vec<_> = lock(&self.inner.recoveries).drain().collect();
        for (_, recovery) in recoveries {
            recovery.stop().await;
        }
        lock(&self.inner.recovering).clear();
        let mut links: Vec<_> = lock(&self.inner.links).drain().collect();
        links.sort_by(|(left, _), (right, _)| left.cmp(right));
        for (_, link) in links {
            link.shutdown().await;
        }
        info!(constellation_id = %self.inner.constellation_id, "constellation stopped");
        Ok(())
    }

    async fn handle_message(&self, message: ServerMessage) -> EndpointResult<()> {
        let protocols: Vec<_> = lock(&self.inner.links)
            .values()
            .map(|link| link.protocol().clone())
            .collect();
        if !protocols.iter().any(|protocol| protocol.route_reply(&message)) {
            debug!(kind = message.kind.as_str(), "no pending request for message");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.inner.lifecycle.state().is_running()
    }

    fn state(&self) -> EndpointState {
        self.inner.lifecycle.state()
    }

    async fn send_with_timeout(&self, message: ClientMessage, timeout: Duration) -> EndpointResult<()> {
        let device_id = message.target_id.clone().ok_or(ProtocolError::Invalid {
            message_type: message.kind.as_str(),
            reason: "target_id is required",
        })?;
        let (_, protocol) = self.link(&device_id)?;
        self.inner
            .timeouts
            .with_timeout(protocol.send_message(&message), Some(timeout), "send")
            .await?;
        Ok(())
    }

    async fn receive_with_timeout(
        &self,
        kind: ServerMessageType,
        timeout: Duration,
    ) -> EndpointResult<ServerMessage> {
        self.inner.tap.wait_for_kind(kind, timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use aip_primitives::{ClientMessageType, Command, CommandResult, TaskStatus};
    use aip_resilience::{ReconnectionConfig, ReconnectionPolicy};
    use aip_transport::Transport;
    use serde_json::json;

    use crate::link::testing::ScriptedServer;
    use crate::{
        CommandDispatcher, DeviceClientEndpoint, DeviceServerEndpoint, InProcessConnector,
        SessionManager, TaskContext,
    };

    struct Echo;

    #[async_trait]
    impl CommandDispatcher for Echo {
        async fn execute_commands(&self, commands: &[Command]) -> anyhow::Result<Vec<CommandResult>> {
            Ok(commands
                .iter()
                .map(|command| CommandResult::success(command.call_id.clone(), json!("done")))
                .collect())
        }
    }

    /// Runs one command, or never finishes for tasks named `hang`.
    struct Sessions;

    #[async_trait]
    impl SessionManager for Sessions {
        async fn execute_task(&self, context: TaskContext) -> anyhow::Result<Option<Value>> {
            if context.task_name.as_deref() == Some("hang") {
                std::future::pending::<()>().await;
            }
            let results = context.execute_commands(vec![Command::new("open")]).await?;
            Ok(Some(json!({ "device": context.device_id, "results": results.len() })))
        }

        async fn cancel_task(&self, _session_id: &str, _reason: &str) -> anyhow::Result<()> {
            Ok(())
        }
    }

    /// Remembers the last transport it opened.
    struct Recording {
        inner: InProcessConnector,
        last: Mutex<Option<Arc<dyn Transport>>>,
    }

    #[async_trait]
    impl Connector for Recording {
        async fn connect(&self, url: &str) -> EndpointResult<Arc<dyn Transport>> {
            let transport = self.inner.connect(url).await?;
            *lock(&self.last) = Some(Arc::clone(&transport));
            Ok(transport)
        }
    }

    struct Fixture {
        server: DeviceServerEndpoint,
        devices: Vec<DeviceClientEndpoint>,
        connector: Arc<Recording>,
        constellation: ConstellationEndpoint,
    }

    impl Fixture {
        async fn new(device_ids: &[&str]) -> Self {
            let server = DeviceServerEndpoint::builder(Arc::new(Sessions)).build().unwrap();
            server.start().await.unwrap();
            let mut devices = Vec::new();
            for device_id in device_ids {
                let device = DeviceClientEndpoint::builder("memory://server", *device_id, Arc::new(Echo))
                    .metadata(json!({ "role": device_id }).as_object().cloned().unwrap_or_default())
                    .connector(Arc::new(InProcessConnector::new(server.clone())))
                    .build()
                    .unwrap();
                device.start().await.unwrap();
                devices.push(device);
            }
            let connector = Arc::new(Recording {
                inner: InProcessConnector::new(server.clone()),
                last: Mutex::new(None),
            });
            let constellation = ConstellationEndpoint::builder("const1")
                .config(EndpointConfig::default().with_reconnection(ReconnectionConfig {
                    policy: ReconnectionPolicy::Immediate,
                    max_retries: 3,
                    ..ReconnectionConfig::default()
                }))
                .connector(Arc::clone(&connector) as Arc<dyn Connector>)
                .build()
                .unwrap();
            constellation.start().await.unwrap();
            Self {
                server,
                devices,
                connector,
                constellation,
            }
        }

        async fn shutdown(self) {
            self.constellation.stop().await.unwrap();
            for device in self.devices {
                device.stop().await.unwrap();
            }
            self.server.stop().await.unwrap();
        }
    }

    async fn wait_until(check: impl Fn() -> bool) {
        for _ in 0..400 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn dispatches_tasks_and_queries_devices() {
        let fixture = Fixture::new(&["dev1", "dev2"]).await;
        let constellation = &fixture.constellation;
        constellation.connect_to_device("dev1", "memory://server").await.unwrap();
        constellation.connect_to_device("dev2", "memory://server").await.unwrap();
        assert_eq!(constellation.connected_devices(), ["dev1", "dev2"]);
        assert!(fixture.server.connected_clients().contains(&"const1@dev2".to_owned()));

        let end = constellation
            .send_task_to_device("dev2", TaskRequest::new("open", "open the browser"))
            .await
            .unwrap();
        assert_eq!(end.status, TaskStatus::Completed);
        assert_eq!(end.result, Some(json!({ "device": "dev2", "results": 1 })));

        let info = constellation.request_device_info("dev1").await.unwrap();
        assert_eq!(info["role"], "dev1");
        fixture.shutdown().await;
    }

    #[tokio::test]
    async fn rejected_when_the_device_is_absent() {
        let fixture = Fixture::new(&[]).await;
        let err = fixture
            .constellation
            .connect_to_device("ghost", "memory://server")
            .await
            .unwrap_err();
        assert!(
            matches!(err, EndpointError::Registration { ref reason, .. } if reason.contains("not connected"))
        );
        assert!(!fixture.constellation.is_device_connected("ghost"));
        fixture.shutdown().await;
    }

    #[tokio::test]
    async fn cancelling_one_device_leaves_others_pending() {
        let fixture = Fixture::new(&["dev1", "dev2"]).await;
        let constellation = fixture.constellation.clone();
        constellation.connect_to_device("dev1", "memory://server").await.unwrap();
        constellation.connect_to_device("dev2", "memory://server").await.unwrap();

        let first = tokio::spawn({
            let constellation = constellation.clone();
            async move {
                constellation
                    .send_task_to_device("dev1", TaskRequest::new("hang", "wait"))
                    .await
            }
        });
        let second = tokio::spawn({
            let constellation = constellation.clone();
            async move {
                constellation
                    .send_task_to_device("dev2", TaskRequest::new("hang", "wait"))
                    .await
            }
        });
        wait_until(|| fixture.server.sessions().len() == 2).await;

        constellation
            .cancel_device_tasks("dev1", "operator cancelled")
            .await
            .unwrap();
        let err = first.await.unwrap().unwrap_err();
        assert!(matches!(err, EndpointError::Protocol(ProtocolError::Cancelled { .. })));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!second.is_finished());
        fixture.shutdown().await;
        assert!(second.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn lost_link_is_redialled() {
        let fixture = Fixture::new(&["dev1"]).await;
        let constellation = &fixture.constellation;
        constellation.connect_to_device("dev1", "memory://server").await.unwrap();
        let first = lock(&fixture.connector.last).clone().unwrap();

        first.close().await.unwrap();
        wait_until(|| {
            lock(&fixture.connector.last)
                .as_ref()
                .is_some_and(|latest| !Arc::ptr_eq(latest, &first))
                && constellation.is_device_connected("dev1")
        })
        .await;
        let info = constellation.request_device_info("dev1").await.unwrap();
        assert_eq!(info["device_id"], "dev1");
        fixture.shutdown().await;
    }

    #[tokio::test]
    async fn disconnected_devices_are_forgotten() {
        let fixture = Fixture::new(&["dev1"]).await;
        let constellation = &fixture.constellation;
        constellation.connect_to_device("dev1", "memory://server").await.unwrap();

        assert!(constellation.disconnect_device("dev1").await);
        assert!(!constellation.disconnect_device("dev1").await);
        assert!(!constellation.reconnect_device("dev1").await);
        assert!(matches!(
            constellation
                .send_task_to_device("dev1", TaskRequest::new("t", "r"))
                .await,
            Err(EndpointError::NotConnected { .. })
        ));

        let unaddressed = ClientMessage::new(ClientMessageType::Heartbeat, "const1@dev1", ClientType::Constellation);
        assert!(matches!(
            constellation.send_with_timeout(unaddressed, Duration::from_secs(1)).await,
            Err(EndpointError::Protocol(ProtocolError::Invalid { .. }))
        ));
        fixture.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn link_dropped_right_after_registration_is_recovered() {
        for _ in 0..20 {
            let connector = Arc::new(ScriptedServer::hanging_up());
            let constellation = ConstellationEndpoint::builder("const1")
                .config(EndpointConfig::default().with_reconnection(ReconnectionConfig {
                    policy: ReconnectionPolicy::Immediate,
                    max_retries: 1,
                    ..ReconnectionConfig::default()
                }))
                .connector(Arc::clone(&connector) as Arc<dyn Connector>)
                .build()
                .unwrap();
            constellation.start().await.unwrap();
            constellation.connect_to_device("dev1", "memory://server").await.unwrap();

            wait_until(|| connector.dials() == 2 && constellation.connected_devices().is_empty()).await;
            assert!(!constellation.is_device_connected("dev1"));
            constellation.stop().await.unwrap();
        }
    }
}
