//! Server endpoint accepting device and constellation links.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use aip_extensions::ExtensionChain;
use aip_primitives::{
    BackgroundTask, ClientMessage, ClientMessageType, ClientType, CorrelationId, Metadata,
    ServerMessage, ServerMessageType, StopSignal, TaskStatus,
};
use aip_protocol::{
    AipProtocol, CommandProtocol, DeviceInfoProtocol, HeartbeatProtocol, ProtocolError,
    RegistrationProtocol, TaskAssignment, TaskExecutionProtocol, validate_client_message,
};
use aip_resilience::{
    DeviceRecovery, ReconnectionConfig, ReconnectionPolicy, ReconnectionStrategy, RecoveryError,
    TimeoutManager,
};
use aip_transport::{Transport, TransportResult, WebSocketTransport};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::{
    Addressed, AipEndpoint, EndpointConfig, EndpointError, EndpointEvent, EndpointResult,
    EndpointState, InboundTap, Lifecycle, SessionLookup, SessionManager, SessionRecord,
    SessionScheduler, SessionTable, TaskContext, lock,
};

/// Builder for [`DeviceServerEndpoint`].
pub struct DeviceServerBuilder {
    session_manager: Arc<dyn SessionManager>,
    session_lookup: Option<Arc<dyn SessionLookup>>,
    bind: Option<SocketAddr>,
    config: EndpointConfig,
    extensions: ExtensionChain,
}

impl DeviceServerBuilder {
    /// Listens for WebSocket connections on `addr` once started.
    #[must_use]
    pub fn bind(mut self, addr: SocketAddr) -> Self {
        self.bind = Some(addr);
        self
    }

    /// Replaces the endpoint configuration.
    #[must_use]
    pub fn config(mut self, config: EndpointConfig) -> Self {
        self.config = config;
        self
    }

    /// Installs extensions on every accepted connection.
    #[must_use]
    pub fn extensions(mut self, extensions: ExtensionChain) -> Self {
        self.extensions = extensions;
        self
    }

    /// Overrides how the sessions of a device are listed during recovery.
    #[must_use]
    pub fn session_lookup(mut self, lookup: Arc<dyn SessionLookup>) -> Self {
        self.session_lookup = Some(lookup);
        self
    }

    /// Builds the endpoint in the [`EndpointState::Created`] state.
    ///
    /// # Errors
    ///
    /// Returns [`EndpointError::InvalidConfig`] for an invalid configuration.
    pub fn build(self) -> EndpointResult<DeviceServerEndpoint> {
        self.config.validate()?;
        let sessions = SessionTable::new();
        Ok(DeviceServerEndpoint {
            inner: Arc::new(ServerInner {
                lifecycle: Lifecycle::new("device-server"),
                session_lookup: self
                    .session_lookup
                    .unwrap_or_else(|| Arc::new(sessions.clone()) as Arc<dyn SessionLookup>),
                session_manager: self.session_manager,
                sessions,
                scheduler: Mutex::new(SessionScheduler::new(self.config.max_sessions())),
                bind: self.bind,
                timeouts: TimeoutManager::new(self.config.default_timeout()),
                tap: InboundTap::new(self.config.tap_capacity()),
                config: self.config,
                extensions: self.extensions,
                clients: Mutex::new(HashMap::new()),
                connections: Mutex::new(HashMap::new()),
                next_connection: AtomicU64::new(1),
                listener: Mutex::new(None),
                local_addr: Mutex::new(None),
                strategy: ReconnectionStrategy::new(ReconnectionConfig {
                    policy: ReconnectionPolicy::None,
                    ..ReconnectionConfig::default()
                }),
            }),
        })
    }
}

#[derive(Clone)]
struct ClientLink {
    connection: u64,
    client_type: ClientType,
    target_id: Option<String>,
    metadata: Metadata,
    protocol: AipProtocol,
    connected_at: DateTime<Utc>,
}

struct ServerInner {
    lifecycle: Lifecycle,
    config: EndpointConfig,
    extensions: ExtensionChain,
    bind: Option<SocketAddr>,
    session_manager: Arc<dyn SessionManager>,
    session_lookup: Arc<dyn SessionLookup>,
    sessions: SessionTable,
    scheduler: Mutex<SessionScheduler>,
    timeouts: TimeoutManager,
    tap: InboundTap<ClientMessage>,
    clients: Mutex<HashMap<String, ClientLink>>,
    connections: Mutex<HashMap<u64, BackgroundTask>>,
    next_connection: AtomicU64,
    listener: Mutex<Option<BackgroundTask>>,
    local_addr: Mutex<Option<SocketAddr>>,
    strategy: ReconnectionStrategy,
}

/// Accepts device and constellation links and runs task sessions between
/// them.
///
/// Each connection registers first, then is served by its own receive loop.
/// TASK requests become sessions executed by the host [`SessionManager`] with
/// a [`CommandProtocol`] bound to the target device. Cloning is cheap.
#[derive(Clone)]
pub struct DeviceServerEndpoint {
    inner: Arc<ServerInner>,
}

impl fmt::Debug for DeviceServerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceServerEndpoint")
            .field("state", &self.inner.lifecycle.state())
            .field("local_addr", &self.local_addr())
            .field("clients", &self.connected_clients())
            .field("sessions", &self.inner.sessions.len())
            .finish()
    }
}

impl DeviceServerEndpoint {
    /// Starts a builder around the host session manager.
    #[must_use]
    pub fn builder(session_manager: Arc<dyn SessionManager>) -> DeviceServerBuilder {
        DeviceServerBuilder {
            session_manager,
            session_lookup: None,
            bind: None,
            config: EndpointConfig::default(),
            extensions: ExtensionChain::default(),
        }
    }

    /// Address the listener is bound to, while running with one.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *lock(&self.inner.local_addr)
    }

    /// Returns the endpoint configuration.
    #[must_use]
    pub fn config(&self) -> &EndpointConfig {
        &self.inner.config
    }

    /// Sessions in flight.
    #[must_use]
    pub fn sessions(&self) -> &SessionTable {
        &self.inner.sessions
    }

    /// Subscribes to every message received from any client.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ClientMessage> {
        self.inner.tap.subscribe()
    }

    /// Serves a transport that is already connected. The peer must register
    /// before anything else.
    ///
    /// # Errors
    ///
    /// Returns [`EndpointError::NotRunning`] unless the server is running.
    pub fn serve_transport(&self, transport: Arc<dyn Transport>) -> EndpointResult<()> {
        self.ensure_running()?;
        self.spawn_connection("in-process".to_owned(), async move { Ok(transport) });
        Ok(())
    }

    /// Returns `true` while a device with this id is registered.
    #[must_use]
    pub fn is_device_connected(&self, device_id: &str) -> bool {
        self.device_link(device_id).is_some()
    }

    /// Registered client ids, sorted.
    #[must_use]
    pub fn connected_clients(&self) -> Vec<String> {
        let mut clients: Vec<_> = lock(&self.inner.clients).keys().cloned().collect();
        clients.sort();
        clients
    }

    /// What a device advertised at registration, plus its id and connection
    /// time.
    #[must_use]
    pub fn device_info(&self, device_id: &str) -> Option<Value> {
        let link = self.device_link(device_id)?;
        let mut info = link.metadata;
        info.insert("device_id".into(), Value::from(device_id));
        info.insert(
            "connected_at".into(),
            Value::from(link.connected_at.to_rfc3339()),
        );
        Some(Value::Object(info))
    }

    fn ensure_running(&self) -> EndpointResult<()> {
        let state = self.inner.lifecycle.state();
        if state.is_running() {
            Ok(())
        } else {
            Err(EndpointError::NotRunning {
                endpoint: self.inner.lifecycle.endpoint().to_owned(),
                state,
            })
        }
    }

    fn link(&self, client_id: &str) -> Option<ClientLink> {
        lock(&self.inner.clients).get(client_id).cloned()
    }

    fn device_link(&self, device_id: &str) -> Option<ClientLink> {
        self.link(device_id)
            .filter(|link| link.client_type == ClientType::Device)
    }

    fn spawn_connection<F>(&self, peer: String, open: F)
    where
        F: Future<Output = TransportResult<Arc<dyn Transport>>> + Send + 'static,
    {
        let id = self.inner.next_connection.fetch_add(1, Ordering::Relaxed);
        let server = self.clone();
        let task = BackgroundTask::spawn(format!("aip-connection-{id}"), move |stop| async move {
            match open.await {
                Ok(transport) => server.serve_connection(id, peer, transport, stop).await,
                Err(err) => warn!(%peer, ?err, "connection could not be opened"),
            }
            lock(&server.inner.connections).remove(&id);
        });
        let mut connections = lock(&self.inner.connections);
        connections.retain(|_, task| !task.is_finished());
        connections.insert(id, task);
    }

    async fn accept_loop(self, listener: TcpListener, mut stop: StopSignal) {
        loop {
            let accepted = tokio::select! {
                () = stop.stopped() => break,
                accepted = listener.accept() => accepted,
            };
            let (stream, peer) = match accepted {
                Ok(pair) => pair,
                Err(err) => {
                    warn!(?err, "accepting a connection failed");
                    continue;
                }
            };
            debug!(%peer, "tcp connection accepted");
            let config = self.inner.config.transport();
            self.spawn_connection(peer.to_string(), async move {
                let transport = WebSocketTransport::accept(stream, config).await?;
                Ok(Arc::new(transport) as Arc<dyn Transport>)
            });
        }
        debug!("listener stopped");
    }

    async fn serve_connection(
        &self,
        connection: u64,
        peer: String,
        transport: Arc<dyn Transport>,
        mut stop: StopSignal,
    ) {
        let protocol = AipProtocol::builder(transport)
            .peer(peer.clone())
            .extensions(self.inner.extensions.clone())
            .build();
        let registration = RegistrationProtocol::new(protocol.clone());
        let timeout = self.inner.config.registration_timeout();

        let outcome = tokio::select! {
            () = stop.stopped() => None,
            outcome = registration.await_registration(timeout) => Some(outcome),
        };
        let message = match outcome {
            Some(Ok(message)) => message,
            Some(Err(err)) => {
                warn!(%peer, %err, "registration not completed");
                let _ = protocol.close().await;
                return;
            }
            None => {
                let _ = protocol.close().await;
                return;
            }
        };

        let client_id = message.client_id.clone();
        if message.client_type == ClientType::Constellation {
            let target = message.target_id.clone().unwrap_or_default();
            if !self.is_device_connected(&target) {
                let reason = format!("Target device '{target}' is not connected");
                warn!(%client_id, %target, "rejecting constellation registration");
                if let Err(err) = registration
                    .send_registration_error(&reason, message.request_id.clone())
                    .await
                {
                    debug!(%client_id, %err, "registration error not delivered");
                }
                let _ = protocol.close().await;
                return;
            }
        }

        if let Err(err) = registration
            .send_registration_confirmation(message.request_id.clone())
            .await
        {
            warn!(%client_id, %err, "registration confirmation failed");
            let _ = protocol.close().await;
            return;
        }

        let link = ClientLink {
            connection,
            client_type: message.client_type,
            target_id: message.target_id.clone(),
            metadata: message.metadata.clone(),
            protocol: protocol.clone(),
            connected_at: Utc::now(),
        };
        let displaced = lock(&self.inner.clients).insert(client_id.clone(), link);
        if let Some(displaced) = displaced {
            info!(%client_id, "replacing the previous link of a re-registered client");
            let _ = displaced.protocol.close().await;
        }
        info!(
            %client_id,
            client_type = ?message.client_type,
            target_id = ?message.target_id,
            %peer,
            "client registered"
        );

        self.receive_loop(&client_id, &protocol, stop).await;
        self.release(&client_id, connection, &protocol).await;
    }

    async fn receive_loop(&self, client_id: &str, protocol: &AipProtocol, mut stop: StopSignal) {
        loop {
            let received = tokio::select! {
                () = stop.stopped() => break,
                received = protocol.receive_message::<ClientMessage>() => received,
            };
            let message = match received {
                Ok(message) => message,
                Err(err @ ProtocolError::Decode { .. }) => {
                    warn!(%client_id, %err, "dropping undecodable message");
                    continue;
                }
                Err(err) => {
                    if err.is_connection_error() {
                        info!(%client_id, "client disconnected");
                    } else {
                        warn!(%client_id, %err, "receive failed");
                    }
                    break;
                }
            };
            self.inner.tap.publish(&message);
            if let Err(err) = validate_client_message(&message) {
                warn!(%client_id, %err, "invalid message");
                let mut reply = ServerMessage::new(ServerMessageType::Error)
                    .with_status(TaskStatus::Error)
                    .with_error(err.to_string());
                reply.response_id = message.request_id.clone();
                let _ = protocol.send_message(&reply).await;
                continue;
            }
            self.dispatch(client_id, protocol, message).await;
        }
    }

    async fn dispatch(&self, client_id: &str, protocol: &AipProtocol, message: ClientMessage) {
        match message.kind {
            ClientMessageType::Heartbeat => {
                let heartbeat = HeartbeatProtocol::new(protocol.clone());
                if let Err(err) = heartbeat.send_heartbeat_ack(message.request_id).await {
                    warn!(%client_id, %err, "heartbeat ack failed");
                }
            }
            ClientMessageType::Task => self.start_session(client_id, message).await,
            ClientMessageType::CommandResults | ClientMessageType::Error => {
                if !protocol.route_result(&message) {
                    debug!(%client_id, kind = message.kind.as_str(), "no command batch waiting");
                }
            }
            ClientMessageType::DeviceInfoRequest => {
                let target = message.target_id.unwrap_or_default();
                let info = DeviceInfoProtocol::new(protocol.clone());
                let sent = match self.device_info(&target) {
                    Some(details) => {
                        info.send_device_info_response(Some(details), message.request_id, None)
                            .await
                    }
                    None => {
                        info.send_device_info_response(
                            None,
                            message.request_id,
                            Some(format!("Device '{target}' not found")),
                        )
                        .await
                    }
                };
                if let Err(err) = sent {
                    warn!(%client_id, %err, "device info response failed");
                }
            }
            ClientMessageType::Register => {
                warn!(%client_id, "ignoring repeated registration");
            }
        }
    }

    async fn start_session(&self, requester_id: &str, message: ClientMessage) {
        let device_id = match message.client_type {
            ClientType::Device => message.client_id.clone(),
            ClientType::Constellation => message.target_id.clone().unwrap_or_default(),
        };
        let session_id = message
            .session_id
            .clone()
            .unwrap_or_else(|| CorrelationId::random().into_inner());
        let record = SessionRecord {
            session_id: session_id.clone(),
            device_id: device_id.clone(),
            requester_id: requester_id.to_owned(),
            request_id: message.request_id.clone(),
            task_name: message.task_name.clone(),
        };
        self.inner.sessions.insert(record);

        let Some(device) = self.device_link(&device_id) else {
            warn!(%session_id, %device_id, "task for a device that is not connected");
            self.finish_session(
                &session_id,
                TaskStatus::Failed,
                None,
                Some(format!("Device '{device_id}' is not connected")),
            )
            .await;
            return;
        };

        let assignment = TaskAssignment {
            session_id: session_id.clone(),
            task_name: message.task_name.clone(),
            request: message.request.clone(),
            metadata: message.metadata.clone(),
        };
        let tasks = TaskExecutionProtocol::new(device.protocol.clone());
        if let Err(err) = tasks.send_task_assignment(assignment).await {
            warn!(%session_id, %device_id, %err, "task assignment failed");
            self.finish_session(&session_id, TaskStatus::Failed, None, Some(err.to_string()))
                .await;
            return;
        }

        let mut context = TaskContext::new(
            session_id.clone(),
            device_id.clone(),
            requester_id.to_owned(),
            CommandProtocol::new(device.protocol),
            self.inner.config.command_timeout(),
        );
        context.task_name = message.task_name;
        context.request = message.request;
        context.metadata = message.metadata;

        let server = self.clone();
        let spawned = lock(&self.inner.scheduler).spawn(async move {
            server.run_session(context).await;
        });
        match spawned {
            Ok(handle) => {
                self.inner.sessions.attach(&session_id, handle.abort_handle());
                info!(%session_id, %device_id, %requester_id, "task session started");
            }
            Err(err) => {
                self.finish_session(&session_id, TaskStatus::Failed, None, Some(err.to_string()))
                    .await;
            }
        }
    }

    async fn run_session(&self, context: TaskContext) {
        let session_id = context.session_id.clone();
        let timeout = self.inner.config.task_timeout();
        let outcome = self
            .inner
            .timeouts
            .with_timeout(
                self.inner.session_manager.execute_task(context),
                Some(timeout),
                "task execution",
            )
            .await;
        let (status, result, error) = match outcome {
            Ok(result) => (TaskStatus::Completed, result, None),
            Err(err) => {
                if err.is_elapsed() {
                    if let Err(cancel) = self
                        .inner
                        .session_manager
                        .cancel_task(&session_id, "task timed out")
                        .await
                    {
                        warn!(%session_id, ?cancel, "cancelling a timed out task failed");
                    }
                }
                (TaskStatus::Failed, None, Some(err.to_string()))
            }
        };
        self.finish_session(&session_id, status, result, error).await;
    }

    /// Ends a session once: later calls for the same id do nothing.
    async fn finish_session(
        &self,
        session_id: &str,
        status: TaskStatus,
        result: Option<Value>,
        error: Option<String>,
    ) {
        let Some(record) = self.inner.sessions.remove(session_id) else {
            return;
        };
        info!(%session_id, ?status, device_id = %record.device_id, "task session ended");

        if record.requester_id != record.device_id {
            if let Some(device) = self.device_link(&record.device_id) {
                let tasks = TaskExecutionProtocol::new(device.protocol);
                if let Err(err) = tasks
                    .send_task_end(session_id, status, result.clone(), error.clone(), None)
                    .await
                {
                    debug!(%session_id, %err, "task end not delivered to device");
                }
            }
        }
        self.notify_requester(&record, status, result, error).await;
    }

    async fn notify_requester(
        &self,
        record: &SessionRecord,
        status: TaskStatus,
        result: Option<Value>,
        error: Option<String>,
    ) {
        let Some(requester) = self.link(&record.requester_id) else {
            debug!(requester_id = %record.requester_id, "requester gone; task end dropped");
            return;
        };
        let tasks = TaskExecutionProtocol::new(requester.protocol);
        if let Err(err) = tasks
            .send_task_end(
                &record.session_id,
                status,
                result,
                error,
                record.request_id.clone(),
            )
            .await
        {
            warn!(requester_id = %record.requester_id, %err, "task end not delivered");
        }
    }

    async fn release(&self, client_id: &str, connection: u64, protocol: &AipProtocol) {
        let removed = {
            let mut clients = lock(&self.inner.clients);
            match clients.get(client_id) {
                Some(link) if link.connection == connection => clients.remove(client_id),
                _ => None,
            }
        };
        let _ = protocol.close().await;
        let Some(link) = removed else {
            return;
        };
        info!(%client_id, target_id = ?link.target_id, "client link released");
        if link.client_type == ClientType::Device {
            self.inner.strategy.handle_disconnection(self, client_id).await;
        }
    }
}

#[async_trait]
impl DeviceRecovery for DeviceServerEndpoint {
    async fn reconnect_device(&self, device_id: &str) -> bool {
        debug!(%device_id, "devices reconnect on their own; nothing to dial");
        false
    }

    async fn cancel_device_tasks(&self, device_id: &str, reason: &str) -> Result<(), RecoveryError> {
        let sessions = self.inner.session_lookup.get_device_sessions(device_id);
        let mut failures = Vec::new();
        for session_id in sessions {
            if let Err(err) = self.inner.session_manager.cancel_task(&session_id, reason).await {
                error!(%device_id, %session_id, ?err, "session cancellation failed");
                failures.push(format!("{session_id}: {err:#}"));
            }
            if let Some(record) = self.inner.sessions.abort(&session_id) {
                if record.requester_id != device_id {
                    self.notify_requester(
                        &record,
                        TaskStatus::Failed,
                        None,
                        Some(format!("Device '{device_id}' disconnected: {reason}")),
                    )
                    .await;
                }
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(RecoveryError::new(device_id, failures.join("; ")))
        }
    }

    async fn on_device_disconnected(&self, device_id: &str) -> Result<(), RecoveryError> {
        let link = {
            let mut clients = lock(&self.inner.clients);
            match clients.get(device_id) {
                Some(link) if link.client_type == ClientType::Device => clients.remove(device_id),
                _ => None,
            }
        };
        if let Some(link) = link {
            let _ = link.protocol.close().await;
        }
        info!(%device_id, "device disconnected");
        Ok(())
    }
}

#[async_trait]
impl AipEndpoint for DeviceServerEndpoint {
    type Inbound = ClientMessage;
    type Outbound = Addressed<ServerMessage>;

    async fn start(&self) -> EndpointResult<()> {
        let inner = &self.inner;
        inner.lifecycle.transition(EndpointEvent::Start)?;
        *lock(&inner.scheduler) = SessionScheduler::new(inner.config.max_sessions());

        if let Some(addr) = inner.bind {
            let listener = match TcpListener::bind(addr).await {
                Ok(listener) => listener,
                Err(source) => {
                    let _ = inner.lifecycle.transition(EndpointEvent::ConnectFailed);
                    return Err(EndpointError::Bind { addr, source });
                }
            };
            let local = listener.local_addr().unwrap_or(addr);
            *lock(&inner.local_addr) = Some(local);
            let server = self.clone();
            let task = BackgroundTask::spawn("aip-listener", move |stop| {
                server.accept_loop(listener, stop)
            });
            *lock(&inner.listener) = Some(task);
            info!(addr = %local, "device server listening");
        }

        inner.lifecycle.transition(EndpointEvent::Connected)?;
        Ok(())
    }

    async fn stop(&self) -> EndpointResult<()> {
        let inner = &self.inner;
        inner.lifecycle.transition(EndpointEvent::Stop)?;

        let listener = lock(&inner.listener).take();
        if let Some(listener) = listener {
            listener.stop().await;
        }
        lock(&inner.scheduler).close();

        let mut connections: Vec<_> = lock(&inner.connections).drain().collect();
        connections.sort_by_key(|(id, _)| *id);
        for (_, task) in connections {
            task.stop().await;
        }
        let links: Vec<_> = lock(&inner.clients).drain().map(|(_, link)| link).collect();
        for link in links {
            let _ = link.protocol.close().await;
        }
        *lock(&inner.local_addr) = None;
        info!("device server stopped");
        Ok(())
    }

    async fn handle_message(&self, message: ClientMessage) -> EndpointResult<()> {
        let link = self
            .link(&message.client_id)
            .ok_or_else(|| EndpointError::UnknownClient {
                client_id: message.client_id.clone(),
            })?;
        validate_client_message(&message)?;
        let client_id = message.client_id.clone();
        self.dispatch(&client_id, &link.protocol, message).await;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.inner.lifecycle.state().is_running()
    }

    fn state(&self) -> EndpointState {
        self.inner.lifecycle.state()
    }

    async fn send_with_timeout(
        &self,
        message: Addressed<ServerMessage>,
        timeout: Duration,
    ) -> EndpointResult<()> {
        let link = self
            .link(&message.client_id)
            .ok_or_else(|| EndpointError::UnknownClient {
                client_id: message.client_id.clone(),
            })?;
        self.inner
            .timeouts
            .with_timeout(
                link.protocol.send_message(&message.message),
                Some(timeout),
                "send",
            )
            .await?;
        Ok(())
    }

    async fn receive_with_timeout(
        &self,
        kind: ClientMessageType,
        timeout: Duration,
    ) -> EndpointResult<ClientMessage> {
        self.inner.tap.wait_for_kind(kind, timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aip_primitives::{Command, CommandResult};
    use aip_protocol::{RegistrationProtocol, TaskRequest};
    use aip_transport::MemoryTransport;
    use serde_json::json;

    /// Runs one command per task and cancels on request; cancelling
    /// `fail_cancel` sessions reports an error.
    #[derive(Default)]
    struct Sessions {
        cancelled: Mutex<Vec<String>>,
        fail_cancel: Mutex<Vec<String>>,
        hang: bool,
    }

    #[async_trait]
    impl SessionManager for Sessions {
        async fn execute_task(&self, context: TaskContext) -> anyhow::Result<Option<Value>> {
            if self.hang {
                std::future::pending::<()>().await;
            }
            let results = context
                .execute_commands(vec![Command::new("echo").with_call_id("c1")])
                .await?;
            Ok(Some(json!({ "results": results.len() })))
        }

        async fn cancel_task(&self, session_id: &str, _reason: &str) -> anyhow::Result<()> {
            lock(&self.cancelled).push(session_id.to_owned());
            if lock(&self.fail_cancel).iter().any(|id| id == session_id) {
                anyhow::bail!("session {session_id} refused to stop");
            }
            Ok(())
        }
    }

    async fn running_server(sessions: Arc<Sessions>) -> DeviceServerEndpoint {
        let server = DeviceServerEndpoint::builder(sessions).build().unwrap();
        server.start().await.unwrap();
        server
    }

    async fn register_device(server: &DeviceServerEndpoint, device_id: &str) -> AipProtocol {
        let (client_end, server_end) = MemoryTransport::pair();
        server.serve_transport(Arc::new(server_end)).unwrap();
        let protocol = AipProtocol::new(Arc::new(client_end));
        let outcome = RegistrationProtocol::new(protocol.clone())
            .register(
                RegistrationProtocol::device_registration(
                    device_id,
                    json!({ "os": "linux" }).as_object().cloned().unwrap_or_default(),
                    "linux",
                ),
                Duration::from_secs(1),
            )
            .await;
        assert!(outcome.success, "{outcome:?}");
        wait_until(|| server.is_device_connected(device_id)).await;
        protocol
    }

    async fn register_constellation(
        server: &DeviceServerEndpoint,
        constellation_id: &str,
        device_id: &str,
    ) -> (AipProtocol, aip_protocol::RegistrationResult) {
        let (client_end, server_end) = MemoryTransport::pair();
        server.serve_transport(Arc::new(server_end)).unwrap();
        let protocol = AipProtocol::new(Arc::new(client_end));
        let outcome = RegistrationProtocol::new(protocol.clone())
            .register(
                RegistrationProtocol::constellation_registration(
                    constellation_id,
                    device_id,
                    Metadata::new(),
                ),
                Duration::from_secs(1),
            )
            .await;
        (protocol, outcome)
    }

    async fn wait_until(check: impl Fn() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn constellation_needs_a_connected_target() {
        let server = running_server(Arc::default()).await;
        let (_link, outcome) = register_constellation(&server, "const1", "dev1").await;
        assert!(!outcome.success);
        assert_eq!(
            outcome.error.as_deref(),
            Some("Target device 'dev1' is not connected")
        );

        let _device = register_device(&server, "dev1").await;
        let (_link, outcome) = register_constellation(&server, "const1@dev1", "dev1").await;
        assert!(outcome.success);
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn answers_heartbeats_and_device_info() {
        let server = running_server(Arc::default()).await;
        let _device = register_device(&server, "dev1").await;
        let (link, _) = register_constellation(&server, "const1@dev1", "dev1").await;

        let heartbeat = HeartbeatProtocol::new(link.clone()).with_client_type(ClientType::Constellation);
        heartbeat.send_heartbeat("const1@dev1", None).await.unwrap();
        let ack: ServerMessage = link.receive_message().await.unwrap();
        assert_eq!(ack.kind, ServerMessageType::Heartbeat);

        let info = DeviceInfoProtocol::new(link.clone());
        let pending = tokio::spawn({
            let info = info.clone();
            async move {
                info.request_device_info("const1@dev1", "dev1", None, Duration::from_secs(1))
                    .await
            }
        });
        let reply: ServerMessage = link.receive_message().await.unwrap();
        assert!(link.route_reply(&reply));
        let details = pending.await.unwrap().unwrap();
        assert_eq!(details["os"], "linux");
        assert_eq!(details["device_id"], "dev1");

        let missing = tokio::spawn(async move {
            info.request_device_info("const1@dev1", "ghost", None, Duration::from_secs(1))
                .await
        });
        let reply: ServerMessage = link.receive_message().await.unwrap();
        assert!(link.route_reply(&reply));
        let err = missing.await.unwrap().unwrap_err();
        assert!(err.to_string().contains("Device 'ghost' not found"));
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn task_runs_commands_on_the_device_and_ends_at_the_requester() {
        let server = running_server(Arc::default()).await;
        let device = register_device(&server, "dev1").await;
        let (link, _) = register_constellation(&server, "const1@dev1", "dev1").await;

        let requester = TaskExecutionProtocol::new(link.clone());
        let reply = requester
            .dispatch_task(
                "const1@dev1",
                ClientType::Constellation,
                TaskRequest::new("notes", "open notes").for_device("dev1"),
            )
            .await
            .unwrap();

        let assignment: ServerMessage = device.receive_message().await.unwrap();
        assert_eq!(assignment.kind, ServerMessageType::Task);
        assert_eq!(assignment.task_name.as_deref(), Some("notes"));

        let command: ServerMessage = device.receive_message().await.unwrap();
        assert_eq!(command.kind, ServerMessageType::Command);
        TaskExecutionProtocol::new(device.clone())
            .send_command_results(
                "dev1",
                command.session_id.clone(),
                vec![CommandResult::success(Some("c1".into()), json!("ok"))],
                command.response_id.clone().unwrap(),
                TaskStatus::Continue,
            )
            .await
            .unwrap();

        let end: ServerMessage = device.receive_message().await.unwrap();
        assert_eq!(end.kind, ServerMessageType::TaskEnd);
        assert_eq!(end.status, TaskStatus::Completed);

        let outcome: ServerMessage = link.receive_message().await.unwrap();
        assert!(requester.handle_task_end(&outcome));
        let outcome = reply.wait().await.unwrap();
        assert_eq!(outcome.result, Some(json!({ "results": 1 })));
        assert_eq!(outcome.session_id, assignment.session_id);
        assert!(server.sessions().is_empty());
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn invalid_messages_get_an_error_reply() {
        let server = running_server(Arc::default()).await;
        let device = register_device(&server, "dev1").await;

        let task = ClientMessage::new(ClientMessageType::Task, "dev1", ClientType::Device);
        device.send_message(&task).await.unwrap();
        let reply: ServerMessage = device.receive_message().await.unwrap();
        assert_eq!(reply.kind, ServerMessageType::Error);
        assert!(reply.error.unwrap().contains("request_id"));
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn cancel_device_tasks_attempts_every_session() {
        let sessions = Arc::new(Sessions {
            hang: true,
            ..Sessions::default()
        });
        let server = running_server(Arc::clone(&sessions)).await;
        let device = register_device(&server, "dev1").await;
        let (link, _) = register_constellation(&server, "const1@dev1", "dev1").await;

        let requester = TaskExecutionProtocol::new(link.clone());
        for name in ["first", "second"] {
            requester
                .send_task_request(
                    "const1@dev1",
                    ClientType::Constellation,
                    TaskRequest::new(name, "run").for_device("dev1"),
                    CorrelationId::random(),
                )
                .await
                .unwrap();
            let _assignment: ServerMessage = device.receive_message().await.unwrap();
        }
        wait_until(|| server.sessions().len() == 2).await;

        let ids = server.sessions().get_device_sessions("dev1");
        lock(&sessions.fail_cancel).push(ids[0].clone());

        let err = server
            .cancel_device_tasks("dev1", "device_disconnected")
            .await
            .unwrap_err();
        assert!(err.reason.contains(&ids[0]));
        assert_eq!(*lock(&sessions.cancelled), ids);
        assert!(server.sessions().is_empty());

        for _ in 0..2 {
            let end: ServerMessage = link.receive_message().await.unwrap();
            assert_eq!(end.kind, ServerMessageType::TaskEnd);
            assert_eq!(end.status, TaskStatus::Failed);
        }
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn device_loss_runs_recovery_once() {
        let sessions = Arc::new(Sessions {
            hang: true,
            ..Sessions::default()
        });
        let server = running_server(Arc::clone(&sessions)).await;
        let device = register_device(&server, "dev1").await;
        let (link, _) = register_constellation(&server, "const1@dev1", "dev1").await;

        TaskExecutionProtocol::new(link.clone())
            .send_task_request(
                "const1@dev1",
                ClientType::Constellation,
                TaskRequest::new("t", "r").for_device("dev1"),
                CorrelationId::random(),
            )
            .await
            .unwrap();
        let _assignment: ServerMessage = device.receive_message().await.unwrap();
        wait_until(|| server.sessions().len() == 1).await;

        device.close().await.unwrap();
        wait_until(|| !server.is_device_connected("dev1")).await;
        let end: ServerMessage = link.receive_message().await.unwrap();
        assert_eq!(end.status, TaskStatus::Failed);
        assert_eq!(lock(&sessions.cancelled).len(), 1);
        assert!(!server.reconnect_device("dev1").await);
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn requires_running_state_and_restarts() {
        let server = DeviceServerEndpoint::builder(Arc::new(Sessions::default()))
            .build()
            .unwrap();
        let (_client, server_end) = MemoryTransport::pair();
        assert!(matches!(
            server.serve_transport(Arc::new(server_end)),
            Err(EndpointError::NotRunning { .. })
        ));

        server.start().await.unwrap();
        server.stop().await.unwrap();
        assert_eq!(server.state(), EndpointState::Stopped);
        server.start().await.unwrap();
        let _device = register_device(&server, "dev1").await;
        assert_eq!(server.connected_clients(), ["dev1"]);
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn tap_sees_inbound_messages() {
        let server = running_server(Arc::default()).await;
        let device = register_device(&server, "dev1").await;

        let waiter = tokio::spawn({
            let server = server.clone();
            async move {
                server
                    .receive_with_timeout(ClientMessageType::Heartbeat, Duration::from_secs(1))
                    .await
            }
        });
        let heartbeat = ClientMessage::new(ClientMessageType::Heartbeat, "dev1", ClientType::Device);
        // the waiter only sees messages sent after it subscribed
        while !waiter.is_finished() {
            device.send_message(&heartbeat).await.unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let message = waiter.await.unwrap().unwrap();
        assert_eq!(message.client_id, "dev1");
        server.stop().await.unwrap();
    }
}
