//! Device-side endpoint: one link to the server.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use aip_extensions::ExtensionChain;
use aip_primitives::{
    BackgroundTask, ClientMessage, ClientType, Command, CommandResult, Metadata, ServerMessage,
    ServerMessageType, TaskStatus,
};
use aip_protocol::{AipProtocol, RegistrationProtocol, TaskExecutionProtocol, TaskRequest};
use aip_resilience::{DeviceRecovery, ReconnectionStrategy, RecoveryError, TimeoutManager};
use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::{
    AipEndpoint, CommandDispatcher, Connector, EndpointConfig, EndpointError, EndpointEvent,
    EndpointResult, EndpointState, InboundTap, Lifecycle, WebSocketConnector, lock,
};
use crate::link::{Link, LinkGate, LinkOwner, LinkRequest};

/// Builder for [`DeviceClientEndpoint`].
pub struct DeviceClientBuilder {
    server_url: String,
    device_id: String,
    dispatcher: Arc<dyn CommandDispatcher>,
    platform: String,
    metadata: Metadata,
    config: EndpointConfig,
    extensions: ExtensionChain,
    connector: Option<Arc<dyn Connector>>,
}

impl DeviceClientBuilder {
    /// Platform advertised at registration. Defaults to the host OS.
    #[must_use]
    pub fn platform(mut self, platform: impl Into<String>) -> Self {
        self.platform = platform.into();
        self
    }

    /// Metadata advertised at registration.
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
    pub fn build(self) -> EndpointResult<DeviceClientEndpoint> {
        self.config.validate()?;
        let connector = self
            .connector
            .unwrap_or_else(|| Arc::new(WebSocketConnector::new(self.config.transport())) as Arc<dyn Connector>);
        Ok(DeviceClientEndpoint {
            inner: Arc::new(ClientInner {
                lifecycle: Lifecycle::new(self.device_id.clone()),
                device_id: self.device_id,
                server_url: self.server_url,
                platform: self.platform,
                metadata: self.metadata,
                dispatcher: self.dispatcher,
                connector,
                strategy: ReconnectionStrategy::new(*self.config.reconnection()),
                timeouts: TimeoutManager::new(self.config.default_timeout()),
                tap: InboundTap::new(self.config.tap_capacity()),
                config: self.config,
                extensions: self.extensions,
                link: Mutex::new(None),
                connecting: tokio::sync::Mutex::new(()),
                recovery: Mutex::new(None),
            }),
        })
    }
}

struct ClientInner {
    device_id: String,
    server_url: String,
    platform: String,
    metadata: Metadata,
    dispatcher: Arc<dyn CommandDispatcher>,
    connector: Arc<dyn Connector>,
    config: EndpointConfig,
    extensions: ExtensionChain,
    lifecycle: Lifecycle,
    strategy: ReconnectionStrategy,
    timeouts: TimeoutManager,
    tap: InboundTap<ServerMessage>,
    link: Mutex<Option<Link>>,
    connecting: tokio::sync::Mutex<()>,
    recovery: Mutex<Option<BackgroundTask>>,
}

/// Device agent endpoint holding a single link to the server.
///
/// The link registers, heartbeats and answers COMMAND batches through the
/// host [`CommandDispatcher`]. When it drops, a recovery task cancels the
/// pending requests and reconnects per the configured policy. Call
/// [`stop`](AipEndpoint::stop) to release the background tasks.
#[derive(Clone)]
pub struct DeviceClientEndpoint {
    inner: Arc<ClientInner>,
}

impl fmt::Debug for DeviceClientEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceClientEndpoint")
            .field("device_id", &self.inner.device_id)
            .field("server_url", &self.inner.server_url)
            .field("state", &self.inner.lifecycle.state())
            .finish_non_exhaustive()
    }
}

impl DeviceClientEndpoint {
    /// Starts a builder for `device_id` dialing `server_url`.
    #[must_use]
    pub fn builder(
        server_url: impl Into<String>,
        device_id: impl Into<String>,
        dispatcher: Arc<dyn CommandDispatcher>,
    ) -> DeviceClientBuilder {
        DeviceClientBuilder {
            server_url: server_url.into(),
            device_id: device_id.into(),
            dispatcher,
            platform: std::env::consts::OS.to_owned(),
            metadata: Metadata::new(),
            config: EndpointConfig::default(),
            extensions: ExtensionChain::default(),
            connector: None,
        }
    }

    /// Returns the device id.
    #[must_use]
    pub fn device_id(&self) -> &str {
        &self.inner.device_id
    }

    /// Returns the server URL.
    #[must_use]
    pub fn server_url(&self) -> &str {
        &self.inner.server_url
    }

    /// Returns the reconnection strategy driving recovery.
    #[must_use]
    pub fn reconnection(&self) -> &ReconnectionStrategy {
        &self.inner.strategy
    }

    /// Subscribes to every message received from the server.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ServerMessage> {
        self.inner.tap.subscribe()
    }

    /// Subscribes to lifecycle changes.
    #[must_use]
    pub fn watch_state(&self) -> tokio::sync::watch::Receiver<EndpointState> {
        self.inner.lifecycle.subscribe()
    }

    /// Submits a task as this device and waits for its TASK_END.
    ///
    /// # Errors
    ///
    /// Returns [`EndpointError::NotConnected`] without a link, or the protocol
    /// failure, including a timeout after the configured task deadline.
    pub async fn request_task(&self, task: TaskRequest) -> EndpointResult<ServerMessage> {
        let protocol = self.current_protocol()?;
        let tasks = TaskExecutionProtocol::new(protocol);
        let reply = tasks
            .dispatch_task(&self.inner.device_id, ClientType::Device, task)
            .await?;
        Ok(reply.wait_timeout(self.inner.config.task_timeout()).await?)
    }

    fn current_protocol(&self) -> EndpointResult<AipProtocol> {
        lock(&self.inner.link)
            .as_ref()
            .map(|link| link.protocol().clone())
            .ok_or_else(|| EndpointError::NotConnected {
                target: self.inner.server_url.clone(),
            })
    }

    /// Opens and stores a fresh link. Its listener stays parked until the
    /// caller has moved the lifecycle to running and opened the gate.
    async fn connect_once(&self) -> EndpointResult<LinkGate> {
        let _connecting = self.inner.connecting.lock().await;
        let inner = &self.inner;
        let registration = RegistrationProtocol::device_registration(
            &inner.device_id,
            inner.metadata.clone(),
            &inner.platform,
        );
        let (link, gate) = Link::open(
            self.clone(),
            LinkRequest {
                connector: inner.connector.as_ref(),
                url: &inner.server_url,
                key: &inner.device_id,
                registration,
                config: &inner.config,
                extensions: &inner.extensions,
            },
        )
        .await?;
        let previous = lock(&inner.link).replace(link);
        if let Some(previous) = previous {
            previous.shutdown().await;
        }
        info!(device_id = %inner.device_id, server_url = %inner.server_url, "device linked to server");
        Ok(gate)
    }

    async fn teardown(&self) {
        let link = lock(&self.inner.link).take();
        if let Some(link) = link {
            link.shutdown().await;
        }
    }

    async fn handle_server_message(&self, protocol: &AipProtocol, message: ServerMessage) {
        match message.kind {
            ServerMessageType::Command => self.execute_batch(protocol, message).await,
            ServerMessageType::Task => {
                info!(
                    device_id = %self.inner.device_id,
                    session_id = ?message.session_id,
                    task_name = ?message.task_name,
                    "task assigned"
                );
            }
            _ => {
                if !protocol.route_reply(&message) {
                    debug!(kind = message.kind.as_str(), "unsolicited server message");
                }
            }
        }
    }

    async fn execute_batch(&self, protocol: &AipProtocol, message: ServerMessage) {
        let Some(response_id) = message.response_id else {
            warn!("command batch without response_id ignored");
            return;
        };
        let commands = message.actions;
        let outcome = self
            .inner
            .timeouts
            .with_timeout(
                self.inner.dispatcher.execute_commands(&commands),
                Some(self.inner.config.command_timeout()),
                "command execution",
            )
            .await;
        let (results, status) = match outcome {
            Ok(results) => (align_results(&commands, results), TaskStatus::Continue),
            Err(err) => {
                let reason = err.to_string();
                let failed = commands
                    .iter()
                    .map(|command| CommandResult::failure(command.call_id.clone(), reason.clone()))
                    .collect();
                (failed, TaskStatus::Error)
            }
        };
        let tasks = TaskExecutionProtocol::new(protocol.clone());
        if let Err(err) = tasks
            .send_command_results(
                &self.inner.device_id,
                message.session_id,
                results,
                response_id,
                status,
            )
            .await
        {
            warn!(device_id = %self.inner.device_id, %err, "command results not delivered");
        }
    }

    /// Starts recovery when `lost` is still the current link and this is the
    /// first loss observed for it.
    fn connection_lost(&self, lost: &AipProtocol) {
        let current = lock(&self.inner.link)
            .as_ref()
            .is_some_and(|link| link.protocol().same_connection(lost));
        if !current || self.inner.lifecycle.transition(EndpointEvent::ConnectionLost).is_err() {
            return;
        }
        let client = self.clone();
        let task = BackgroundTask::spawn(
            format!("recovery-{}", self.inner.device_id),
            move |mut stop| async move {
                tokio::select! {
                    () = stop.stopped() => {}
                    () = client.recover() => {}
                }
            },
        );
        let _finished = lock(&self.inner.recovery).replace(task);
    }

    async fn recover(&self) {
        if self.inner.lifecycle.transition(EndpointEvent::Reconnect).is_err() {
            return;
        }
        let device_id = self.inner.device_id.clone();
        let outcome = self.inner.strategy.handle_disconnection(self, &device_id).await;
        if !outcome.success {
            let _ = self.inner.lifecycle.transition(EndpointEvent::ConnectFailed);
            error!(%device_id, attempts = outcome.attempts, "device stays disconnected");
        }
    }
}

/// Pairs dispatcher results with commands by position: missing results
/// become failures, extras are dropped, absent call ids are filled in.
fn align_results(commands: &[Command], results: Vec<CommandResult>) -> Vec<CommandResult> {
    if results.len() != commands.len() {
        warn!(
            commands = commands.len(),
            results = results.len(),
            "dispatcher result count does not match the batch"
        );
    }
    let mut results = results.into_iter();
    commands
        .iter()
        .map(|command| match results.next() {
            Some(mut result) => {
                if result.call_id.is_none() {
                    result.call_id.clone_from(&command.call_id);
                }
                result
            }
            None => CommandResult::failure(command.call_id.clone(), "no result returned for command"),
        })
        .collect()
}

#[async_trait]
impl LinkOwner for DeviceClientEndpoint {
    async fn on_message(&self, protocol: &AipProtocol, message: ServerMessage) {
        self.inner.tap.publish(&message);
        self.handle_server_message(protocol, message).await;
    }

    fn on_lost(&self, _key: &str, protocol: &AipProtocol) {
        self.connection_lost(protocol);
    }
}

#[async_trait]
impl DeviceRecovery for DeviceClientEndpoint {
    async fn reconnect_device(&self, device_id: &str) -> bool {
        if device_id != self.inner.device_id {
            return false;
        }
        let explicit = match self.inner.lifecycle.state() {
            EndpointState::Running => return true,
            EndpointState::Starting | EndpointState::Reconnecting => false,
            EndpointState::Disconnected => {
                if self.inner.lifecycle.transition(EndpointEvent::Reconnect).is_err() {
                    return false;
                }
                true
            }
            EndpointState::Created | EndpointState::Stopped => return false,
        };
        match self.connect_once().await {
            Ok(gate) => {
                if self.inner.lifecycle.transition(EndpointEvent::Connected).is_ok() {
                    gate.open();
                    true
                } else {
                    self.teardown().await;
                    false
                }
            }
            Err(err) => {
                warn!(%device_id, %err, "reconnection attempt failed");
                if explicit {
                    let _ = self.inner.lifecycle.transition(EndpointEvent::ConnectFailed);
                }
                false
            }
        }
    }

    async fn cancel_device_tasks(&self, device_id: &str, reason: &str) -> Result<(), RecoveryError> {
        let protocol = lock(&self.inner.link)
            .as_ref()
            .map(|link| link.protocol().clone());
        if let Some(protocol) = protocol {
            let failed = protocol.fail_pending(reason);
            debug!(%device_id, failed, "pending requests failed");
        }
        Ok(())
    }

    async fn on_device_disconnected(&self, device_id: &str) -> Result<(), RecoveryError> {
        self.teardown().await;
        info!(%device_id, "device link torn down");
        Ok(())
    }
}

#[async_trait]
impl AipEndpoint for DeviceClientEndpoint {
    type Inbound = ServerMessage;
    type Outbound = ClientMessage;

    async fn start(&self) -> EndpointResult<()> {
        let inner = &self.inner;
        inner.lifecycle.transition(EndpointEvent::Start)?;
        let gate = match self.connect_once().await {
            Ok(gate) => gate,
            Err(err) => {
                warn!(device_id = %inner.device_id, %err, "initial connection failed");
                let outcome = inner.strategy.attempt_reconnection(self, &inner.device_id).await;
                if outcome.success {
                    return Ok(());
                }
                let _ = inner.lifecycle.transition(EndpointEvent::ConnectFailed);
                if outcome.attempts == 0 {
                    return Err(err);
                }
                return Err(EndpointError::ReconnectionExhausted {
                    device_id: inner.device_id.clone(),
                    attempts: outcome.attempts,
                });
            }
        };
        if let Err(err) = inner.lifecycle.transition(EndpointEvent::Connected) {
            self.teardown().await;
            return Err(err.into());
        }
        gate.open();
        Ok(())
    }

    async fn stop(&self) -> EndpointResult<()> {
        self.inner.lifecycle.transition(EndpointEvent::Stop)?;
        let recovery = lock(&self.inner.recovery).take();
        if let Some(recovery) = recovery {
            recovery.stop().await;
        }
        let _connecting = self.inner.connecting.lock().await;
        self.teardown().await;
        info!(device_id = %self.inner.device_id, "device client stopped");
        Ok(())
    }

    async fn handle_message(&self, message: ServerMessage) -> EndpointResult<()> {
        let protocol = self.current_protocol()?;
        self.handle_server_message(&protocol, message).await;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.inner.lifecycle.state().is_running()
            && lock(&self.inner.link)
                .as_ref()
                .is_some_and(|link| link.protocol().is_connected())
    }

    fn state(&self) -> EndpointState {
        self.inner.lifecycle.state()
    }

    async fn send_with_timeout(&self, message: ClientMessage, timeout: Duration) -> EndpointResult<()> {
        let protocol = self.current_protocol()?;
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
    use std::num::NonZeroUsize;

    use aip_resilience::{ReconnectionConfig, ReconnectionPolicy};
    use serde_json::{Value, json};

    use crate::link::testing::ScriptedServer;
    use crate::{DeviceServerEndpoint, InProcessConnector, SessionManager, TaskContext};

    struct Echo;

    #[async_trait]
    impl CommandDispatcher for Echo {
        async fn execute_commands(&self, commands: &[Command]) -> anyhow::Result<Vec<CommandResult>> {
            Ok(commands
                .iter()
                .map(|command| CommandResult::success(None, json!(command.tool_name)))
                .collect())
        }
    }

    struct Stalled;

    #[async_trait]
    impl CommandDispatcher for Stalled {
        async fn execute_commands(&self, _commands: &[Command]) -> anyhow::Result<Vec<CommandResult>> {
            std::future::pending().await
        }
    }

    /// Sends two commands and returns their results as the task result.
    struct TwoCommands;

    #[async_trait]
    impl SessionManager for TwoCommands {
        async fn execute_task(&self, context: TaskContext) -> anyhow::Result<Option<Value>> {
            let results = context
                .execute_commands(vec![
                    Command::new("click").with_call_id("a"),
                    Command::new("type").with_call_id("b"),
                ])
                .await?;
            Ok(Some(serde_json::to_value(results)?))
        }

        async fn cancel_task(&self, _session_id: &str, _reason: &str) -> anyhow::Result<()> {
            Ok(())
        }
    }

    async fn server() -> DeviceServerEndpoint {
        let server = DeviceServerEndpoint::builder(Arc::new(TwoCommands)).build().unwrap();
        server.start().await.unwrap();
        server
    }

    fn quick_retries(attempts: u32) -> EndpointConfig {
        EndpointConfig::default()
            .with_command_timeout(Duration::from_millis(100))
            .with_max_sessions(NonZeroUsize::MIN)
            .with_reconnection(ReconnectionConfig {
                policy: ReconnectionPolicy::Immediate,
                max_retries: attempts,
                ..ReconnectionConfig::default()
            })
    }

    fn device(server: &DeviceServerEndpoint, dispatcher: Arc<dyn CommandDispatcher>) -> DeviceClientEndpoint {
        DeviceClientEndpoint::builder("memory://server", "dev1", dispatcher)
            .platform("test")
            .config(quick_retries(3))
            .connector(Arc::new(InProcessConnector::new(server.clone())))
            .build()
            .unwrap()
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

    #[test]
    fn results_are_aligned_with_commands() {
        let commands = [
            Command::new("a").with_call_id("1"),
            Command::new("b").with_call_id("2"),
        ];
        let short = align_results(&commands, vec![CommandResult::success(None, Value::Null)]);
        assert_eq!(short.len(), 2);
        assert_eq!(short[0].call_id.as_deref(), Some("1"));
        assert_eq!(short[1].error.as_deref(), Some("no result returned for command"));

        let extra = vec![CommandResult::success(Some("x".into()), Value::Null); 3];
        let trimmed = align_results(&commands, extra);
        assert_eq!(trimmed.len(), 2);
        assert_eq!(trimmed[1].call_id.as_deref(), Some("x"));
    }

    #[tokio::test]
    async fn device_task_round_trip() {
        let server = server().await;
        let client = device(&server, Arc::new(Echo));
        client.start().await.unwrap();
        assert!(client.is_connected());
        assert!(server.is_device_connected("dev1"));

        let end = client
            .request_task(TaskRequest::new("demo", "click then type"))
            .await
            .unwrap();
        assert_eq!(end.kind, ServerMessageType::TaskEnd);
        assert_eq!(end.status, TaskStatus::Completed);
        let results: Vec<CommandResult> = serde_json::from_value(end.result.unwrap()).unwrap();
        assert_eq!(results[0].call_id.as_deref(), Some("a"));
        assert_eq!(results[1].result, Some(json!("type")));

        client.stop().await.unwrap();
        assert_eq!(client.state(), EndpointState::Stopped);
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stalled_dispatcher_reports_failures() {
        let server = server().await;
        let client = device(&server, Arc::new(Stalled));
        client.start().await.unwrap();

        let end = client.request_task(TaskRequest::new("demo", "stall")).await.unwrap();
        let results: Vec<CommandResult> = serde_json::from_value(end.result.unwrap()).unwrap();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.status == aip_primitives::ResultStatus::Failure));
        assert!(results[0].error.as_deref().unwrap().contains("timed out"));

        client.stop().await.unwrap();
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn lost_link_is_reestablished() {
        let server = server().await;
        let client = device(&server, Arc::new(Echo));
        client.start().await.unwrap();

        server.on_device_disconnected("dev1").await.unwrap();
        assert!(!server.is_device_connected("dev1"));
        // only a fresh registration can bring the device back
        wait_until(|| server.is_device_connected("dev1") && client.is_connected()).await;

        let end = client.request_task(TaskRequest::new("again", "go")).await.unwrap();
        assert_eq!(end.status, TaskStatus::Completed);
        client.stop().await.unwrap();
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn start_gives_up_after_retries_and_recovers_on_demand() {
        let server = DeviceServerEndpoint::builder(Arc::new(TwoCommands)).build().unwrap();
        let client = device(&server, Arc::new(Echo));

        let err = client.start().await.unwrap_err();
        assert!(matches!(err, EndpointError::ReconnectionExhausted { attempts: 3, .. }));
        assert_eq!(client.state(), EndpointState::Disconnected);
        assert!(!client.is_connected());

        server.start().await.unwrap();
        assert!(client.reconnect_device("dev1").await);
        assert_eq!(client.state(), EndpointState::Running);
        client.stop().await.unwrap();
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stopped_server_leaves_the_device_disconnected() {
        let server = server().await;
        let client = device(&server, Arc::new(Echo));
        client.start().await.unwrap();

        server.stop().await.unwrap();
        wait_until(|| {
            client.reconnection().attempt_count() == 3
                && client.state() == EndpointState::Disconnected
        })
        .await;
        assert!(matches!(
            client.request_task(TaskRequest::new("t", "r")).await,
            Err(EndpointError::NotConnected { .. })
        ));
        client.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn link_dropped_right_after_registration_is_recovered() {
        for _ in 0..20 {
            let connector = Arc::new(ScriptedServer::hanging_up());
            let client = DeviceClientEndpoint::builder("memory://server", "dev1", Arc::new(Echo))
                .config(quick_retries(1))
                .connector(Arc::clone(&connector) as Arc<dyn Connector>)
                .build()
                .unwrap();
            client.start().await.unwrap();

            wait_until(|| client.state() == EndpointState::Disconnected).await;
            assert_eq!(connector.dials(), 2);
            assert!(!client.is_connected());
            client.stop().await.unwrap();
        }
    }
}
