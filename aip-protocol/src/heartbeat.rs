//! Liveness messages and the per-instance heartbeat loop.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use aip_primitives::{
    BackgroundTask, ClientMessage, ClientMessageType, ClientType, CorrelationId, Metadata,
    ServerMessage, ServerMessageType, StopSignal, TaskStatus,
};
use tokio::sync::Mutex;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::{AipProtocol, ProtocolResult};

/// Heartbeat messages plus at most one repeating heartbeat loop.
///
/// Clones share the loop slot, so the "one loop" guarantee holds across
/// clones of the same instance.
#[derive(Clone)]
pub struct HeartbeatProtocol {
    protocol: AipProtocol,
    client_type: ClientType,
    task: Arc<Mutex<Option<BackgroundTask>>>,
}

impl fmt::Debug for HeartbeatProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeartbeatProtocol")
            .field("protocol", &self.protocol)
            .field("client_type", &self.client_type)
            .finish_non_exhaustive()
    }
}

impl std::ops::Deref for HeartbeatProtocol {
    type Target = AipProtocol;

    fn deref(&self) -> &Self::Target {
        &self.protocol
    }
}

impl From<AipProtocol> for HeartbeatProtocol {
    fn from(protocol: AipProtocol) -> Self {
        Self::new(protocol)
    }
}

impl HeartbeatProtocol {
    /// Layers heartbeats over `protocol`, sending as a device.
    #[must_use]
    pub fn new(protocol: AipProtocol) -> Self {
        Self {
            protocol,
            client_type: ClientType::Device,
            task: Arc::new(Mutex::new(None)),
        }
    }

    /// Sets the client role heartbeats are sent under.
    #[must_use]
    pub fn with_client_type(mut self, client_type: ClientType) -> Self {
        self.client_type = client_type;
        self
    }

    /// Returns the shared base protocol.
    #[must_use]
    pub fn protocol(&self) -> &AipProtocol {
        &self.protocol
    }

    /// Sends one client heartbeat.
    ///
    /// # Errors
    ///
    /// Propagates send failures.
    pub async fn send_heartbeat(&self, client_id: &str, metadata: Option<Metadata>) -> ProtocolResult<()> {
        let message = ClientMessage::new(ClientMessageType::Heartbeat, client_id, self.client_type)
            .with_status(TaskStatus::Ok)
            .with_metadata(metadata.unwrap_or_default());
        self.send_message(&message).await
    }

    /// Server side: acknowledges a heartbeat.
    ///
    /// # Errors
    ///
    /// Propagates send failures.
    pub async fn send_heartbeat_ack(&self, response_id: Option<CorrelationId>) -> ProtocolResult<()> {
        let message = ServerMessage::new(ServerMessageType::Heartbeat)
            .with_status(TaskStatus::Ok)
            .with_response_id(response_id.unwrap_or_default());
        self.send_message(&message).await
    }

    /// Starts sending a heartbeat every `interval`, replacing any running
    /// loop. The first heartbeat goes out one interval from now.
    ///
    /// Ticks are skipped while disconnected. A failed send ends the loop;
    /// call this again to resume.
    pub async fn start_heartbeat(&self, client_id: &str, interval: Duration) {
        let mut slot = self.task.lock().await;
        if let Some(previous) = slot.take() {
            previous.stop().await;
        }
        let heartbeat = Self {
            protocol: self.protocol.clone(),
            client_type: self.client_type,
            task: Arc::default(),
        };
        let client_id = client_id.to_owned();
        info!(%client_id, ?interval, "starting heartbeat");
        *slot = Some(BackgroundTask::spawn(format!("heartbeat-{client_id}"), move |stop| {
            heartbeat.run(client_id, interval, stop)
        }));
    }

    /// Stops the loop and waits for it to exit. No heartbeat is sent after
    /// this returns.
    pub async fn stop_heartbeat(&self) {
        let task = self.task.lock().await.take();
        if let Some(task) = task {
            task.stop().await;
        }
    }

    /// Returns `true` while a loop is running.
    pub async fn is_running(&self) -> bool {
        self.task
            .lock()
            .await
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    async fn run(self, client_id: String, period: Duration, mut stop: StopSignal) {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = stop.stopped() => break,
                _ = interval.tick() => {}
            }
            if !self.is_connected() {
                debug!(%client_id, "transport disconnected; skipping heartbeat");
                continue;
            }
            if let Err(err) = self.send_heartbeat(&client_id, None).await {
                warn!(%client_id, ?err, "heartbeat failed; stopping heartbeat loop");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use aip_primitives::WireMessage;
    use aip_transport::{Frame, MemoryTransport, Transport};

    fn drain(peer: &MemoryTransport) -> Vec<ClientMessage> {
        std::iter::from_fn(|| peer.try_receive())
            .map(|frame| match frame {
                Frame::Text(text) => ClientMessage::from_json(&text).unwrap(),
                Frame::Binary(_) => panic!("unexpected binary frame"),
            })
            .collect()
    }

    fn heartbeat_pair() -> (HeartbeatProtocol, MemoryTransport) {
        let (local, peer) = MemoryTransport::pair();
        (HeartbeatProtocol::new(AipProtocol::new(Arc::new(local))), peer)
    }

    #[tokio::test(start_paused = true)]
    async fn sends_one_heartbeat_per_interval() {
        let (heartbeat, peer) = heartbeat_pair();
        heartbeat.start_heartbeat("dev1", Duration::from_millis(20)).await;

        tokio::time::sleep(Duration::from_millis(105)).await;
        heartbeat.stop_heartbeat().await;

        let sent = drain(&peer);
        assert_eq!(sent.len(), 5);
        assert!(sent.iter().all(|m| m.kind == ClientMessageType::Heartbeat && m.client_id == "dev1"));
    }

    #[tokio::test(start_paused = true)]
    async fn restarting_keeps_a_single_loop() {
        let (heartbeat, peer) = heartbeat_pair();
        heartbeat.start_heartbeat("dev1", Duration::from_millis(20)).await;
        heartbeat.start_heartbeat("dev1", Duration::from_millis(20)).await;

        tokio::time::sleep(Duration::from_millis(105)).await;
        heartbeat.stop_heartbeat().await;

        assert_eq!(drain(&peer).len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn nothing_is_sent_after_stop_returns() {
        let (heartbeat, peer) = heartbeat_pair();
        heartbeat.start_heartbeat("dev1", Duration::from_millis(10)).await;
        tokio::time::sleep(Duration::from_millis(35)).await;
        heartbeat.stop_heartbeat().await;
        let before = drain(&peer).len();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(before, 3);
        assert!(drain(&peer).is_empty());
        assert!(!heartbeat.is_running().await);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnected_ticks_are_skipped_without_ending_the_loop() {
        let (heartbeat, peer) = heartbeat_pair();
        heartbeat.transport().close().await.unwrap();
        heartbeat.start_heartbeat("dev1", Duration::from_millis(10)).await;

        tokio::time::sleep(Duration::from_millis(55)).await;
        assert!(heartbeat.is_running().await);
        assert!(drain(&peer).is_empty());
        heartbeat.stop_heartbeat().await;
    }

    #[tokio::test]
    async fn ack_carries_a_response_id() {
        let (heartbeat, peer) = heartbeat_pair();
        heartbeat.send_heartbeat_ack(None).await.unwrap();
        let Some(Frame::Text(text)) = peer.try_receive() else {
            panic!("no ack");
        };
        let ack = ServerMessage::from_json(&text).unwrap();
        assert_eq!(ack.kind, ServerMessageType::Heartbeat);
        assert!(ack.response_id.is_some());
    }
}
