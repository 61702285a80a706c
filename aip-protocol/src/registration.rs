//! Client registration handshake.

use std::time::Duration;

use aip_primitives::{
    ClientMessage, ClientMessageType, ClientType, CorrelationId, Metadata, ServerMessage,
    ServerMessageType, TaskStatus,
};
use chrono::Utc;
use serde_json::Value;
use tracing::{error, info, warn};

use crate::protocol::sub_protocol;
use crate::validation::validate_client_message;
use crate::{ProtocolError, ProtocolResult};

/// Default wait for the server's registration answer.
pub const DEFAULT_REGISTRATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Outcome of a registration attempt. Rejection is an expected outcome, not
/// an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationResult {
    /// `true` when the server accepted the registration.
    pub success: bool,
    /// Reason for rejection or failure.
    pub error: Option<String>,
}

impl RegistrationResult {
    /// Successful registration.
    #[must_use]
    pub const fn accepted() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    /// Failed registration.
    #[must_use]
    pub fn rejected(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
        }
    }
}

sub_protocol!(
    /// Registration handshake: clients announce themselves, the server
    /// confirms or rejects.
    RegistrationProtocol
);

impl RegistrationProtocol {
    /// Builds a device REGISTER message. `platform` and the registration time
    /// are added to the metadata.
    #[must_use]
    pub fn device_registration(device_id: &str, mut metadata: Metadata, platform: &str) -> ClientMessage {
        metadata.insert("platform".into(), Value::from(platform));
        metadata.insert("registration_time".into(), Value::from(Utc::now().to_rfc3339()));
        ClientMessage::new(ClientMessageType::Register, device_id, ClientType::Device)
            .with_metadata(metadata)
            .with_request_id(CorrelationId::random())
    }

    /// Builds a constellation REGISTER message targeting `target_device`.
    #[must_use]
    pub fn constellation_registration(
        constellation_id: &str,
        target_device: &str,
        mut metadata: Metadata,
    ) -> ClientMessage {
        metadata.insert("type".into(), Value::from("constellation_client"));
        metadata.insert("targeted_device_id".into(), Value::from(target_device));
        ClientMessage::new(
            ClientMessageType::Register,
            constellation_id,
            ClientType::Constellation,
        )
        .with_target(target_device)
        .with_metadata(metadata)
        .with_request_id(CorrelationId::random())
    }

    /// Registers a device with [`DEFAULT_REGISTRATION_TIMEOUT`].
    pub async fn register_as_device(
        &self,
        device_id: &str,
        metadata: Metadata,
        platform: &str,
    ) -> RegistrationResult {
        let message = Self::device_registration(device_id, metadata, platform);
        self.register(message, DEFAULT_REGISTRATION_TIMEOUT).await
    }

    /// Registers a constellation targeting `target_device` with
    /// [`DEFAULT_REGISTRATION_TIMEOUT`].
    pub async fn register_as_constellation(
        &self,
        constellation_id: &str,
        target_device: &str,
        metadata: Metadata,
    ) -> RegistrationResult {
        let message = Self::constellation_registration(constellation_id, target_device, metadata);
        self.register(message, DEFAULT_REGISTRATION_TIMEOUT).await
    }

    /// Sends a prepared REGISTER message and waits up to `timeout` for the
    /// answer. Must run before any receive loop is started on the connection.
    pub async fn register(&self, message: ClientMessage, timeout: Duration) -> RegistrationResult {
        let client_id = message.client_id.clone();
        match self.exchange(&message, timeout).await {
            Ok(reply) if reply.status == TaskStatus::Ok && reply.kind != ServerMessageType::Error => {
                info!(%client_id, client_type = ?message.client_type, "registration accepted");
                RegistrationResult::accepted()
            }
            Ok(reply) => {
                let reason = reply
                    .error
                    .unwrap_or_else(|| format!("registration rejected with status {:?}", reply.status));
                warn!(%client_id, %reason, "registration rejected");
                RegistrationResult::rejected(reason)
            }
            Err(err) => {
                error!(%client_id, ?err, "registration failed");
                RegistrationResult::rejected(err.to_string())
            }
        }
    }

    async fn exchange(&self, message: &ClientMessage, timeout: Duration) -> ProtocolResult<ServerMessage> {
        self.send_message(message).await?;
        match tokio::time::timeout(timeout, self.receive_message::<ServerMessage>()).await {
            Ok(reply) => reply,
            Err(_) => Err(ProtocolError::Timeout {
                operation: "registration".into(),
                timeout,
            }),
        }
    }

    /// Server side: waits for a valid REGISTER message, skipping anything
    /// else.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Timeout`] when none arrives in time, or the
    /// transport error that ended the connection.
    pub async fn await_registration(&self, timeout: Duration) -> ProtocolResult<ClientMessage> {
        let wait = async {
            loop {
                let message = match self.receive_message::<ClientMessage>().await {
                    Ok(message) => message,
                    Err(err @ ProtocolError::Transport(_)) => return Err(err),
                    Err(err) => {
                        warn!(?err, "ignoring undecodable frame before registration");
                        continue;
                    }
                };
                if message.kind != ClientMessageType::Register {
                    warn!(
                        client_id = %message.client_id,
                        message_type = message.kind.as_str(),
                        "expected register message"
                    );
                    continue;
                }
                return validate_client_message(&message).map(|()| message);
            }
        };
        match tokio::time::timeout(timeout, wait).await {
            Ok(outcome) => outcome,
            Err(_) => Err(ProtocolError::Timeout {
                operation: "awaiting registration".into(),
                timeout,
            }),
        }
    }

    /// Server side: confirms a registration.
    ///
    /// # Errors
    ///
    /// Propagates send failures.
    pub async fn send_registration_confirmation(
        &self,
        response_id: Option<CorrelationId>,
    ) -> ProtocolResult<()> {
        let message = ServerMessage::new(ServerMessageType::Heartbeat)
            .with_status(TaskStatus::Ok)
            .with_response_id(response_id.unwrap_or_default());
        self.send_message(&message).await
    }

    /// Server side: rejects a registration.
    ///
    /// # Errors
    ///
    /// Propagates send failures.
    pub async fn send_registration_error(
        &self,
        error: &str,
        response_id: Option<CorrelationId>,
    ) -> ProtocolResult<()> {
        let message = ServerMessage::new(ServerMessageType::Error)
            .with_status(TaskStatus::Error)
            .with_response_id(response_id.unwrap_or_default())
            .with_error(error);
        self.send_message(&message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use aip_primitives::WireMessage;
    use aip_transport::{Frame, MemoryTransport, Transport};
    use serde_json::json;

    use crate::AipProtocol;

    fn metadata(value: Value) -> Metadata {
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    async fn queued(peer: &MemoryTransport, message: &ServerMessage) {
        peer.send(&message.to_json().unwrap()).await.unwrap();
    }

    #[tokio::test]
    async fn device_registration_round_trip() {
        let (local, peer) = MemoryTransport::pair();
        queued(&peer, &ServerMessage::new(ServerMessageType::Heartbeat)).await;
        let registration = RegistrationProtocol::new(AipProtocol::new(Arc::new(local)));

        let result = registration
            .register_as_device("dev1", metadata(json!({ "platform": "windows" })), "windows")
            .await;
        assert_eq!(result, RegistrationResult::accepted());

        let Some(Frame::Text(sent)) = peer.try_receive() else {
            panic!("registration was not sent");
        };
        assert_eq!(peer.try_receive(), None);
        let sent = ClientMessage::from_json(&sent).unwrap();
        assert_eq!(sent.kind, ClientMessageType::Register);
        assert_eq!(sent.client_id, "dev1");
        assert_eq!(sent.client_type, ClientType::Device);
        assert_eq!(sent.metadata["platform"], "windows");
        assert!(sent.metadata.contains_key("registration_time"));
    }

    #[tokio::test]
    async fn constellation_rejection_is_a_result_not_an_error() {
        let (local, peer) = MemoryTransport::pair();
        let rejection = ServerMessage::new(ServerMessageType::Error)
            .with_status(TaskStatus::Error)
            .with_error("Device not found");
        queued(&peer, &rejection).await;
        let registration = RegistrationProtocol::new(AipProtocol::new(Arc::new(local)));

        let result = registration
            .register_as_constellation("const1", "dev9", Metadata::new())
            .await;
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("Device not found"));

        let Some(Frame::Text(sent)) = peer.try_receive() else {
            panic!("registration was not sent");
        };
        let sent = ClientMessage::from_json(&sent).unwrap();
        assert_eq!(sent.target_id.as_deref(), Some("dev9"));
        assert_eq!(sent.metadata["type"], "constellation_client");
        assert_eq!(sent.metadata["targeted_device_id"], "dev9");
    }

    #[tokio::test]
    async fn closed_transport_folds_into_failure() {
        let (local, peer) = MemoryTransport::pair();
        peer.close().await.unwrap();
        let registration = RegistrationProtocol::new(AipProtocol::new(Arc::new(local)));

        let result = registration.register_as_device("dev1", Metadata::new(), "linux").await;
        assert!(!result.success);
        assert!(result.error.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn silent_server_times_out() {
        let (local, _peer) = MemoryTransport::pair();
        let registration = RegistrationProtocol::new(AipProtocol::new(Arc::new(local)));
        let message = ClientMessage::new(ClientMessageType::Register, "dev1", ClientType::Device);

        let result = registration.register(message, Duration::from_secs(1)).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn server_skips_noise_until_register() {
        let (client_end, server_end) = MemoryTransport::pair();
        let server = RegistrationProtocol::new(AipProtocol::new(Arc::new(server_end)));

        client_end.send("garbage").await.unwrap();
        let heartbeat = ClientMessage::new(ClientMessageType::Heartbeat, "dev1", ClientType::Device);
        client_end.send(&heartbeat.to_json().unwrap()).await.unwrap();
        let register = ClientMessage::new(ClientMessageType::Register, "dev1", ClientType::Device);
        client_end.send(&register.to_json().unwrap()).await.unwrap();

        let received = server.await_registration(Duration::from_secs(1)).await.unwrap();
        assert_eq!(received.client_id, "dev1");

        server.send_registration_error("nope", None).await.unwrap();
        let Some(Frame::Text(reply)) = client_end.try_receive() else {
            panic!("no reply");
        };
        let reply = ServerMessage::from_json(&reply).unwrap();
        assert_eq!(reply.kind, ServerMessageType::Error);
        assert_eq!(reply.error.as_deref(), Some("nope"));
        assert!(reply.response_id.is_some());
    }
}
