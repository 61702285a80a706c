//! Device information queries.

use std::time::Duration;

use aip_primitives::{
    ClientMessage, ClientMessageType, ClientType, CorrelationId, ServerMessage, ServerMessageType,
    TaskStatus,
};
use serde_json::Value;

use crate::protocol::sub_protocol;
use crate::{ProtocolError, ProtocolResult};

sub_protocol!(
    /// Constellations ask the server what a device advertised at
    /// registration.
    DeviceInfoProtocol
);

impl DeviceInfoProtocol {
    /// Sends a DEVICE_INFO_REQUEST and waits for the matching response.
    ///
    /// The response arrives through the connection's receive loop, which must
    /// hand server messages to [`route_reply`](crate::AipProtocol::route_reply).
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Remote`] when the server reports an error,
    /// [`ProtocolError::Timeout`] when no answer arrives in time, or the
    /// failure that prevented sending.
    pub async fn request_device_info(
        &self,
        constellation_id: &str,
        target_device: &str,
        request_id: Option<CorrelationId>,
        timeout: Duration,
    ) -> ProtocolResult<Value> {
        let request_id = request_id.unwrap_or_default();
        let reply = self.replies().register(request_id.clone())?;
        let message = ClientMessage::new(
            ClientMessageType::DeviceInfoRequest,
            constellation_id,
            ClientType::Constellation,
        )
        .with_target(target_device)
        .with_request_id(request_id);
        self.send_message(&message).await?;

        let response = reply.wait_timeout(timeout).await?;
        if response.status == TaskStatus::Error || response.kind == ServerMessageType::Error {
            return Err(ProtocolError::Remote {
                error: response
                    .error
                    .unwrap_or_else(|| format!("device info for `{target_device}` unavailable")),
            });
        }
        Ok(response.result.unwrap_or(Value::Null))
    }

    /// Server side: answers a device information request.
    ///
    /// # Errors
    ///
    /// Propagates send failures.
    pub async fn send_device_info_response(
        &self,
        device_info: Option<Value>,
        request_id: Option<CorrelationId>,
        error: Option<String>,
    ) -> ProtocolResult<()> {
        let status = if error.is_some() { TaskStatus::Error } else { TaskStatus::Ok };
        let mut message = ServerMessage::new(ServerMessageType::DeviceInfoResponse)
            .with_status(status)
            .with_response_id(request_id.unwrap_or_default());
        message.result = device_info;
        message.error = error;
        self.send_message(&message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use aip_transport::MemoryTransport;
    use serde_json::json;

    use crate::AipProtocol;

    fn pair() -> (DeviceInfoProtocol, DeviceInfoProtocol) {
        let (client_end, server_end) = MemoryTransport::pair();
        (
            DeviceInfoProtocol::new(AipProtocol::new(Arc::new(client_end))),
            DeviceInfoProtocol::new(AipProtocol::new(Arc::new(server_end))),
        )
    }

    #[tokio::test]
    async fn request_waits_for_routed_response() {
        let (client, server) = pair();
        let responder = tokio::spawn({
            let server = server.clone();
            async move {
                let request: ClientMessage = server.receive_message().await.unwrap();
                assert_eq!(request.target_id.as_deref(), Some("dev1"));
                server
                    .send_device_info_response(Some(json!({ "os": "windows" })), request.request_id, None)
                    .await
                    .unwrap();
            }
        });
        let router = tokio::spawn({
            let client = client.clone();
            async move {
                let response: ServerMessage = client.receive_message().await.unwrap();
                assert!(client.route_reply(&response));
            }
        });

        let info = client
            .request_device_info("const1", "dev1", None, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(info, json!({ "os": "windows" }));
        responder.await.unwrap();
        router.await.unwrap();
    }

    #[tokio::test]
    async fn error_response_is_remote_error() {
        let (client, server) = pair();
        let responder = tokio::spawn(async move {
            let request: ClientMessage = server.receive_message().await.unwrap();
            server
                .send_device_info_response(None, request.request_id, Some("Device not found".into()))
                .await
                .unwrap();
        });
        let router = tokio::spawn({
            let client = client.clone();
            async move {
                let response: ServerMessage = client.receive_message().await.unwrap();
                assert!(client.route_reply(&response));
            }
        });

        let err = client
            .request_device_info("const1", "dev1", None, Duration::from_secs(1))
            .await
            .expect_err("server reported an error");
        assert!(matches!(err, ProtocolError::Remote { error } if error == "Device not found"));
        responder.await.unwrap();
        router.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_request_times_out_and_is_removed() {
        let (client, _server) = pair();
        let id = CorrelationId::random();
        let err = client
            .request_device_info("const1", "dev1", Some(id.clone()), Duration::from_millis(50))
            .await
            .expect_err("nobody answers");
        assert!(matches!(err, ProtocolError::Timeout { .. }));
        assert!(!client.replies().contains(&id));
    }
}
