//! Server-side command execution round trip.

use std::time::Duration;

use aip_primitives::{
    ClientMessage, ClientMessageType, Command, CommandResult, CorrelationId, ServerMessage,
    ServerMessageType, TaskStatus,
};
use tracing::debug;

use crate::protocol::sub_protocol;
use crate::{ProtocolError, ProtocolResult};

sub_protocol!(
    /// Pushes command batches to a device and awaits their results.
    CommandProtocol
);

impl CommandProtocol {
    /// Sends `commands` as one COMMAND message and waits up to `timeout` for
    /// the matching COMMAND_RESULTS, which the connection's receive loop must
    /// hand to [`handle_command_results`](Self::handle_command_results).
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Timeout`], [`ProtocolError::Remote`] when the
    /// device answers with an error and no results, or the send failure.
    pub async fn execute_commands(
        &self,
        session_id: &str,
        commands: Vec<Command>,
        timeout: Duration,
    ) -> ProtocolResult<Vec<CommandResult>> {
        let response_id = CorrelationId::random();
        let pending = self.results().register(response_id.clone())?;

        let mut message = ServerMessage::new(ServerMessageType::Command)
            .with_status(TaskStatus::Continue)
            .with_session(session_id)
            .with_response_id(response_id.clone());
        let count = commands.len();
        message.actions = commands;
        self.send_message(&message).await?;
        debug!(%session_id, %response_id, count, "command batch sent");

        let answer = pending.wait_timeout(timeout).await?;
        let failed = answer.kind == ClientMessageType::Error || answer.status == TaskStatus::Error;
        if failed && answer.action_results.is_empty() {
            return Err(ProtocolError::Remote {
                error: answer
                    .error
                    .unwrap_or_else(|| "device failed to execute commands".to_owned()),
            });
        }
        Ok(answer.action_results)
    }

    /// Resolves the batch an inbound COMMAND_RESULTS answers.
    pub fn handle_command_results(&self, message: &ClientMessage) -> bool {
        self.route_result(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use aip_primitives::ClientType;
    use aip_transport::MemoryTransport;
    use serde_json::json;

    use crate::{AipProtocol, TaskExecutionProtocol};

    #[tokio::test]
    async fn executes_a_batch_against_a_device() {
        let (server_end, device_end) = MemoryTransport::pair();
        let commands = CommandProtocol::new(AipProtocol::new(Arc::new(server_end)));
        let device = TaskExecutionProtocol::new(AipProtocol::new(Arc::new(device_end)));

        let device_task = tokio::spawn(async move {
            let batch: ServerMessage = device.receive_message().await.unwrap();
            let results = batch
                .actions
                .iter()
                .map(|command| CommandResult::success(command.call_id.clone(), json!(command.tool_name)))
                .collect();
            device
                .send_command_results("dev1", batch.session_id, results, batch.response_id.unwrap(), TaskStatus::Continue)
                .await
                .unwrap();
        });
        let router = tokio::spawn({
            let commands = commands.clone();
            async move {
                let answer: ClientMessage = commands.receive_message().await.unwrap();
                assert!(commands.handle_command_results(&answer));
            }
        });

        let results = commands
            .execute_commands(
                "s1",
                vec![Command::new("click").with_call_id("1"), Command::new("type").with_call_id("2")],
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[1].result, Some(json!("type")));
        device_task.await.unwrap();
        router.await.unwrap();
    }

    #[tokio::test]
    async fn device_error_without_results_is_remote_error() {
        let (server_end, device_end) = MemoryTransport::pair();
        let commands = CommandProtocol::new(AipProtocol::new(Arc::new(server_end)));
        let device = AipProtocol::new(Arc::new(device_end));

        tokio::spawn(async move {
            let batch: ServerMessage = device.receive_message().await.unwrap();
            let mut answer = ClientMessage::new(ClientMessageType::CommandResults, "dev1", ClientType::Device)
                .with_status(TaskStatus::Error)
                .with_error("dispatcher unavailable");
            answer.prev_response_id = batch.response_id;
            device.send_message(&answer).await.unwrap();
        });
        let router = tokio::spawn({
            let commands = commands.clone();
            async move {
                let answer: ClientMessage = commands.receive_message().await.unwrap();
                commands.handle_command_results(&answer);
            }
        });

        let err = commands
            .execute_commands("s1", vec![Command::new("click")], Duration::from_secs(1))
            .await
            .expect_err("device failed");
        assert!(matches!(err, ProtocolError::Remote { .. }));
        router.await.unwrap();
    }
}
