//! Task dispatch, command batches and task termination.

use aip_primitives::{
    ClientMessage, ClientMessageType, ClientType, Command, CommandResult, CorrelationId, Metadata,
    ServerMessage, ServerMessageType, TaskStatus,
};
use serde_json::Value;
use tracing::debug;

use crate::pending::PendingReply;
use crate::protocol::sub_protocol;
use crate::ProtocolResult;

/// Task submitted by a client.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskRequest {
    /// Short task name.
    pub task_name: Option<String>,
    /// Free-form request text.
    pub request: Option<String>,
    /// Device the task should run on, for constellation senders.
    pub target_id: Option<String>,
    /// Session to continue, if any.
    pub session_id: Option<String>,
    /// Opaque metadata.
    pub metadata: Metadata,
}

impl TaskRequest {
    /// Creates a request with the given name and text.
    #[must_use]
    pub fn new(task_name: impl Into<String>, request: impl Into<String>) -> Self {
        Self {
            task_name: Some(task_name.into()),
            request: Some(request.into()),
            ..Self::default()
        }
    }

    /// Targets a device.
    #[must_use]
    pub fn for_device(mut self, device_id: impl Into<String>) -> Self {
        self.target_id = Some(device_id.into());
        self
    }

    /// Attaches metadata.
    #[must_use]
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    fn into_message(self, client_id: &str, client_type: ClientType, request_id: CorrelationId) -> ClientMessage {
        let mut message = ClientMessage::new(ClientMessageType::Task, client_id, client_type)
            .with_status(TaskStatus::Continue)
            .with_metadata(self.metadata)
            .with_request_id(request_id);
        message.task_name = self.task_name;
        message.request = self.request;
        message.target_id = self.target_id;
        message.session_id = self.session_id;
        message
    }
}

/// Task assignment the server hands to a device.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskAssignment {
    /// Session created for the task.
    pub session_id: String,
    /// Short task name.
    pub task_name: Option<String>,
    /// Free-form request text.
    pub request: Option<String>,
    /// Opaque metadata.
    pub metadata: Metadata,
}

sub_protocol!(
    /// Task lifecycle messages for both sides of a connection.
    TaskExecutionProtocol
);

impl TaskExecutionProtocol {
    /// Sends a TASK request without waiting for its end.
    ///
    /// # Errors
    ///
    /// Propagates send failures.
    pub async fn send_task_request(
        &self,
        client_id: &str,
        client_type: ClientType,
        task: TaskRequest,
        request_id: CorrelationId,
    ) -> ProtocolResult<()> {
        let message = task.into_message(client_id, client_type, request_id);
        self.send_message(&message).await
    }

    /// Registers a pending reply under a fresh `request_id`, then sends the
    /// TASK request. The returned handle resolves with the matching TASK_END
    /// (or ERROR) once the connection's receive loop routes it.
    ///
    /// # Errors
    ///
    /// Propagates send failures; the pending entry is removed on failure.
    pub async fn dispatch_task(
        &self,
        client_id: &str,
        client_type: ClientType,
        task: TaskRequest,
    ) -> ProtocolResult<PendingReply<ServerMessage>> {
        let request_id = CorrelationId::random();
        let reply = self.replies().register(request_id.clone())?;
        self.send_task_request(client_id, client_type, task, request_id).await?;
        Ok(reply)
    }

    /// Server side: assigns a task to a device.
    ///
    /// # Errors
    ///
    /// Propagates send failures.
    pub async fn send_task_assignment(&self, assignment: TaskAssignment) -> ProtocolResult<()> {
        let mut message = ServerMessage::new(ServerMessageType::Task)
            .with_status(TaskStatus::Continue)
            .with_session(assignment.session_id);
        message.task_name = assignment.task_name;
        message.request = assignment.request;
        message.metadata = assignment.metadata;
        self.send_message(&message).await
    }

    /// Server side: sends an ordered command batch keyed by `response_id`.
    ///
    /// # Errors
    ///
    /// Propagates send failures.
    pub async fn send_commands(
        &self,
        session_id: &str,
        commands: Vec<Command>,
        response_id: CorrelationId,
    ) -> ProtocolResult<()> {
        let mut message = ServerMessage::new(ServerMessageType::Command)
            .with_status(TaskStatus::Continue)
            .with_session(session_id)
            .with_response_id(response_id);
        message.actions = commands;
        self.send_message(&message).await
    }

    /// Device side: answers a command batch.
    ///
    /// # Errors
    ///
    /// Propagates send failures.
    pub async fn send_command_results(
        &self,
        client_id: &str,
        session_id: Option<String>,
        results: Vec<CommandResult>,
        prev_response_id: CorrelationId,
        status: TaskStatus,
    ) -> ProtocolResult<()> {
        let mut message = ClientMessage::new(ClientMessageType::CommandResults, client_id, ClientType::Device)
            .with_status(status);
        message.session_id = session_id;
        message.action_results = results;
        message.prev_response_id = Some(prev_response_id);
        self.send_message(&message).await
    }

    /// Server side: ends a task session. `response_id` is the `request_id`
    /// of the TASK that opened the session, when answering its requester.
    ///
    /// # Errors
    ///
    /// Propagates send failures.
    pub async fn send_task_end(
        &self,
        session_id: &str,
        status: TaskStatus,
        result: Option<Value>,
        error: Option<String>,
        response_id: Option<CorrelationId>,
    ) -> ProtocolResult<()> {
        let mut message = ServerMessage::new(ServerMessageType::TaskEnd)
            .with_status(status)
            .with_session(session_id);
        message.result = result;
        message.error = error;
        message.response_id = response_id;
        self.send_message(&message).await
    }

    /// Resolves the command batch an inbound COMMAND_RESULTS answers.
    pub fn handle_command_results(&self, message: &ClientMessage) -> bool {
        let routed = self.route_result(message);
        if !routed {
            debug!(prev_response_id = ?message.prev_response_id, "no pending command batch for results");
        }
        routed
    }

    /// Resolves the task request an inbound TASK_END answers.
    pub fn handle_task_end(&self, message: &ServerMessage) -> bool {
        let routed = self.route_reply(message);
        if !routed {
            debug!(session_id = ?message.session_id, "task end without a pending request");
        }
        routed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use aip_primitives::WireMessage;
    use aip_transport::{MemoryTransport, Transport};

    use crate::AipProtocol;

    #[tokio::test]
    async fn dispatch_resolves_with_matching_task_end() {
        let (local, peer) = MemoryTransport::pair();
        let tasks = TaskExecutionProtocol::new(AipProtocol::new(Arc::new(local)));

        let reply = tasks
            .dispatch_task("const1", ClientType::Constellation, TaskRequest::new("notes", "open notepad").for_device("dev1"))
            .await
            .unwrap();

        let sent = ClientMessage::from_json(&peer.receive().await.unwrap()).unwrap();
        assert_eq!(sent.kind, ClientMessageType::Task);
        assert_eq!(sent.target_id.as_deref(), Some("dev1"));
        assert_eq!(sent.request_id.as_ref(), Some(reply.id()));

        let mut end = ServerMessage::new(ServerMessageType::TaskEnd)
            .with_status(TaskStatus::Completed)
            .with_session("s1")
            .with_response_id(reply.id().clone());
        end.result = Some(serde_json::json!({ "done": true }));
        assert!(tasks.handle_task_end(&end));

        let outcome = reply.wait().await.unwrap();
        assert_eq!(outcome.status, TaskStatus::Completed);
        assert!(tasks.replies().is_empty());
    }

    #[tokio::test]
    async fn failed_send_leaves_no_pending_entry() {
        let (local, _peer) = MemoryTransport::pair();
        local.close().await.unwrap();
        let tasks = TaskExecutionProtocol::new(AipProtocol::new(Arc::new(local)));

        assert!(tasks
            .dispatch_task("dev1", ClientType::Device, TaskRequest::new("t", "r"))
            .await
            .is_err());
        assert!(tasks.replies().is_empty());
    }

    #[tokio::test]
    async fn command_results_route_by_prev_response_id() {
        let (server_end, device_end) = MemoryTransport::pair();
        let server = TaskExecutionProtocol::new(AipProtocol::new(Arc::new(server_end)));
        let device = TaskExecutionProtocol::new(AipProtocol::new(Arc::new(device_end)));

        let key = CorrelationId::random();
        let pending = server.results().register(key.clone()).unwrap();
        server
            .send_commands("s1", vec![Command::new("click").with_call_id("c1")], key.clone())
            .await
            .unwrap();

        let command: ServerMessage = device.receive_message().await.unwrap();
        device
            .send_command_results(
                "dev1",
                command.session_id.clone(),
                vec![CommandResult::success(Some("c1".into()), Value::Null)],
                command.response_id.clone().unwrap(),
                TaskStatus::Continue,
            )
            .await
            .unwrap();

        let results: ClientMessage = server.receive_message().await.unwrap();
        assert!(server.handle_command_results(&results));
        let resolved = pending.wait().await.unwrap();
        assert_eq!(resolved.action_results.len(), 1);
        assert_eq!(resolved.prev_response_id, Some(key));
    }
}
