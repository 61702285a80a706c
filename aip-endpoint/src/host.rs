//! Collaborators the embedding application plugs into the endpoints.

use std::time::Duration;

use aip_primitives::{Command, CommandResult, Metadata};
use aip_protocol::{CommandProtocol, ProtocolResult};
use async_trait::async_trait;
use serde_json::Value;

/// Executes command batches on a device.
#[async_trait]
pub trait CommandDispatcher: Send + Sync {
    /// Runs `commands` in order and returns their results.
    ///
    /// The endpoint pairs results with commands by position; missing entries
    /// are reported as failures and extra entries are dropped.
    async fn execute_commands(&self, commands: &[Command]) -> anyhow::Result<Vec<CommandResult>>;
}

/// Orchestrates tasks on the server.
#[async_trait]
pub trait SessionManager: Send + Sync {
    /// Drives one task session to completion. The returned value becomes the
    /// TASK_END result.
    async fn execute_task(&self, context: TaskContext) -> anyhow::Result<Option<Value>>;

    /// Cancels a running session.
    async fn cancel_task(&self, session_id: &str, reason: &str) -> anyhow::Result<()>;
}

/// Lists the sessions running on a device.
pub trait SessionLookup: Send + Sync {
    /// Session ids currently bound to `device_id`.
    fn get_device_sessions(&self, device_id: &str) -> Vec<String>;
}

/// Everything a [`SessionManager`] needs to run one task.
#[derive(Debug, Clone)]
pub struct TaskContext {
    /// Session created for the task.
    pub session_id: String,
    /// Device executing the task.
    pub device_id: String,
    /// Client that submitted the task.
    pub requester_id: String,
    /// Short task name.
    pub task_name: Option<String>,
    /// Free-form request text.
    pub request: Option<String>,
    /// Metadata supplied with the request.
    pub metadata: Metadata,
    commands: CommandProtocol,
    command_timeout: Duration,
}

impl TaskContext {
    pub(crate) fn new(
        session_id: String,
        device_id: String,
        requester_id: String,
        commands: CommandProtocol,
        command_timeout: Duration,
    ) -> Self {
        Self {
            session_id,
            device_id,
            requester_id,
            task_name: None,
            request: None,
            metadata: Metadata::new(),
            commands,
            command_timeout,
        }
    }

    /// Sends a command batch to the device and waits for its results.
    ///
    /// # Errors
    ///
    /// Returns the protocol failure, including a timeout after the configured
    /// command deadline.
    pub async fn execute_commands(&self, commands: Vec<Command>) -> ProtocolResult<Vec<CommandResult>> {
        self.commands
            .execute_commands(&self.session_id, commands, self.command_timeout)
            .await
    }

    /// Returns the deadline applied to each command batch.
    #[must_use]
    pub const fn command_timeout(&self) -> Duration {
        self.command_timeout
    }
}

/// Message paired with the client it is addressed to.
#[derive(Debug, Clone, PartialEq)]
pub struct Addressed<M> {
    /// Destination client.
    pub client_id: String,
    /// Message to deliver.
    pub message: M,
}

impl<M> Addressed<M> {
    /// Addresses `message` to `client_id`.
    #[must_use]
    pub fn new(client_id: impl Into<String>, message: M) -> Self {
        Self {
            client_id: client_id.into(),
            message,
        }
    }
}
