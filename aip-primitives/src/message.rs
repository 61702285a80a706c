//! Wire envelopes exchanged between clients (devices, constellations) and the
//! server.
//!
//! Both directions are encoded as one UTF-8 JSON object per text frame. Enum
//! values travel as `snake_case` strings and absent optional fields are omitted.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{CorrelationId, Result};

/// Opaque key/value map carried by messages and commands.
pub type Metadata = Map<String, Value>;

/// Kinds of messages a client sends to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientMessageType {
    /// Announces the client and, for constellations, its target device.
    Register,
    /// Liveness signal.
    Heartbeat,
    /// Requests execution of a task.
    Task,
    /// Answers a previously received command batch.
    CommandResults,
    /// Asks the server for a device's advertised information.
    DeviceInfoRequest,
    /// Reports a client-side failure.
    Error,
}

impl ClientMessageType {
    /// Returns the wire name of the message type.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Register => "register",
            Self::Heartbeat => "heartbeat",
            Self::Task => "task",
            Self::CommandResults => "command_results",
            Self::DeviceInfoRequest => "device_info_request",
            Self::Error => "error",
        }
    }
}

/// Kinds of messages the server sends to a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerMessageType {
    /// Heartbeat acknowledgement; also used to confirm a registration.
    Heartbeat,
    /// Assigns a task to a device.
    Task,
    /// Ordered batch of commands for a device to execute.
    Command,
    /// Terminates a task session.
    TaskEnd,
    /// Answers a device information request.
    DeviceInfoResponse,
    /// Reports a server-side failure.
    Error,
}

impl ServerMessageType {
    /// Returns the wire name of the message type.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Heartbeat => "heartbeat",
            Self::Task => "task",
            Self::Command => "command",
            Self::TaskEnd => "task_end",
            Self::DeviceInfoResponse => "device_info_response",
            Self::Error => "error",
        }
    }
}

/// Role a client registers under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientType {
    /// Agent process that executes commands.
    Device,
    /// Orchestrator dispatching tasks to devices.
    Constellation,
}

/// Status attached to every message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Request accepted or operation succeeded.
    #[default]
    Ok,
    /// Request rejected or operation failed.
    Error,
    /// Task is still running; more messages follow.
    Continue,
    /// Task finished successfully.
    Completed,
    /// Task finished unsuccessfully.
    Failed,
}

impl TaskStatus {
    /// Returns `true` for statuses that end a task session.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Category of a command's tool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolType {
    /// Read-only tool gathering information from the device.
    DataCollection,
    /// Tool that changes device state.
    #[default]
    Action,
}

/// Outcome of a single command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    /// The command ran to completion.
    Success,
    /// The command failed.
    Failure,
    /// The command was not executed.
    Skipped,
}

/// Command the server asks a device to execute. The payload is opaque to the
/// protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// Name of the tool to invoke.
    pub tool_name: String,
    /// Tool arguments.
    #[serde(default)]
    pub parameters: Metadata,
    /// Tool category.
    #[serde(default)]
    pub tool_type: ToolType,
    /// Identifier unique within the batch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
}

impl Command {
    /// Creates an action command with no parameters.
    #[must_use]
    pub fn new(tool_name: impl Into<String>) -> Self {
        Self {
            tool_name: tool_name.into(),
            parameters: Metadata::new(),
            tool_type: ToolType::Action,
            call_id: None,
        }
    }

    /// Sets the tool arguments.
    #[must_use]
    pub fn with_parameters(mut self, parameters: Metadata) -> Self {
        self.parameters = parameters;
        self
    }

    /// Sets the tool category.
    #[must_use]
    pub fn with_tool_type(mut self, tool_type: ToolType) -> Self {
        self.tool_type = tool_type;
        self
    }

    /// Sets the batch-local call identifier.
    #[must_use]
    pub fn with_call_id(mut self, call_id: impl Into<String>) -> Self {
        self.call_id = Some(call_id.into());
        self
    }
}

/// Result of one executed command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResult {
    /// Execution outcome.
    pub status: ResultStatus,
    /// Echo of the command's `call_id`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    /// Tool output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Failure description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CommandResult {
    /// Builds a successful result for the given call.
    #[must_use]
    pub fn success(call_id: Option<String>, result: Value) -> Self {
        Self {
            status: ResultStatus::Success,
            call_id,
            result: Some(result),
            error: None,
        }
    }

    /// Builds a failed result for the given call.
    #[must_use]
    pub fn failure(call_id: Option<String>, error: impl Into<String>) -> Self {
        Self {
            status: ResultStatus::Failure,
            call_id,
            result: None,
            error: Some(error.into()),
        }
    }

    /// Builds a skipped result for the given call.
    #[must_use]
    pub fn skipped(call_id: Option<String>, reason: impl Into<String>) -> Self {
        Self {
            status: ResultStatus::Skipped,
            call_id,
            result: None,
            error: Some(reason.into()),
        }
    }
}

/// Message sent by a device or constellation to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientMessage {
    /// Message type (`type` on the wire).
    #[serde(rename = "type")]
    pub kind: ClientMessageType,
    /// Sender identifier.
    pub client_id: String,
    /// Sender role.
    pub client_type: ClientType,
    /// Device this message concerns, for constellation senders.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
    /// Message status.
    #[serde(default)]
    pub status: TaskStatus,
    /// Creation time (ISO-8601, UTC).
    pub timestamp: DateTime<Utc>,
    /// Opaque metadata.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Metadata,
    /// Task name for `task` messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_name: Option<String>,
    /// Free-form task request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<String>,
    /// Session the message belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Command results, in command order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub action_results: Vec<CommandResult>,
    /// Correlation id of a request expecting a reply.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<CorrelationId>,
    /// Correlation id of the server message being answered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_response_id: Option<CorrelationId>,
    /// Failure description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ClientMessage {
    /// Creates a message stamped with the current time and `ok` status.
    #[must_use]
    pub fn new(kind: ClientMessageType, client_id: impl Into<String>, client_type: ClientType) -> Self {
        Self {
            kind,
            client_id: client_id.into(),
            client_type,
            target_id: None,
            status: TaskStatus::Ok,
            timestamp: Utc::now(),
            metadata: Metadata::new(),
            task_name: None,
            request: None,
            session_id: None,
            action_results: Vec::new(),
            request_id: None,
            prev_response_id: None,
            error: None,
        }
    }

    /// Sets the status.
    #[must_use]
    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = status;
        self
    }

    /// Sets the targeted device.
    #[must_use]
    pub fn with_target(mut self, target_id: impl Into<String>) -> Self {
        self.target_id = Some(target_id.into());
        self
    }

    /// Replaces the metadata map.
    #[must_use]
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Sets the session identifier.
    #[must_use]
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Sets the request correlation id.
    #[must_use]
    pub fn with_request_id(mut self, request_id: CorrelationId) -> Self {
        self.request_id = Some(request_id);
        self
    }

    /// Sets the error text.
    #[must_use]
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Message sent by the server to a device or constellation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerMessage {
    /// Message type (`type` on the wire).
    #[serde(rename = "type")]
    pub kind: ServerMessageType,
    /// Message status.
    #[serde(default)]
    pub status: TaskStatus,
    /// Correlation id: the request being answered, or the key of a command batch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_id: Option<CorrelationId>,
    /// Session the message belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Ordered commands for `command` messages.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<Command>,
    /// Opaque result payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Failure description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Creation time (ISO-8601, UTC).
    pub timestamp: DateTime<Utc>,
    /// Task name for `task` assignments.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_name: Option<String>,
    /// Free-form task request for `task` assignments.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<String>,
    /// Opaque metadata.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Metadata,
}

impl ServerMessage {
    /// Creates a message stamped with the current time and `ok` status.
    #[must_use]
    pub fn new(kind: ServerMessageType) -> Self {
        Self {
            kind,
            status: TaskStatus::Ok,
            response_id: None,
            session_id: None,
            actions: Vec::new(),
            result: None,
            error: None,
            timestamp: Utc::now(),
            task_name: None,
            request: None,
            metadata: Metadata::new(),
        }
    }

    /// Sets the status.
    #[must_use]
    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = status;
        self
    }

    /// Sets the correlation id.
    #[must_use]
    pub fn with_response_id(mut self, response_id: CorrelationId) -> Self {
        self.response_id = Some(response_id);
        self
    }

    /// Sets the session identifier.
    #[must_use]
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Sets the result payload.
    #[must_use]
    pub fn with_result(mut self, result: Value) -> Self {
        self.result = Some(result);
        self
    }

    /// Sets the error text.
    #[must_use]
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Borrowed view over either envelope, used by observers that do not care
/// about the direction.
#[derive(Debug, Clone, Copy)]
pub enum Envelope<'a> {
    /// Client to server.
    Client(&'a ClientMessage),
    /// Server to client.
    Server(&'a ServerMessage),
}

impl Envelope<'_> {
    /// Returns the wire name of the message type.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Client(msg) => msg.kind.as_str(),
            Self::Server(msg) => msg.kind.as_str(),
        }
    }

    /// Returns the id under which the sender awaits a reply, if any.
    #[must_use]
    pub fn request_key(&self) -> Option<&CorrelationId> {
        match self {
            Self::Client(msg) => msg.request_id.as_ref(),
            Self::Server(msg) if msg.kind == ServerMessageType::Command => msg.response_id.as_ref(),
            Self::Server(_) => None,
        }
    }

    /// Returns the id of the request this message answers, if any.
    #[must_use]
    pub fn reply_key(&self) -> Option<&CorrelationId> {
        match self {
            Self::Client(msg) => msg.prev_response_id.as_ref(),
            Self::Server(msg) if msg.kind == ServerMessageType::Command => None,
            Self::Server(msg) => msg.response_id.as_ref(),
        }
    }

    /// Returns the message timestamp.
    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::Client(msg) => msg.timestamp,
            Self::Server(msg) => msg.timestamp,
        }
    }
}

/// Message that can travel as one JSON text frame.
pub trait WireMessage: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Returns a borrowed direction-agnostic view.
    fn envelope(&self) -> Envelope<'_>;

    /// Encodes the message as JSON.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Serialization`](crate::Error::Serialization) when
    /// encoding fails.
    fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decodes a message from JSON.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Serialization`](crate::Error::Serialization) when the
    /// text is not a valid message of this type.
    fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

impl WireMessage for ClientMessage {
    fn envelope(&self) -> Envelope<'_> {
        Envelope::Client(self)
    }
}

impl WireMessage for ServerMessage {
    fn envelope(&self) -> Envelope<'_> {
        Envelope::Server(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn metadata(value: Value) -> Metadata {
        match value {
            Value::Object(map) => map,
            _ => unreachable!("metadata literal must be an object"),
        }
    }

    #[test]
    fn client_message_round_trips_every_field() {
        let mut message = ClientMessage::new(
            ClientMessageType::CommandResults,
            "dev1",
            ClientType::Device,
        )
        .with_status(TaskStatus::Continue)
        .with_target("dev2")
        .with_metadata(metadata(json!({ "platform": "windows", "nested": { "n": 1 } })))
        .with_session("session-1")
        .with_request_id("req-1".parse().unwrap())
        .with_error("partial");
        message.task_name = Some("open notepad".into());
        message.request = Some("open notepad and type hello".into());
        message.prev_response_id = Some("resp-9".parse().unwrap());
        message.action_results = vec![
            CommandResult::success(Some("c1".into()), json!({ "ok": true })),
            CommandResult::failure(Some("c2".into()), "boom"),
            CommandResult::skipped(None, "not reached"),
        ];

        let text = message.to_json().unwrap();
        let decoded = ClientMessage::from_json(&text).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn server_message_round_trips_every_field() {
        let mut message = ServerMessage::new(ServerMessageType::Command)
            .with_status(TaskStatus::Continue)
            .with_response_id(CorrelationId::random())
            .with_session("session-1")
            .with_result(json!([1, 2, 3]))
            .with_error("none");
        message.actions = vec![
            Command::new("click")
                .with_parameters(metadata(json!({ "x": 10, "y": 20 })))
                .with_call_id("c1"),
            Command::new("screenshot").with_tool_type(ToolType::DataCollection),
        ];
        message.task_name = Some("demo".into());
        message.request = Some("do it".into());
        message.metadata = metadata(json!({ "k": "v" }));

        let decoded = ServerMessage::from_json(&message.to_json().unwrap()).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn wire_names_are_snake_case_and_optionals_are_omitted() {
        let message = ClientMessage::new(ClientMessageType::DeviceInfoRequest, "c", ClientType::Constellation);
        let value: Value = serde_json::from_str(&message.to_json().unwrap()).unwrap();

        assert_eq!(value["type"], "device_info_request");
        assert_eq!(value["client_type"], "constellation");
        assert_eq!(value["status"], "ok");
        assert!(value.get("target_id").is_none());
        assert!(value.get("action_results").is_none());
        assert!(value["timestamp"].as_str().unwrap().ends_with('Z'));
    }

    #[test]
    fn decodes_minimal_foreign_message() {
        let text = r#"{"type":"heartbeat","status":"ok","timestamp":"2024-05-01T12:00:00Z","response_id":"r1"}"#;
        let message = ServerMessage::from_json(text).unwrap();
        assert_eq!(message.kind, ServerMessageType::Heartbeat);
        assert_eq!(message.response_id.as_ref().map(CorrelationId::as_str), Some("r1"));
        assert!(message.actions.is_empty());
    }

    #[test]
    fn wrong_direction_fails_to_decode() {
        let server = ServerMessage::new(ServerMessageType::TaskEnd).to_json().unwrap();
        assert!(ClientMessage::from_json(&server).is_err());
    }

    #[test]
    fn envelope_keys_follow_correlation_rules() {
        let id = CorrelationId::random();
        let command = ServerMessage::new(ServerMessageType::Command).with_response_id(id.clone());
        assert_eq!(command.envelope().request_key(), Some(&id));
        assert_eq!(command.envelope().reply_key(), None);

        let task_end = ServerMessage::new(ServerMessageType::TaskEnd).with_response_id(id.clone());
        assert_eq!(task_end.envelope().reply_key(), Some(&id));

        let mut results = ClientMessage::new(ClientMessageType::CommandResults, "d", ClientType::Device);
        results.prev_response_id = Some(id.clone());
        assert_eq!(results.envelope().reply_key(), Some(&id));
        assert_eq!(results.envelope().type_name(), "command_results");
    }
}
