//! Required-field checks applied to inbound messages.

use aip_primitives::{ClientMessage, ClientMessageType, ClientType, ServerMessage, ServerMessageType};

use crate::{ProtocolError, ProtocolResult};

fn invalid(message_type: &'static str, reason: &'static str) -> ProtocolResult<()> {
    Err(ProtocolError::Invalid {
        message_type,
        reason,
    })
}

/// Checks the fields a client message of its type must carry.
///
/// # Errors
///
/// Returns [`ProtocolError::Invalid`] naming the first missing field.
pub fn validate_client_message(message: &ClientMessage) -> ProtocolResult<()> {
    let kind = message.kind.as_str();
    if message.client_id.trim().is_empty() {
        return invalid(kind, "client_id is required");
    }
    match message.kind {
        ClientMessageType::Register
            if message.client_type == ClientType::Constellation
                && message.target_id.as_deref().is_none_or(str::is_empty) =>
        {
            invalid(kind, "constellation registration requires target_id")
        }
        ClientMessageType::Task if message.request_id.is_none() => {
            invalid(kind, "request_id is required")
        }
        ClientMessageType::Task
            if message.task_name.is_none() && message.request.is_none() =>
        {
            invalid(kind, "task_name or request is required")
        }
        ClientMessageType::CommandResults if message.prev_response_id.is_none() => {
            invalid(kind, "prev_response_id is required")
        }
        ClientMessageType::DeviceInfoRequest if message.request_id.is_none() => {
            invalid(kind, "request_id is required")
        }
        ClientMessageType::DeviceInfoRequest if message.target_id.is_none() => {
            invalid(kind, "target_id is required")
        }
        _ => Ok(()),
    }
}

/// Checks the fields a server message of its type must carry.
///
/// # Errors
///
/// Returns [`ProtocolError::Invalid`] naming the first missing field.
pub fn validate_server_message(message: &ServerMessage) -> ProtocolResult<()> {
    let kind = message.kind.as_str();
    match message.kind {
        ServerMessageType::Command if message.response_id.is_none() => {
            invalid(kind, "response_id is required")
        }
        ServerMessageType::Command if message.actions.is_empty() => {
            invalid(kind, "actions must not be empty")
        }
        ServerMessageType::Task | ServerMessageType::TaskEnd if message.session_id.is_none() => {
            invalid(kind, "session_id is required")
        }
        ServerMessageType::DeviceInfoResponse if message.response_id.is_none() => {
            invalid(kind, "response_id is required")
        }
        _ => Ok(()),
    }
}
