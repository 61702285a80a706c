//! Typed messaging for the Agent Interaction Protocol.
//!
//! [`AipProtocol`] turns envelopes into transport frames and back, and owns
//! the pending-request tables that pair replies with requests by correlation
//! id. Five sub-protocols layer role-specific operations on top of it; each is
//! a cheap handle that dereferences to the shared base, so any number of them
//! can sit on one connection:
//!
//! - [`RegistrationProtocol`]: the REGISTER handshake.
//! - [`HeartbeatProtocol`]: liveness messages and a repeating heartbeat loop.
//! - [`TaskExecutionProtocol`]: task requests, command batches and task ends.
//! - [`DeviceInfoProtocol`]: device information queries.
//! - [`CommandProtocol`]: server-side command round trips.
//!
//! Only one task may drive the receive side of a connection. That loop hands
//! inbound replies to [`AipProtocol::route_reply`] /
//! [`AipProtocol::route_result`], which wake the waiting request.

#![warn(missing_docs, clippy::pedantic)]

mod command;
mod device_info;
mod error;
mod heartbeat;
mod pending;
mod protocol;
mod registration;
mod task;
mod validation;

pub use command::CommandProtocol;
pub use device_info::DeviceInfoProtocol;
pub use error::{ProtocolError, ProtocolResult};
pub use heartbeat::HeartbeatProtocol;
pub use pending::{PendingReply, PendingRequests};
pub use protocol::{AipProtocol, ProtocolBuilder};
pub use registration::{DEFAULT_REGISTRATION_TIMEOUT, RegistrationProtocol, RegistrationResult};
pub use task::{TaskAssignment, TaskExecutionProtocol, TaskRequest};
pub use validation::{validate_client_message, validate_server_message};
