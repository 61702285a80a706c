//! Core shared types for the Agent Interaction Protocol (AIP).
//!
//! Everything that crosses the wire lives here: the client and server message
//! envelopes, commands and their results, and the correlation identifiers that
//! tie a request to its reply. The crate also hosts [`BackgroundTask`], the owned
//! handle every long-running loop in the runtime is spawned through.

#![warn(missing_docs, clippy::pedantic)]

mod error;
mod ids;
mod message;
mod task;

/// Error type and result alias shared across the primitives.
pub use error::{Error, Result};
/// Correlation identifiers used to pair requests with replies.
pub use ids::CorrelationId;
/// Wire envelopes and their enumerations.
pub use message::{
    ClientMessage, ClientMessageType, ClientType, Command, CommandResult, Envelope, Metadata,
    ResultStatus, ServerMessage, ServerMessageType, TaskStatus, ToolType, WireMessage,
};
/// Owned, joinable background loops.
pub use task::{BackgroundTask, StopSignal};
