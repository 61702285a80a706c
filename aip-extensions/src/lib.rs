//! Pluggable observers for protocol traffic.
//!
//! Extensions see every message a protocol sends or receives and every
//! connection event. They are invoked best-effort through an
//! [`ExtensionChain`]: a failing or panicking extension is logged and skipped,
//! never allowed to fail the protocol operation that triggered it.

#![warn(missing_docs, clippy::pedantic)]

mod chain;
mod logging;
mod metrics;

use std::error::Error as StdError;

use aip_primitives::Envelope;

pub use chain::ExtensionChain;
pub use logging::LoggingExtension;
pub use metrics::{MetricsExtension, MetricsSnapshot};

/// Observer of protocol traffic. Every hook defaults to a no-op.
pub trait AipExtension: Send + Sync {
    /// Name used when reporting hook failures.
    fn name(&self) -> &str;

    /// Called after a message was written to the transport.
    ///
    /// # Errors
    ///
    /// Implementations may fail; the chain logs and ignores the error.
    fn on_message_sent(&self, peer: &str, message: Envelope<'_>) -> anyhow::Result<()> {
        let _ = (peer, message);
        Ok(())
    }

    /// Called after a message was read and decoded.
    ///
    /// # Errors
    ///
    /// Implementations may fail; the chain logs and ignores the error.
    fn on_message_received(&self, peer: &str, message: Envelope<'_>) -> anyhow::Result<()> {
        let _ = (peer, message);
        Ok(())
    }

    /// Called once a connection is usable.
    ///
    /// # Errors
    ///
    /// Implementations may fail; the chain logs and ignores the error.
    fn on_connection_established(&self, peer: &str) -> anyhow::Result<()> {
        let _ = peer;
        Ok(())
    }

    /// Called once a connection is closed.
    ///
    /// # Errors
    ///
    /// Implementations may fail; the chain logs and ignores the error.
    fn on_connection_closed(&self, peer: &str) -> anyhow::Result<()> {
        let _ = peer;
        Ok(())
    }

    /// Called when a send, receive or decode fails.
    ///
    /// # Errors
    ///
    /// Implementations may fail; the chain logs and ignores the error.
    fn on_error(&self, peer: &str, error: &(dyn StdError + 'static)) -> anyhow::Result<()> {
        let _ = (peer, error);
        Ok(())
    }
}
