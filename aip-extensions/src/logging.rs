use std::error::Error as StdError;

use aip_primitives::Envelope;
use tracing::Level;

use crate::AipExtension;

macro_rules! event_at {
    ($level:expr, $($arg:tt)+) => {
        match $level {
            Level::ERROR => tracing::event!(Level::ERROR, $($arg)+),
            Level::WARN => tracing::event!(Level::WARN, $($arg)+),
            Level::INFO => tracing::event!(Level::INFO, $($arg)+),
            Level::DEBUG => tracing::event!(Level::DEBUG, $($arg)+),
            _ => tracing::event!(Level::TRACE, $($arg)+),
        }
    };
}

/// Emits one tracing event per protocol event at a configurable level.
/// Errors are always logged at `WARN` or above.
#[derive(Debug, Clone, Copy)]
pub struct LoggingExtension {
    level: Level,
}

impl LoggingExtension {
    /// Creates an extension logging at `level`.
    #[must_use]
    pub const fn new(level: Level) -> Self {
        Self { level }
    }

    /// Returns the configured level.
    #[must_use]
    pub const fn level(&self) -> Level {
        self.level
    }
}

impl Default for LoggingExtension {
    fn default() -> Self {
        Self::new(Level::DEBUG)
    }
}

impl AipExtension for LoggingExtension {
    fn name(&self) -> &str {
        "logging"
    }

    fn on_message_sent(&self, peer: &str, message: Envelope<'_>) -> anyhow::Result<()> {
        event_at!(
            self.level,
            peer,
            message_type = message.type_name(),
            request_key = ?message.request_key(),
            reply_key = ?message.reply_key(),
            "aip message sent"
        );
        Ok(())
    }

    fn on_message_received(&self, peer: &str, message: Envelope<'_>) -> anyhow::Result<()> {
        event_at!(
            self.level,
            peer,
            message_type = message.type_name(),
            request_key = ?message.request_key(),
            reply_key = ?message.reply_key(),
            "aip message received"
        );
        Ok(())
    }

    fn on_connection_established(&self, peer: &str) -> anyhow::Result<()> {
        event_at!(self.level, peer, "aip connection established");
        Ok(())
    }

    fn on_connection_closed(&self, peer: &str) -> anyhow::Result<()> {
        event_at!(self.level, peer, "aip connection closed");
        Ok(())
    }

    fn on_error(&self, peer: &str, error: &(dyn StdError + 'static)) -> anyhow::Result<()> {
        let level = if self.level == Level::ERROR { Level::ERROR } else { Level::WARN };
        event_at!(level, peer, error = %error, "aip protocol error");
        Ok(())
    }
}
