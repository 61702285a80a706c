use std::error::Error as StdError;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use aip_primitives::Envelope;
use tracing::warn;

use crate::AipExtension;

/// Ordered set of extensions invoked best-effort.
#[derive(Clone, Default)]
pub struct ExtensionChain {
    extensions: Vec<Arc<dyn AipExtension>>,
}

impl fmt::Debug for ExtensionChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<_> = self.extensions.iter().map(|ext| ext.name().to_owned()).collect();
        f.debug_struct("ExtensionChain")
            .field("extensions", &names)
            .finish()
    }
}

impl ExtensionChain {
    /// Creates a chain from the supplied extensions.
    #[must_use]
    pub fn new<I>(extensions: I) -> Self
    where
        I: IntoIterator<Item = Arc<dyn AipExtension>>,
    {
        Self {
            extensions: extensions.into_iter().collect(),
        }
    }

    /// Appends an extension.
    pub fn push(&mut self, extension: Arc<dyn AipExtension>) {
        self.extensions.push(extension);
    }

    /// Returns the number of installed extensions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.extensions.len()
    }

    /// Returns `true` when no extension is installed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.extensions.is_empty()
    }

    fn each<F>(&self, hook: &'static str, call: F)
    where
        F: Fn(&dyn AipExtension) -> anyhow::Result<()>,
    {
        for extension in &self.extensions {
            match catch_unwind(AssertUnwindSafe(|| call(extension.as_ref()))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    warn!(extension = extension.name(), hook, ?err, "extension hook failed");
                }
                Err(_) => {
                    warn!(extension = extension.name(), hook, "extension hook panicked");
                }
            }
        }
    }
}

impl AipExtension for ExtensionChain {
    fn name(&self) -> &str {
        "chain"
    }

    fn on_message_sent(&self, peer: &str, message: Envelope<'_>) -> anyhow::Result<()> {
        self.each("on_message_sent", |ext| ext.on_message_sent(peer, message));
        Ok(())
    }

    fn on_message_received(&self, peer: &str, message: Envelope<'_>) -> anyhow::Result<()> {
        self.each("on_message_received", |ext| ext.on_message_received(peer, message));
        Ok(())
    }

    fn on_connection_established(&self, peer: &str) -> anyhow::Result<()> {
        self.each("on_connection_established", |ext| ext.on_connection_established(peer));
        Ok(())
    }

    fn on_connection_closed(&self, peer: &str) -> anyhow::Result<()> {
        self.each("on_connection_closed", |ext| ext.on_connection_closed(peer));
        Ok(())
    }

    fn on_error(&self, peer: &str, error: &(dyn StdError + 'static)) -> anyhow::Result<()> {
        self.each("on_error", |ext| ext.on_error(peer, error));
        Ok(())
    }
}
