//! Endpoints of the Agent Interaction Protocol.
//!
//! Three roles share one lifecycle and one resilience story:
//!
//! - [`DeviceServerEndpoint`] accepts device and constellation links,
//!   answers heartbeats and device queries, and runs task sessions through a
//!   host-supplied [`SessionManager`].
//! - [`DeviceClientEndpoint`] keeps a device registered, executes command
//!   batches through a [`CommandDispatcher`], and reconnects after loss.
//! - [`ConstellationEndpoint`] holds one link per target device and
//!   dispatches tasks to them.
//!
//! Every endpoint implements [`AipEndpoint`] and, through it,
//! [`aip_resilience::DeviceRecovery`], so a lost link is handled by the
//! shared [`aip_resilience::ReconnectionStrategy`].

#![warn(missing_docs, clippy::pedantic)]

mod client;
mod config;
mod connector;
mod constellation;
mod error;
mod host;
mod lifecycle;
mod link;
mod server;
mod session;
mod tap;

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use aip_resilience::DeviceRecovery;
use async_trait::async_trait;

pub use client::{DeviceClientBuilder, DeviceClientEndpoint};
pub use config::EndpointConfig;
pub use connector::{Connector, InProcessConnector, WebSocketConnector};
pub use constellation::{ConstellationBuilder, ConstellationEndpoint};
pub use error::{EndpointError, EndpointResult};
pub use host::{Addressed, CommandDispatcher, SessionLookup, SessionManager, TaskContext};
pub use lifecycle::{EndpointEvent, EndpointState, Lifecycle, LifecycleError, LifecycleResult};
pub use server::{DeviceServerBuilder, DeviceServerEndpoint};
pub use session::{SessionRecord, SessionScheduler, SessionTable};
pub use tap::{InboundKind, InboundTap};

/// Common surface of every AIP endpoint.
#[async_trait]
pub trait AipEndpoint: DeviceRecovery {
    /// Messages the endpoint receives.
    type Inbound: InboundKind;
    /// Messages the endpoint sends.
    type Outbound: Send + 'static;

    /// Brings the endpoint to [`EndpointState::Running`].
    ///
    /// # Errors
    ///
    /// Returns [`EndpointError::Lifecycle`] from a state that cannot start,
    /// or the failure that kept the endpoint from connecting.
    async fn start(&self) -> EndpointResult<()>;

    /// Stops background work and closes every link. A stopped endpoint can
    /// be started again.
    ///
    /// # Errors
    ///
    /// Returns [`EndpointError::Lifecycle`] if the transition is rejected.
    async fn stop(&self) -> EndpointResult<()>;

    /// Processes one inbound message as if it arrived on a link.
    ///
    /// # Errors
    ///
    /// Returns an error when the message is invalid or cannot be routed.
    async fn handle_message(&self, message: Self::Inbound) -> EndpointResult<()>;

    /// Returns `true` while the endpoint can exchange messages.
    fn is_connected(&self) -> bool;

    /// Current lifecycle state.
    fn state(&self) -> EndpointState;

    /// Sends `message`, failing after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`EndpointError::Timeout`], [`EndpointError::NotConnected`] or
    /// the send failure.
    async fn send_with_timeout(&self, message: Self::Outbound, timeout: Duration) -> EndpointResult<()>;

    /// Waits for the next inbound message of `kind`.
    ///
    /// # Errors
    ///
    /// Returns [`EndpointError::Timeout`] when nothing matching arrives.
    async fn receive_with_timeout(
        &self,
        kind: <Self::Inbound as InboundKind>::Kind,
        timeout: Duration,
    ) -> EndpointResult<Self::Inbound>;
}

/// Locks `mutex`, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
