//! Lifecycle state machine shared by every endpoint.

use std::fmt;

use thiserror::Error;
use tokio::sync::watch;
use tracing::debug;

/// States an endpoint moves through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointState {
    /// Constructed, never started.
    Created,
    /// `start` is bringing the endpoint up.
    Starting,
    /// Serving or linked.
    Running,
    /// The link dropped; recovery has not begun or gave up.
    Disconnected,
    /// Recovery is re-establishing the link.
    Reconnecting,
    /// Shut down. `start` may bring it back.
    Stopped,
}

impl EndpointState {
    /// Returns `true` while the endpoint is serving.
    #[must_use]
    pub const fn is_running(self) -> bool {
        matches!(self, Self::Running)
    }

    /// Returns `true` once the endpoint was stopped.
    #[must_use]
    pub const fn is_stopped(self) -> bool {
        matches!(self, Self::Stopped)
    }
}

impl fmt::Display for EndpointState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Disconnected => "disconnected",
            Self::Reconnecting => "reconnecting",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Events that drive lifecycle transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointEvent {
    /// Begin bringing the endpoint up.
    Start,
    /// The link is up (or the listener is bound).
    Connected,
    /// A running link dropped.
    ConnectionLost,
    /// Recovery begins.
    Reconnect,
    /// Connecting or reconnecting gave up.
    ConnectFailed,
    /// Shut the endpoint down.
    Stop,
}

/// Errors emitted by the lifecycle controller.
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// Transition was not permitted from the current state.
    #[error("invalid lifecycle transition from {from} via {event:?} for endpoint `{endpoint}`")]
    InvalidTransition {
        /// Endpoint whose transition failed.
        endpoint: String,
        /// State prior to the attempted transition.
        from: EndpointState,
        /// Event that triggered the failure.
        event: EndpointEvent,
    },
}

/// Result alias used for lifecycle operations.
pub type LifecycleResult<T> = Result<T, LifecycleError>;

const fn next_state(from: EndpointState, event: EndpointEvent) -> Option<EndpointState> {
    use EndpointEvent as E;
    use EndpointState as S;

    match (from, event) {
        (S::Created | S::Stopped | S::Disconnected, E::Start) => Some(S::Starting),
        (S::Starting | S::Reconnecting, E::Connected) => Some(S::Running),
        (S::Running, E::ConnectionLost) => Some(S::Disconnected),
        (S::Disconnected | S::Reconnecting, E::Reconnect) => Some(S::Reconnecting),
        (S::Starting | S::Reconnecting, E::ConnectFailed) => Some(S::Disconnected),
        (_, E::Stop) => Some(S::Stopped),
        _ => None,
    }
}

/// Observable lifecycle state of one endpoint.
///
/// Only a running endpoint accepts [`EndpointEvent::ConnectionLost`], so of
/// several tasks noticing the same dropped link exactly one wins the
/// transition and runs recovery.
#[derive(Debug)]
pub struct Lifecycle {
    endpoint: String,
    state: watch::Sender<EndpointState>,
}

impl Lifecycle {
    /// Creates a lifecycle in [`EndpointState::Created`].
    #[must_use]
    pub fn new(endpoint: impl Into<String>) -> Self {
        let (state, _) = watch::channel(EndpointState::Created);
        Self {
            endpoint: endpoint.into(),
            state,
        }
    }

    /// Returns the endpoint label.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> EndpointState {
        *self.state.borrow()
    }

    /// Subscribes to state changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<EndpointState> {
        self.state.subscribe()
    }

    /// Applies a lifecycle event, returning the resulting state.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::InvalidTransition`] when the event is not
    /// allowed from the current state.
    pub fn transition(&self, event: EndpointEvent) -> LifecycleResult<EndpointState> {
        let mut outcome = Ok(EndpointState::Created);
        self.state.send_if_modified(|state| {
            let Some(next) = next_state(*state, event) else {
                outcome = Err(LifecycleError::InvalidTransition {
                    endpoint: self.endpoint.clone(),
                    from: *state,
                    event,
                });
                return false;
            };
            outcome = Ok(next);
            if next == *state {
                return false;
            }
            debug!(
                endpoint = %self.endpoint,
                from = %state,
                to = %next,
                ?event,
                "endpoint lifecycle transition"
            );
            *state = next;
            true
        });
        outcome
    }
}
