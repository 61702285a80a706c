//! Correlation table pairing outstanding requests with their replies.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use aip_primitives::CorrelationId;
use tokio::sync::oneshot;
use tracing::debug;

use crate::{ProtocolError, ProtocolResult};

type Slot<T> = oneshot::Sender<ProtocolResult<T>>;
type Table<T> = Arc<Mutex<Entries<T>>>;

/// Slots tagged with the registration that created them, so a stale handle
/// never removes a later request that reused its id.
struct Entries<T> {
    next: u64,
    slots: HashMap<CorrelationId, (u64, Slot<T>)>,
}

impl<T> Entries<T> {
    fn remove_registration(&mut self, id: &CorrelationId, registration: u64) {
        if self.slots.get(id).is_some_and(|(current, _)| *current == registration) {
            self.slots.remove(id);
        }
    }
}

/// Outstanding requests keyed by correlation id.
///
/// An entry is registered before its request is sent and leaves the table
/// exactly once: resolved by the matching reply, failed explicitly, or removed
/// when its [`PendingReply`] is dropped (for example on timeout).
pub struct PendingRequests<T> {
    entries: Table<T>,
}

impl<T> Clone for PendingRequests<T> {
    fn clone(&self) -> Self {
        Self {
            entries: Arc::clone(&self.entries),
        }
    }
}

impl<T> Default for PendingRequests<T> {
    fn default() -> Self {
        Self {
            entries: Arc::new(Mutex::new(Entries {
                next: 0,
                slots: HashMap::new(),
            })),
        }
    }
}

impl<T> fmt::Debug for PendingRequests<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingRequests")
            .field("pending", &self.len())
            .finish()
    }
}

impl<T: Send + 'static> PendingRequests<T> {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a request and returns the handle its reply will arrive on.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::DuplicateCorrelation`] when `id` is already
    /// pending.
    pub fn register(&self, id: CorrelationId) -> ProtocolResult<PendingReply<T>> {
        let (tx, rx) = oneshot::channel();
        let mut entries = self.lock();
        if entries.slots.contains_key(&id) {
            return Err(ProtocolError::DuplicateCorrelation { id });
        }
        let registration = entries.next;
        entries.next += 1;
        entries.slots.insert(id.clone(), (registration, tx));
        Ok(PendingReply {
            id,
            registration,
            rx,
            entries: Arc::clone(&self.entries),
        })
    }

    /// Delivers `value` to the request registered under `id`.
    ///
    /// Returns `false` when no such request is pending.
    pub fn resolve(&self, id: &CorrelationId, value: T) -> bool {
        self.complete(id, Ok(value))
    }

    /// Fails the request registered under `id`.
    pub fn fail(&self, id: &CorrelationId, error: ProtocolError) -> bool {
        self.complete(id, Err(error))
    }

    /// Fails every pending request, returning how many were failed.
    pub fn fail_all(&self, reason: &str) -> usize {
        let drained: Vec<_> = self.lock().slots.drain().collect();
        let count = drained.len();
        for (id, (_, slot)) in drained {
            debug!(%id, reason, "failing pending request");
            let _ = slot.send(Err(ProtocolError::cancelled(reason)));
        }
        count
    }

    /// Returns `true` if `id` is pending.
    #[must_use]
    pub fn contains(&self, id: &CorrelationId) -> bool {
        self.lock().slots.contains_key(id)
    }

    fn complete(&self, id: &CorrelationId, outcome: ProtocolResult<T>) -> bool {
        let Some((_, slot)) = self.lock().slots.remove(id) else {
            return false;
        };
        slot.send(outcome).is_ok()
    }
}

impl<T> PendingRequests<T> {
    /// Returns the number of pending requests.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().slots.len()
    }

    /// Returns `true` when nothing is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().slots.is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Entries<T>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Receiving half of a pending request. Dropping it removes the entry it
/// registered, if that entry is still pending.
pub struct PendingReply<T> {
    id: CorrelationId,
    registration: u64,
    rx: oneshot::Receiver<ProtocolResult<T>>,
    entries: Table<T>,
}

impl<T> fmt::Debug for PendingReply<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingReply").field("id", &self.id).finish()
    }
}

impl<T> PendingReply<T> {
    /// Returns the correlation id the reply is expected under.
    #[must_use]
    pub fn id(&self) -> &CorrelationId {
        &self.id
    }

    /// Waits for the reply.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Cancelled`] when the request was failed or the
    /// table was dropped.
    pub async fn wait(mut self) -> ProtocolResult<T> {
        match (&mut self.rx).await {
            Ok(outcome) => outcome,
            Err(_) => Err(ProtocolError::cancelled("pending request table dropped")),
        }
    }

    /// Waits for the reply for at most `timeout`, removing the entry on expiry.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Timeout`] on expiry, otherwise as
    /// [`wait`](Self::wait).
    pub async fn wait_timeout(self, timeout: Duration) -> ProtocolResult<T> {
        let operation = format!("request `{}`", self.id);
        match tokio::time::timeout(timeout, self.wait()).await {
            Ok(outcome) => outcome,
            Err(_) => Err(ProtocolError::Timeout { operation, timeout }),
        }
    }
}

impl<T> Drop for PendingReply<T> {
    fn drop(&mut self) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove_registration(&self.id, self.registration);
    }
}
