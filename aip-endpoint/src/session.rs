//! Server-side task sessions and the scheduler that runs them.

use std::collections::HashMap;
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use aip_primitives::CorrelationId;
use tokio::sync::Semaphore;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::debug;

use crate::{EndpointError, EndpointResult, SessionLookup};

/// One task session tracked by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
    /// Session identifier.
    pub session_id: String,
    /// Device executing the task.
    pub device_id: String,
    /// Client that submitted the task.
    pub requester_id: String,
    /// `request_id` of the TASK that opened the session.
    pub request_id: Option<CorrelationId>,
    /// Short task name.
    pub task_name: Option<String>,
}

#[derive(Debug)]
struct Entry {
    record: SessionRecord,
    abort: Option<AbortHandle>,
}

/// Sessions in flight, keyed by session id. Clones share the table.
#[derive(Debug, Clone, Default)]
pub struct SessionTable {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
}

impl SessionTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a session, replacing any entry with the same id.
    pub fn insert(&self, record: SessionRecord) {
        let session_id = record.session_id.clone();
        self.lock().insert(session_id, Entry { record, abort: None });
    }

    /// Binds the task running a session so it can be aborted.
    pub fn attach(&self, session_id: &str, abort: AbortHandle) {
        if let Some(entry) = self.lock().get_mut(session_id) {
            entry.abort = Some(abort);
        }
    }

    /// Removes a finished session.
    pub fn remove(&self, session_id: &str) -> Option<SessionRecord> {
        self.lock().remove(session_id).map(|entry| entry.record)
    }

    /// Removes a session and aborts its task.
    pub fn abort(&self, session_id: &str) -> Option<SessionRecord> {
        let entry = self.lock().remove(session_id)?;
        if let Some(handle) = entry.abort {
            handle.abort();
            debug!(%session_id, "session task aborted");
        }
        Some(entry.record)
    }

    /// Returns a copy of a session record.
    #[must_use]
    pub fn get(&self, session_id: &str) -> Option<SessionRecord> {
        self.lock().get(session_id).map(|entry| entry.record.clone())
    }

    /// Number of sessions in flight.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns `true` when no session is in flight.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SessionLookup for SessionTable {
    fn get_device_sessions(&self, device_id: &str) -> Vec<String> {
        let mut sessions: Vec<_> = self
            .lock()
            .values()
            .filter(|entry| entry.record.device_id == device_id)
            .map(|entry| entry.record.session_id.clone())
            .collect();
        sessions.sort();
        sessions
    }
}

/// Spawns session tasks under a concurrency cap.
#[derive(Debug, Clone)]
pub struct SessionScheduler {
    semaphore: Arc<Semaphore>,
    closed: Arc<AtomicBool>,
}

impl SessionScheduler {
    /// Creates a scheduler admitting `max_sessions` concurrent tasks.
    #[must_use]
    pub fn new(max_sessions: NonZeroUsize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_sessions.get())),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Returns `true` once [`close`](Self::close) was called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stops admitting tasks. Tasks still waiting for a slot never run.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.semaphore.close();
    }

    /// Spawns a session task that starts once a slot is free.
    ///
    /// # Errors
    ///
    /// Returns [`EndpointError::SchedulerClosed`] after [`close`](Self::close).
    pub fn spawn<F>(&self, future: F) -> EndpointResult<JoinHandle<()>>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.is_closed() {
            return Err(EndpointError::SchedulerClosed);
        }
        let semaphore = Arc::clone(&self.semaphore);
        Ok(tokio::spawn(async move {
            let Ok(permit) = semaphore.acquire_owned().await else {
                debug!("scheduler closed before the session started");
                return;
            };
            future.await;
            drop(permit);
        }))
    }
}
