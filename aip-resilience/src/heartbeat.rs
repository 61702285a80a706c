//! Per-client heartbeat scheduling.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use aip_primitives::{BackgroundTask, StopSignal};
use aip_protocol::HeartbeatProtocol;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Runs one heartbeat loop per client id over a shared [`HeartbeatProtocol`].
///
/// Unlike [`HeartbeatProtocol::start_heartbeat`], a failed send does not end
/// a loop here; only [`stop_heartbeat`](Self::stop_heartbeat) or
/// [`stop_all`](Self::stop_all) do.
pub struct HeartbeatManager {
    protocol: HeartbeatProtocol,
    tasks: Mutex<HashMap<String, BackgroundTask>>,
    intervals: Mutex<HashMap<String, Duration>>,
}

impl fmt::Debug for HeartbeatManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeartbeatManager")
            .field("protocol", &self.protocol)
            .field("clients", &self.active_clients())
            .finish()
    }
}

impl HeartbeatManager {
    /// Creates a manager with no running loops.
    #[must_use]
    pub fn new(protocol: HeartbeatProtocol) -> Self {
        Self {
            protocol,
            tasks: Mutex::new(HashMap::new()),
            intervals: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the protocol heartbeats are sent through.
    #[must_use]
    pub fn protocol(&self) -> &HeartbeatProtocol {
        &self.protocol
    }

    /// Starts a loop for `client_id`, stopping any loop already running for
    /// it first.
    pub async fn start_heartbeat(&self, client_id: &str, interval: Duration) {
        self.stop_heartbeat(client_id).await;

        let protocol = self.protocol.clone();
        let id = client_id.to_owned();
        let task = BackgroundTask::spawn(format!("heartbeat-{client_id}"), move |stop| {
            run_heartbeat(protocol, id, interval, stop)
        });

        let displaced = self.lock_tasks().insert(client_id.to_owned(), task);
        self.lock_intervals().insert(client_id.to_owned(), interval);
        if let Some(displaced) = displaced {
            displaced.stop().await;
        }
        info!(%client_id, ?interval, "heartbeat scheduled");
    }

    /// Stops the loop for `client_id` and waits for it to exit. Returns
    /// `false` if none was running.
    pub async fn stop_heartbeat(&self, client_id: &str) -> bool {
        let task = self.lock_tasks().remove(client_id);
        self.lock_intervals().remove(client_id);
        match task {
            Some(task) => {
                task.stop().await;
                debug!(%client_id, "heartbeat stopped");
                true
            }
            None => false,
        }
    }

    /// Stops every loop, one at a time in client id order.
    pub async fn stop_all(&self) {
        let mut tasks: Vec<_> = self.lock_tasks().drain().collect();
        self.lock_intervals().clear();
        tasks.sort_by(|(left, _), (right, _)| left.cmp(right));
        for (client_id, task) in tasks {
            task.stop().await;
            debug!(%client_id, "heartbeat stopped");
        }
    }

    /// Returns `true` while a loop for `client_id` is running.
    #[must_use]
    pub fn is_active(&self, client_id: &str) -> bool {
        self.lock_tasks()
            .get(client_id)
            .is_some_and(|task| !task.is_finished())
    }

    /// Interval of the loop for `client_id`.
    #[must_use]
    pub fn interval_for(&self, client_id: &str) -> Option<Duration> {
        self.lock_intervals().get(client_id).copied()
    }

    /// Client ids with a scheduled loop, sorted.
    #[must_use]
    pub fn active_clients(&self) -> Vec<String> {
        let mut clients: Vec<_> = self.lock_tasks().keys().cloned().collect();
        clients.sort();
        clients
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, HashMap<String, BackgroundTask>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_intervals(&self) -> std::sync::MutexGuard<'_, HashMap<String, Duration>> {
        self.intervals.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn run_heartbeat(
    protocol: HeartbeatProtocol,
    client_id: String,
    period: Duration,
    mut stop: StopSignal,
) {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            () = stop.stopped() => break,
            _ = interval.tick() => {}
        }
        if !protocol.is_connected() {
            debug!(%client_id, "not connected; skipping heartbeat");
            continue;
        }
        if let Err(err) = protocol.send_heartbeat(&client_id, None).await {
            warn!(%client_id, ?err, "heartbeat send failed");
        }
    }
}
