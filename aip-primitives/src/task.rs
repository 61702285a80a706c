//! Owned handles for long-running loops.

use std::future::Future;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Cooperative stop flag handed to a [`BackgroundTask`] body.
#[derive(Debug, Clone)]
pub struct StopSignal(watch::Receiver<bool>);

impl StopSignal {
    /// Returns `true` once a stop was requested or the owning handle dropped.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        *self.0.borrow() || self.0.has_changed().is_err()
    }

    /// Resolves when a stop is requested or the owning handle is dropped.
    pub async fn stopped(&mut self) {
        while !*self.0.borrow_and_update() {
            if self.0.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Spawned loop owned by the component that started it.
///
/// [`stop`](Self::stop) signals the loop and awaits its termination, so the
/// caller knows the loop has exited when the call returns. Dropping the handle
/// also signals the loop but does not wait for it.
#[derive(Debug)]
pub struct BackgroundTask {
    name: String,
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl BackgroundTask {
    /// Spawns `body` on the current runtime, handing it a [`StopSignal`].
    pub fn spawn<F, Fut>(name: impl Into<String>, body: F) -> Self
    where
        F: FnOnce(StopSignal) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (stop, rx) = watch::channel(false);
        let handle = tokio::spawn(body(StopSignal(rx)));
        Self {
            name: name.into(),
            stop,
            handle,
        }
    }

    /// Returns the task label used in logs.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns `true` if the loop already exited on its own.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Signals the loop to stop and waits for it to exit.
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        self.join().await;
    }

    /// Aborts the loop at its next suspension point and waits for it to exit.
    pub async fn cancel(self) {
        self.handle.abort();
        self.join().await;
    }

    async fn join(self) {
        match self.handle.await {
            Ok(()) => debug!(task = %self.name, "background task stopped"),
            Err(err) if err.is_cancelled() => debug!(task = %self.name, "background task cancelled"),
            Err(err) => warn!(task = %self.name, ?err, "background task panicked"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn stop_waits_for_loop_exit() {
        let exited = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&exited);
        let task = BackgroundTask::spawn("waiter", |mut stop| async move {
            stop.stopped().await;
            tokio::time::sleep(Duration::from_millis(10)).await;
            flag.store(true, Ordering::SeqCst);
        });

        task.stop().await;
        assert!(exited.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_aborts_a_loop_that_ignores_the_signal() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);
        let task = BackgroundTask::spawn("spinner", |_stop| async move {
            loop {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });

        tokio::time::sleep(Duration::from_millis(12)).await;
        task.cancel().await;
        let seen = ticks.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), seen);
    }

    #[tokio::test]
    async fn dropping_the_handle_signals_stop() {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let task = BackgroundTask::spawn("dropped", |mut stop| async move {
            stop.stopped().await;
            let _ = tx.send(());
        });

        drop(task);
        tokio::time::timeout(Duration::from_secs(1), rx)
            .await
            .expect("loop should observe the drop")
            .unwrap();
    }
}
