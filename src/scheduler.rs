//! Background scheduling
//!
//! Periodic tasks (checkpoint pass, cache expiry sweep, optional warmup
//! re-run) each run in their own tokio task on a fixed interval and stop
//! scheduling new runs as soon as the shutdown signal flips. Work already in
//! flight gets a bounded grace period; whatever is still running after it is
//! aborted. Progress already committed stays committed.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};

/// Sending half of the shutdown signal
#[derive(Debug)]
pub struct Shutdown {
    tx: watch::Sender<bool>,
}

impl Shutdown {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    /// A receiver observing this shutdown
    #[must_use]
    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
            _detached: None,
        }
    }

    /// Flip the signal; idempotent
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    #[must_use]
    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving half of the shutdown signal, cheap to clone
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
    /// Sender kept alive for signals not tied to a [`Shutdown`]
    _detached: Option<Arc<watch::Sender<bool>>>,
}

impl ShutdownSignal {
    /// A signal that never fires, for one-off runs outside the scheduler
    #[must_use]
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            rx,
            _detached: Some(Arc::new(tx)),
        }
    }

    #[must_use]
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown has been triggered (or the sender is gone)
    pub async fn triggered(&mut self) {
        let _ = self.rx.wait_for(|stop| *stop).await;
    }
}

/// Owner of the periodic background tasks
pub struct Scheduler {
    shutdown: Shutdown,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl Scheduler {
    #[must_use]
    pub fn new() -> Self {
        Self {
            shutdown: Shutdown::new(),
            tasks: Vec::new(),
        }
    }

    /// Signal handed to work that must observe shutdown mid-run
    #[must_use]
    pub fn signal(&self) -> ShutdownSignal {
        self.shutdown.signal()
    }

    /// Run `task` every `period` until shutdown
    ///
    /// The first run fires after one full period. Ticks missed while a run
    /// is still going are skipped, never queued. `task` owns its own error
    /// handling; one failed run never stops the loop.
    pub fn spawn_periodic<F, Fut>(&mut self, name: &'static str, period: Duration, mut task: F)
    where
        F: FnMut(ShutdownSignal) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut signal = self.shutdown.signal();
        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // interval fires immediately; consume that tick
            ticker.tick().await;

            info!(task = name, period_secs = period.as_secs(), "Periodic task started");
            loop {
                tokio::select! {
                    () = signal.triggered() => break,
                    _ = ticker.tick() => {
                        if signal.is_triggered() {
                            break;
                        }
                        debug!(task = name, "Periodic task tick");
                        task(signal.clone()).await;
                    }
                }
            }
            info!(task = name, "Periodic task stopped");
        });

        self.tasks.push((name, handle));
    }

    /// Track a one-off task so shutdown waits for it too
    pub fn track(&mut self, name: &'static str, handle: JoinHandle<()>) {
        self.tasks.push((name, handle));
    }

    /// Number of tracked tasks still running
    #[must_use]
    pub fn active_tasks(&self) -> usize {
        self.tasks.iter().filter(|(_, h)| !h.is_finished()).count()
    }

    /// Signal shutdown, wait up to `grace`, then abort stragglers
    ///
    /// Returns the names of tasks that had to be aborted.
    pub async fn shutdown(self, grace: Duration) -> Vec<&'static str> {
        self.shutdown.trigger();
        info!(tasks = self.tasks.len(), grace_secs = grace.as_secs(), "Shutting down background tasks");

        let (names, handles): (Vec<_>, Vec<_>) = self.tasks.into_iter().unzip();
        let aborts: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();

        if tokio::time::timeout(grace, join_all(handles)).await.is_ok() {
            info!("Background tasks stopped cleanly");
            return Vec::new();
        }

        let mut abandoned = Vec::new();
        for (name, abort) in names.into_iter().zip(aborts) {
            if !abort.is_finished() {
                warn!(task = name, "Grace period elapsed, abandoning task");
                abort.abort();
                abandoned.push(name);
            }
        }
        abandoned
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}
