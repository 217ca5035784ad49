//! Warmup Orchestrator - staged cache population
//!
//! Runs the [`WarmupStep`]s strictly in order, one at a time, recording each
//! step's lifecycle in a [`WarmupState`] that readers poll through
//! [`Warmup::status`]. A failing step is recorded and the pipeline moves on:
//! every step fills its own cache namespace.
//!
//! Each step runs in its own task behind a timeout, so a panic or a hung
//! source query ends up as a `failed` step instead of taking the pipeline
//! down with it.

pub mod state;
pub mod steps;

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::WarmupConfig;
use crate::error::{MonitorError, Result};
use crate::scheduler::ShutdownSignal;

pub use state::{StepState, StepStatus, WarmupState, WarmupStatus, WarmupStep};
pub use steps::{
    CacheFillRunner, DeploymentGate, DeploymentProbe, FillTarget, QueryFetcher, RestoreRunner,
    SlotWarmupRunner, StepOutcome, StepRunner, ValidityCheckRunner,
};

/// Clears the in-progress flag when a run ends, is aborted, or panics
///
/// A run dropped before [`RunGuard::finish`] (task aborted after the
/// shutdown grace, or a panic) is recorded as cancelled so the status never
/// stays `warming` with a step stuck in `running`.
struct RunGuard {
    running: Arc<AtomicBool>,
    state: Arc<RwLock<WarmupState>>,
    clock: Arc<dyn Clock>,
    finished: bool,
}

impl RunGuard {
    fn finish(&mut self) {
        self.finished = true;
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if !self.finished {
            let mut state = self.state.write();
            state.mark_cancelled(self.clock.now());
            warn!(
                run_id = ?state.run_id,
                finished = state.finished_steps(),
                "Warmup run dropped before finishing"
            );
        }
        self.running.store(false, Ordering::Release);
    }
}

/// Aborts the wrapped task if the awaiting side goes away (timeout, abandon)
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|msg| (*msg).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string())
}

/// Warmup pipeline
pub struct Warmup {
    state: Arc<RwLock<WarmupState>>,
    runners: BTreeMap<WarmupStep, Arc<dyn StepRunner>>,
    running: Arc<AtomicBool>,
    clock: Arc<dyn Clock>,
    config: WarmupConfig,
}

impl Warmup {
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>, config: WarmupConfig) -> Self {
        Self {
            state: Arc::new(RwLock::new(WarmupState::default())),
            runners: BTreeMap::new(),
            running: Arc::new(AtomicBool::new(false)),
            clock,
            config,
        }
    }

    /// Register the runner for `step`, replacing any previous one
    ///
    /// A step without a runner is recorded as completed with a "skipped" note.
    #[must_use]
    pub fn with_runner(mut self, step: WarmupStep, runner: Arc<dyn StepRunner>) -> Self {
        self.runners.insert(step, runner);
        self
    }

    /// Snapshot of the current (or last) run
    #[must_use]
    pub fn status(&self) -> WarmupState {
        self.state.read().clone()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Claim the pipeline and reset every state field for a new run
    fn begin(&self) -> Result<RunGuard> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(MonitorError::WarmupInProgress);
        }
        let guard = RunGuard {
            running: Arc::clone(&self.running),
            state: Arc::clone(&self.state),
            clock: Arc::clone(&self.clock),
            finished: false,
        };

        let run_id = Uuid::new_v4();
        *self.state.write() = WarmupState::for_run(run_id, self.clock.now());
        info!(%run_id, steps = WarmupStep::ALL.len(), "Warmup run starting");
        Ok(guard)
    }

    /// Start a run in the background
    ///
    /// The state is reset before this returns, so a `status()` call right
    /// after never observes the previous run.
    ///
    /// # Errors
    ///
    /// Returns `WarmupInProgress` if a run is already going.
    pub fn start(self: &Arc<Self>, signal: ShutdownSignal) -> Result<JoinHandle<WarmupState>> {
        let guard = self.begin()?;
        let this = Arc::clone(self);
        Ok(tokio::spawn(async move { this.execute(guard, signal).await }))
    }

    /// Run the pipeline to completion on the current task
    ///
    /// # Errors
    ///
    /// Returns `WarmupInProgress` if a run is already going.
    pub async fn run(&self, signal: ShutdownSignal) -> Result<WarmupState> {
        let guard = self.begin()?;
        Ok(self.execute(guard, signal).await)
    }

    async fn execute(&self, mut guard: RunGuard, signal: ShutdownSignal) -> WarmupState {
        for step in WarmupStep::ALL {
            if signal.is_triggered() {
                guard.finish();
                let mut state = self.state.write();
                state.mark_cancelled(self.clock.now());
                warn!(
                    next_step = %step,
                    finished = state.finished_steps(),
                    "Warmup cancelled by shutdown"
                );
                return state.clone();
            }

            self.state.write().mark_running(step, self.clock.now());
            let outcome = self.run_step(step).await;
            let now = self.clock.now();

            match outcome {
                Ok(StepOutcome::Completed(detail)) => {
                    info!(step = %step, detail = detail.as_deref().unwrap_or(""), "Warmup step completed");
                    self.state.write().mark_completed(step, now, detail);
                }
                Ok(StepOutcome::Skipped(reason)) => {
                    info!(step = %step, reason = %reason, "Warmup step skipped");
                    self.state
                        .write()
                        .mark_completed(step, now, Some(format!("skipped: {reason}")));
                }
                Err(e) => {
                    warn!(step = %step, error = %e, "Warmup step failed, continuing");
                    self.state.write().mark_failed(step, now, e.to_string());
                }
            }
        }

        guard.finish();
        let mut state = self.state.write();
        state.completed_at = Some(self.clock.now());
        info!(
            run_id = ?state.run_id,
            failed = state.failed_steps(),
            "Warmup run finished"
        );
        state.clone()
    }

    /// Run one step behind its own task boundary and timeout
    async fn run_step(&self, step: WarmupStep) -> Result<StepOutcome> {
        let Some(runner) = self.runners.get(&step).cloned() else {
            return Ok(StepOutcome::Skipped("no runner registered".to_string()));
        };
        let failed = |reason: String| MonitorError::StepExecution {
            step: step.name(),
            reason,
        };

        let mut task = AbortOnDrop(tokio::spawn(async move { runner.run().await }));
        match tokio::time::timeout(self.config.step_timeout, &mut task.0).await {
            Ok(Ok(Ok(outcome))) => Ok(outcome),
            Ok(Ok(Err(e))) => Err(failed(format!("{e:#}"))),
            Ok(Err(join_err)) if join_err.is_panic() => {
                let payload = join_err.into_panic();
                Err(failed(format!("panicked: {}", panic_message(payload.as_ref()))))
            }
            Ok(Err(join_err)) => Err(failed(join_err.to_string())),
            Err(_) => Err(failed(format!(
                "timed out after {}s",
                self.config.step_timeout.as_secs()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use async_trait::async_trait;

    struct Panics;

    #[async_trait]
    impl StepRunner for Panics {
        async fn run(&self) -> anyhow::Result<StepOutcome> {
            panic!("dashboard query exploded");
        }
    }

    #[test]
    fn panic_payloads_are_readable() {
        let owned: Box<dyn Any + Send> = Box::new(String::from("owned"));
        let borrowed: Box<dyn Any + Send> = Box::new("borrowed");
        assert_eq!(panic_message(owned.as_ref()), "owned");
        assert_eq!(panic_message(borrowed.as_ref()), "borrowed");
    }

    #[tokio::test]
    async fn panicking_step_is_recorded_as_failed() {
        let warmup = Warmup::new(Arc::new(SystemClock), WarmupConfig::default())
            .with_runner(WarmupStep::Dashboard, Arc::new(Panics));

        let state = warmup.run(ShutdownSignal::never()).await.unwrap();
        let dashboard = state.step(WarmupStep::Dashboard).unwrap();

        assert_eq!(state.status, WarmupStatus::Ready);
        assert_eq!(dashboard.status, StepStatus::Failed);
        assert!(dashboard.error.as_deref().unwrap_or("").contains("dashboard query exploded"));
        assert!(!warmup.is_running());
    }
}
