//! Warmup run state
//!
//! Top-level status, phase, progress and message are derived from the step
//! list by [`WarmupState::refresh`]; only cancellation sets `Error` directly.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Pipeline steps in execution order
///
/// The order is fixed: each step's discriminant is its priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WarmupStep {
    RestoreFromDurable,
    ValidityCheck,
    Leaderboard,
    Dashboard,
    UserActivity,
    IpMonitoring,
    IpDistribution,
    ModelStatus,
}

impl WarmupStep {
    pub const ALL: [WarmupStep; 8] = [
        WarmupStep::RestoreFromDurable,
        WarmupStep::ValidityCheck,
        WarmupStep::Leaderboard,
        WarmupStep::Dashboard,
        WarmupStep::UserActivity,
        WarmupStep::IpMonitoring,
        WarmupStep::IpDistribution,
        WarmupStep::ModelStatus,
    ];

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::RestoreFromDurable => "restore-from-durable-cache",
            Self::ValidityCheck => "validity-check",
            Self::Leaderboard => "leaderboard",
            Self::Dashboard => "dashboard",
            Self::UserActivity => "user-activity",
            Self::IpMonitoring => "ip-monitoring",
            Self::IpDistribution => "ip-distribution",
            Self::ModelStatus => "model-status",
        }
    }
}

impl fmt::Display for WarmupStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WarmupStatus {
    Initializing,
    Warming,
    Ready,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl StepStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// State of one step within the current run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepState {
    pub step: WarmupStep,
    pub status: StepStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    /// Outcome note, e.g. entry counts or why the step was skipped
    pub detail: Option<String>,
}

impl StepState {
    fn pending(step: WarmupStep) -> Self {
        Self {
            step,
            status: StepStatus::Pending,
            started_at: None,
            completed_at: None,
            error: None,
            detail: None,
        }
    }
}

/// Snapshot of the warmup pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WarmupState {
    pub run_id: Option<Uuid>,
    pub status: WarmupStatus,
    /// Step currently running, or the last one to finish
    pub phase: Option<WarmupStep>,
    pub progress_percent: f64,
    pub message: String,
    pub steps: Vec<StepState>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Default for WarmupState {
    fn default() -> Self {
        Self {
            run_id: None,
            status: WarmupStatus::Initializing,
            phase: None,
            progress_percent: 0.0,
            message: String::new(),
            steps: WarmupStep::ALL.into_iter().map(StepState::pending).collect(),
            started_at: None,
            completed_at: None,
        }
    }
}

impl WarmupState {
    /// Fresh state for a new run; nothing carries over from the previous one
    #[must_use]
    pub fn for_run(run_id: Uuid, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id: Some(run_id),
            started_at: Some(started_at),
            message: "starting".to_string(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn step(&self, step: WarmupStep) -> Option<&StepState> {
        self.steps.iter().find(|s| s.step == step)
    }

    fn step_mut(&mut self, step: WarmupStep) -> Option<&mut StepState> {
        self.steps.iter_mut().find(|s| s.step == step)
    }

    pub(crate) fn mark_running(&mut self, step: WarmupStep, at: DateTime<Utc>) {
        if let Some(s) = self.step_mut(step) {
            s.status = StepStatus::Running;
            s.started_at = Some(at);
        }
        self.refresh();
    }

    pub(crate) fn mark_completed(&mut self, step: WarmupStep, at: DateTime<Utc>, detail: Option<String>) {
        if let Some(s) = self.step_mut(step) {
            s.status = StepStatus::Completed;
            s.completed_at = Some(at);
            s.detail = detail;
        }
        self.refresh();
    }

    pub(crate) fn mark_failed(&mut self, step: WarmupStep, at: DateTime<Utc>, error: String) {
        if let Some(s) = self.step_mut(step) {
            s.status = StepStatus::Failed;
            s.completed_at = Some(at);
            s.error = Some(error);
        }
        self.refresh();
    }

    /// Stop the run; a step caught mid-flight is failed as cancelled
    pub(crate) fn mark_cancelled(&mut self, at: DateTime<Utc>) {
        for s in self.steps.iter_mut().filter(|s| s.status == StepStatus::Running) {
            s.status = StepStatus::Failed;
            s.completed_at = Some(at);
            s.error = Some("cancelled".to_string());
        }
        self.status = WarmupStatus::Error;
        self.message = "cancelled".to_string();
    }

    /// Number of steps in a terminal state
    #[must_use]
    pub fn finished_steps(&self) -> usize {
        self.steps.iter().filter(|s| s.status.is_terminal()).count()
    }

    #[must_use]
    pub fn failed_steps(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Failed)
            .count()
    }

    /// Re-derive status, phase, progress and message from the steps
    #[allow(clippy::cast_precision_loss)]
    pub(crate) fn refresh(&mut self) {
        let total = self.steps.len();
        let finished = self.finished_steps();
        self.progress_percent = if total == 0 {
            100.0
        } else {
            finished as f64 / total as f64 * 100.0
        };

        let running = self.steps.iter().find(|s| s.status == StepStatus::Running);
        let last_finished = self.steps.iter().rev().find(|s| s.status.is_terminal());
        if let Some(current) = running.or(last_finished) {
            self.phase = Some(current.step);
            self.message = current.step.name().to_string();
        }

        self.status = if finished == total {
            WarmupStatus::Ready
        } else if running.is_none() && finished == 0 {
            WarmupStatus::Initializing
        } else {
            WarmupStatus::Warming
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn steps_are_in_priority_order() {
        let mut sorted = WarmupStep::ALL;
        sorted.sort();
        assert_eq!(sorted, WarmupStep::ALL);
        assert_eq!(WarmupStep::ALL[0].name(), "restore-from-durable-cache");
        assert_eq!(WarmupStep::ALL[7].name(), "model-status");
    }

    #[test]
    fn status_is_derived_from_steps() {
        let now = Utc::now();
        let mut state = WarmupState::for_run(Uuid::new_v4(), now);
        assert_eq!(state.status, WarmupStatus::Initializing);

        state.mark_running(WarmupStep::RestoreFromDurable, now);
        assert_eq!(state.status, WarmupStatus::Warming);
        assert_eq!(state.message, "restore-from-durable-cache");
        assert!(state.progress_percent.abs() < f64::EPSILON);

        state.mark_failed(WarmupStep::RestoreFromDurable, now, "boom".to_string());
        assert_eq!(state.status, WarmupStatus::Warming);
        assert!((state.progress_percent - 12.5).abs() < f64::EPSILON);

        for step in &WarmupStep::ALL[1..] {
            state.mark_running(*step, now);
            state.mark_completed(*step, now, None);
        }
        assert_eq!(state.status, WarmupStatus::Ready);
        assert!((state.progress_percent - 100.0).abs() < f64::EPSILON);
        assert_eq!(state.phase, Some(WarmupStep::ModelStatus));
        assert_eq!(state.failed_steps(), 1);
    }

    #[test]
    fn status_serializes_lowercase() {
        let json = serde_json::to_string(&WarmupState::default()).unwrap_or_default();
        assert!(json.contains("\"initializing\""));
        assert!(json.contains("\"pending\""));
    }
}
