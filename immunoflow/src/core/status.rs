//! Stage run and pipeline run status enums.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The execution status of a stage run.
///
/// Legal transitions:
/// `Pending -> Running -> {Succeeded, Failed}`, `Failed -> Running` (retry),
/// and `Pending -> SkippedCached`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageRunStatus {
    /// Waiting for upstream stages or a worker slot.
    #[default]
    Pending,
    /// The collaborator is being invoked.
    Running,
    /// The collaborator produced an artifact.
    Succeeded,
    /// The last attempt failed.
    Failed,
    /// An equivalent run already succeeded; its output was reused.
    SkippedCached,
}

impl fmt::Display for StageRunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::SkippedCached => write!(f, "skipped_cached"),
        }
    }
}

impl StageRunStatus {
    /// Returns true if moving from `self` to `next` is a legal transition.
    #[must_use]
    pub const fn can_transition_to(&self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running | Self::SkippedCached)
                | (Self::Running, Self::Succeeded | Self::Failed)
                | (Self::Failed, Self::Running)
        )
    }

    /// Returns true if the run produced (or reused) an output artifact.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded | Self::SkippedCached)
    }

    /// Returns true if no further transition is expected without a retry.
    #[must_use]
    pub const fn is_settled(&self) -> bool {
        matches!(self, Self::Succeeded | Self::SkippedCached | Self::Failed)
    }
}

/// Lifecycle state of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineRunStatus {
    /// Stages are still being scheduled.
    #[default]
    Running,
    /// The target artifact was produced.
    Completed,
    /// A stage failed and blocked the target.
    Failed,
    /// The run was cancelled before completion.
    Cancelled,
}

impl fmt::Display for PipelineRunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_run_status_transitions() {
        use StageRunStatus::*;

        assert!(Pending.can_transition_to(Running));
        assert!(Pending.can_transition_to(SkippedCached));
        assert!(Running.can_transition_to(Succeeded));
        assert!(Running.can_transition_to(Failed));
        assert!(Failed.can_transition_to(Running));

        assert!(!Pending.can_transition_to(Succeeded));
        assert!(!Running.can_transition_to(SkippedCached));
        assert!(!Succeeded.can_transition_to(Running));
        assert!(!SkippedCached.can_transition_to(Running));
        assert!(!Failed.can_transition_to(Succeeded));
    }

    #[test]
    fn test_stage_run_status_success() {
        assert!(StageRunStatus::Succeeded.is_success());
        assert!(StageRunStatus::SkippedCached.is_success());
        assert!(!StageRunStatus::Failed.is_success());
        assert!(!StageRunStatus::Running.is_settled());
    }

    #[test]
    fn test_stage_run_status_serialize() {
        let json = serde_json::to_string(&StageRunStatus::SkippedCached).unwrap();
        assert_eq!(json, r#""skipped_cached""#);

        let status: StageRunStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(status, StageRunStatus::SkippedCached);
    }

    #[test]
    fn test_pipeline_run_status_display() {
        assert_eq!(PipelineRunStatus::Completed.to_string(), "completed");
        assert_eq!(PipelineRunStatus::Cancelled.to_string(), "cancelled");
    }
}
