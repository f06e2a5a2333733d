//! Pipeline run report.

use super::{ArtifactId, ArtifactType, PipelineRunStatus, SampleId, StageRun};
use crate::errors::{Diagnostic, FailureClass, StageExecutionError};
use crate::utils::{now_utc, Timestamp};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Details of the first stage failure that blocked a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFailure {
    /// The first failing stage.
    pub stage_id: String,
    /// Transient or permanent.
    pub class: FailureClass,
    /// Captured diagnostic.
    pub diagnostic: Diagnostic,
    /// Attempts made before giving up.
    pub attempts: u32,
}

/// One request to materialize a target artifact type for a sample.
///
/// A `PipelineRun` only holds identifiers; payloads stay in the artifact
/// store and stage history in the checkpoint store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    /// Unique run id.
    pub run_id: Uuid,
    /// Requested artifact type.
    pub target: ArtifactType,
    /// Sample scope.
    pub sample: SampleId,
    /// Planned stage ids in execution order.
    pub plan: Vec<String>,
    /// Settled stage runs, in completion order.
    pub stage_runs: Vec<StageRun>,
    /// Lifecycle state.
    pub status: PipelineRunStatus,
    /// The produced target, once completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_artifact: Option<ArtifactId>,
    /// First failure, if the run failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<RunFailure>,
    /// Command that re-runs this request against existing checkpoints.
    pub resume_command: String,
    /// When the run started.
    pub started_at: Timestamp,
    /// When the run ended.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<Timestamp>,
}

impl PipelineRun {
    /// Creates a new running pipeline run.
    #[must_use]
    pub fn new(
        run_id: Uuid,
        target: ArtifactType,
        sample: SampleId,
        plan: Vec<String>,
        resume_command: impl Into<String>,
    ) -> Self {
        Self {
            run_id,
            target,
            sample,
            plan,
            stage_runs: Vec::new(),
            status: PipelineRunStatus::Running,
            target_artifact: None,
            failure: None,
            resume_command: resume_command.into(),
            started_at: now_utc(),
            finished_at: None,
        }
    }

    /// Returns the stage run for `stage_id`, if it settled.
    #[must_use]
    pub fn stage_run(&self, stage_id: &str) -> Option<&StageRun> {
        self.stage_runs.iter().find(|r| r.stage_id == stage_id)
    }

    /// Stage ids whose collaborator was invoked, in completion order.
    #[must_use]
    pub fn invoked_stages(&self) -> Vec<&str> {
        self.stage_runs
            .iter()
            .filter(|r| r.was_invoked())
            .map(|r| r.stage_id.as_str())
            .collect()
    }

    /// Stage ids satisfied from checkpoints.
    #[must_use]
    pub fn cached_stages(&self) -> Vec<&str> {
        self.stage_runs
            .iter()
            .filter(|r| r.status == super::StageRunStatus::SkippedCached)
            .map(|r| r.stage_id.as_str())
            .collect()
    }

    /// Total collaborator invocations, retries included.
    #[must_use]
    pub fn invocation_count(&self) -> u32 {
        self.stage_runs.iter().map(|r| r.attempts).sum()
    }

    /// Returns true if the target artifact was produced.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.status == PipelineRunStatus::Completed
    }

    /// The first stage failure as an error naming the stage.
    #[must_use]
    pub fn execution_error(&self) -> Option<StageExecutionError> {
        self.failure.as_ref().map(|f| {
            StageExecutionError::new(&f.stage_id, f.class, f.diagnostic.clone(), f.attempts)
        })
    }

    /// One-paragraph summary for terminal output.
    #[must_use]
    pub fn summary(&self) -> String {
        let mut text = format!(
            "run {} [{} for sample {}]: {} ({} invoked, {} cached)",
            self.run_id,
            self.target,
            self.sample,
            self.status,
            self.invoked_stages().len(),
            self.cached_stages().len(),
        );
        if let Some(id) = &self.target_artifact {
            text.push_str(&format!("\ntarget artifact: {id}"));
        }
        if let Some(failure) = &self.failure {
            text.push_str(&format!(
                "\nfirst failing stage: {} ({}, {} attempt(s))\n{}\nresume with: {}",
                failure.stage_id,
                failure.class,
                failure.attempts,
                failure.diagnostic,
                self.resume_command
            ));
        }
        text
    }
}
