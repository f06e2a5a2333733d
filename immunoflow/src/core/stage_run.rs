//! A single stage execution record.

use super::{ArtifactId, SampleId, StageRunStatus};
use crate::errors::{Diagnostic, FailureClass, InvalidTransitionError};
use crate::utils::{now_utc, Timestamp};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One execution of a stage against a specific tuple of input artifacts.
///
/// Retries of the same invocation share one `StageRun`; `attempts` counts
/// them. Every transition goes through [`StageRun::transition`] so the state
/// machine cannot be bypassed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageRun {
    /// Pipeline run that owns this stage run.
    pub run_id: Uuid,
    /// The stage definition id.
    pub stage_id: String,
    /// Sample scope.
    pub sample: SampleId,
    /// Input artifact ids in declaration order.
    pub input_ids: Vec<ArtifactId>,
    /// Hash of the resolved stage configuration.
    pub config_hash: String,
    /// Checkpoint key derived from stage id, sorted inputs and config hash.
    pub cache_key: String,
    /// Current status.
    pub status: StageRunStatus,
    /// Output artifact, once succeeded or reused.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<ArtifactId>,
    /// Diagnostic of the last failed attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Diagnostic>,
    /// Classification of the last failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_class: Option<FailureClass>,
    /// Number of invocation attempts.
    pub attempts: u32,
    /// When the first attempt started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<Timestamp>,
    /// When the run settled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<Timestamp>,
}

impl StageRun {
    /// Creates a pending stage run.
    #[must_use]
    pub fn new(
        run_id: Uuid,
        stage_id: impl Into<String>,
        sample: SampleId,
        input_ids: Vec<ArtifactId>,
        config_hash: impl Into<String>,
        cache_key: impl Into<String>,
    ) -> Self {
        Self {
            run_id,
            stage_id: stage_id.into(),
            sample,
            input_ids,
            config_hash: config_hash.into(),
            cache_key: cache_key.into(),
            status: StageRunStatus::Pending,
            output: None,
            error: None,
            failure_class: None,
            attempts: 0,
            started_at: None,
            finished_at: None,
        }
    }

    /// Moves to `next` if the transition is legal.
    ///
    /// # Errors
    ///
    /// Returns an error for transitions outside the stage run state machine.
    pub fn transition(&mut self, next: StageRunStatus) -> Result<(), InvalidTransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(InvalidTransitionError {
                stage_id: self.stage_id.clone(),
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    /// Starts (or restarts) an invocation attempt.
    ///
    /// # Errors
    ///
    /// Returns an error unless the run is pending or failed.
    pub fn begin_attempt(&mut self) -> Result<(), InvalidTransitionError> {
        self.transition(StageRunStatus::Running)?;
        self.attempts += 1;
        self.started_at.get_or_insert_with(now_utc);
        self.finished_at = None;
        Ok(())
    }

    /// Records a successful invocation.
    ///
    /// # Errors
    ///
    /// Returns an error unless the run is running.
    pub fn succeed(&mut self, output: ArtifactId) -> Result<(), InvalidTransitionError> {
        self.transition(StageRunStatus::Succeeded)?;
        self.output = Some(output);
        self.error = None;
        self.failure_class = None;
        self.finished_at = Some(now_utc());
        Ok(())
    }

    /// Records a failed invocation attempt.
    ///
    /// # Errors
    ///
    /// Returns an error unless the run is running.
    pub fn fail(
        &mut self,
        class: FailureClass,
        diagnostic: Diagnostic,
    ) -> Result<(), InvalidTransitionError> {
        self.transition(StageRunStatus::Failed)?;
        self.failure_class = Some(class);
        self.error = Some(diagnostic);
        self.finished_at = Some(now_utc());
        Ok(())
    }

    /// Marks the run as satisfied by an earlier checkpoint.
    ///
    /// # Errors
    ///
    /// Returns an error unless the run is pending.
    pub fn skip_cached(&mut self, output: ArtifactId) -> Result<(), InvalidTransitionError> {
        self.transition(StageRunStatus::SkippedCached)?;
        let now = now_utc();
        self.output = Some(output);
        self.started_at = Some(now);
        self.finished_at = Some(now);
        Ok(())
    }

    /// Returns true if the collaborator was actually invoked.
    #[must_use]
    pub const fn was_invoked(&self) -> bool {
        self.attempts > 0
    }
}
