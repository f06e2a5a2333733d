//! Span attributes and timing for pipeline and stage execution.

use crate::core::{ArtifactType, SampleId};
use serde::Serialize;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Attributes attached to a pipeline run span.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineSpanAttributes {
    /// Pipeline run id.
    pub run_id: Uuid,
    /// Sample scope.
    pub sample: SampleId,
    /// Requested artifact type.
    pub target: ArtifactType,
    /// Number of planned stages.
    pub planned_stages: usize,
}

impl PipelineSpanAttributes {
    /// Creates attributes for a run.
    #[must_use]
    pub const fn new(run_id: Uuid, sample: SampleId, target: ArtifactType, planned_stages: usize) -> Self {
        Self {
            run_id,
            sample,
            target,
            planned_stages,
        }
    }

    /// Opens the `pipeline` span.
    #[must_use]
    pub fn span(&self) -> tracing::Span {
        tracing::info_span!(
            "pipeline",
            run_id = %self.run_id,
            sample = %self.sample,
            target = %self.target,
            planned_stages = self.planned_stages,
        )
    }
}

/// Attributes describing one stage outcome.
///
/// Serialized as the `data` of stage events.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StageSpanAttributes {
    /// Stage id.
    pub stage_id: String,
    /// Attempt number, when a collaborator was invoked.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    /// Outcome label.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// Wall-clock duration of the attempt.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<f64>,
    /// Produced or reused artifact id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact: Option<String>,
    /// Failure summary.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Delay before the next attempt.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_in_ms: Option<u64>,
}

impl StageSpanAttributes {
    /// Creates attributes for `stage_id`.
    #[must_use]
    pub fn new(stage_id: impl Into<String>) -> Self {
        Self {
            stage_id: stage_id.into(),
            ..Self::default()
        }
    }

    /// Sets the attempt number.
    #[must_use]
    pub const fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }

    /// Sets the outcome label.
    #[must_use]
    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    /// Sets the duration.
    #[must_use]
    pub const fn with_duration_ms(mut self, duration_ms: f64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    /// Sets the artifact id.
    #[must_use]
    pub fn with_artifact(mut self, artifact: impl Into<String>) -> Self {
        self.artifact = Some(artifact.into());
        self
    }

    /// Sets the failure summary.
    #[must_use]
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Sets the retry delay.
    #[must_use]
    pub fn with_retry_in(mut self, delay: Duration) -> Self {
        self.retry_in_ms = Some(u64::try_from(delay.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// JSON form used as event data.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Measures one span.
#[derive(Debug)]
pub struct SpanTimer {
    start: Instant,
    name: String,
}

impl SpanTimer {
    /// Starts timing.
    #[must_use]
    pub fn start(name: impl Into<String>) -> Self {
        Self {
            start: Instant::now(),
            name: name.into(),
        }
    }

    /// Elapsed time in milliseconds.
    #[must_use]
    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }

    /// Stops timing and returns the duration in milliseconds.
    #[must_use]
    pub fn finish(self) -> f64 {
        let elapsed = self.elapsed_ms();
        tracing::trace!(span = %self.name, elapsed_ms = elapsed, "Span finished");
        elapsed
    }
}
