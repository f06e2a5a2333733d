//! Lifecycle events for observability.
//!
//! The engine emits one [`Event`] per pipeline and stage transition to an
//! injected [`EventSink`]. There is no process-wide sink.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

use crate::core::SampleId;
use crate::utils::iso_timestamp;
use serde::Serialize;
use std::fmt;
use uuid::Uuid;

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EventKind {
    /// Preflight passed and scheduling began.
    #[serde(rename = "pipeline.started")]
    PipelineStarted,
    /// The run reached a terminal status.
    #[serde(rename = "pipeline.finished")]
    PipelineFinished,
    /// A collaborator attempt started.
    #[serde(rename = "stage.started")]
    StageStarted,
    /// A checkpoint satisfied the stage.
    #[serde(rename = "stage.cached")]
    StageCached,
    /// A transient failure will be retried.
    #[serde(rename = "stage.retrying")]
    StageRetrying,
    /// The stage produced an artifact.
    #[serde(rename = "stage.succeeded")]
    StageSucceeded,
    /// The stage failed for good.
    #[serde(rename = "stage.failed")]
    StageFailed,
    /// The stage was interrupted by cancellation.
    #[serde(rename = "stage.cancelled")]
    StageCancelled,
}

impl EventKind {
    /// Dotted event name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::PipelineStarted => "pipeline.started",
            Self::PipelineFinished => "pipeline.finished",
            Self::StageStarted => "stage.started",
            Self::StageCached => "stage.cached",
            Self::StageRetrying => "stage.retrying",
            Self::StageSucceeded => "stage.succeeded",
            Self::StageFailed => "stage.failed",
            Self::StageCancelled => "stage.cancelled",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One lifecycle event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    /// Event kind.
    pub kind: EventKind,
    /// Pipeline run id.
    pub run_id: Uuid,
    /// Sample scope.
    pub sample: SampleId,
    /// Stage id, for stage events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage_id: Option<String>,
    /// ISO 8601 emission time.
    pub timestamp: String,
    /// Kind-specific details.
    pub data: serde_json::Value,
}

impl Event {
    /// Creates an event stamped with the current time.
    #[must_use]
    pub fn new(kind: EventKind, run_id: Uuid, sample: SampleId) -> Self {
        Self {
            kind,
            run_id,
            sample,
            stage_id: None,
            timestamp: iso_timestamp(),
            data: serde_json::Value::Null,
        }
    }

    /// Sets the stage id.
    #[must_use]
    pub fn with_stage(mut self, stage_id: Option<String>) -> Self {
        self.stage_id = stage_id;
        self
    }

    /// Sets the details payload.
    #[must_use]
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serializes_dotted_kind() {
        let event = Event::new(EventKind::StageRetrying, Uuid::nil(), SampleId::new("S1").unwrap())
            .with_stage(Some("search".into()));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "stage.retrying");
        assert_eq!(json["stage_id"], "search");
        assert_eq!(json["sample"], "S1");
    }

    #[test]
    fn test_kind_display_matches_serde_name() {
        for kind in [EventKind::PipelineStarted, EventKind::StageCached, EventKind::StageCancelled] {
            let json = serde_json::to_value(kind).unwrap();
            assert_eq!(json, kind.to_string());
        }
    }
}
