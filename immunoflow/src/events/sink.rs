//! Event sink trait and implementations.

use super::{Event, EventKind};
use parking_lot::RwLock;
use tracing::{debug, info, Level};

/// Receives pipeline and stage lifecycle events.
///
/// Sinks are injected into the engine; emitting must never fail or block for
/// long, since it happens on the scheduling path.
pub trait EventSink: Send + Sync {
    /// Handles one event.
    fn emit(&self, event: &Event);
}

/// A sink that discards all events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventSink;

impl EventSink for NoOpEventSink {
    fn emit(&self, _event: &Event) {}
}

/// A sink that forwards events to `tracing`.
#[derive(Debug, Clone)]
pub struct LoggingEventSink {
    level: Level,
}

impl Default for LoggingEventSink {
    fn default() -> Self {
        Self { level: Level::INFO }
    }
}

impl LoggingEventSink {
    /// Creates a logging sink at `level`. Only `DEBUG` lowers the level;
    /// anything else logs at `INFO`.
    #[must_use]
    pub const fn new(level: Level) -> Self {
        Self { level }
    }

    /// Creates a debug-level logging sink.
    #[must_use]
    pub const fn debug() -> Self {
        Self::new(Level::DEBUG)
    }
}

impl EventSink for LoggingEventSink {
    fn emit(&self, event: &Event) {
        let stage = event.stage_id.as_deref().unwrap_or("-");
        if self.level == Level::DEBUG {
            debug!(
                event = event.kind.as_str(),
                run_id = %event.run_id,
                sample = %event.sample,
                stage,
                data = %event.data,
                "Pipeline event"
            );
        } else {
            info!(
                event = event.kind.as_str(),
                run_id = %event.run_id,
                sample = %event.sample,
                stage,
                data = %event.data,
                "Pipeline event"
            );
        }
    }
}

/// A sink that keeps every event in memory, for tests and reports.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: RwLock<Vec<Event>>,
}

impl CollectingEventSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all collected events in emission order.
    #[must_use]
    pub fn events(&self) -> Vec<Event> {
        self.events.read().clone()
    }

    /// Returns the number of collected events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Returns true if nothing was collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Clears all collected events.
    pub fn clear(&self) {
        self.events.write().clear();
    }

    /// Events of one kind.
    #[must_use]
    pub fn of_kind(&self, kind: EventKind) -> Vec<Event> {
        self.events
            .read()
            .iter()
            .filter(|e| e.kind == kind)
            .cloned()
            .collect()
    }

    /// Stage ids of the events of `kind`, in emission order.
    #[must_use]
    pub fn stages(&self, kind: EventKind) -> Vec<String> {
        self.events
            .read()
            .iter()
            .filter(|e| e.kind == kind)
            .filter_map(|e| e.stage_id.clone())
            .collect()
    }
}

impl EventSink for CollectingEventSink {
    fn emit(&self, event: &Event) {
        self.events.write().push(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::SampleId;
    use serde_json::json;
    use uuid::Uuid;

    fn event(kind: EventKind, stage: Option<&str>) -> Event {
        Event::new(kind, Uuid::new_v4(), SampleId::new("S1").unwrap())
            .with_stage(stage.map(str::to_string))
            .with_data(json!({"attempt": 1}))
    }

    #[test]
    fn test_noop_and_logging_sinks_accept_events() {
        NoOpEventSink.emit(&event(EventKind::PipelineStarted, None));
        LoggingEventSink::default().emit(&event(EventKind::StageStarted, Some("qc")));
        LoggingEventSink::debug().emit(&event(EventKind::StageFailed, Some("qc")));
    }

    #[test]
    fn test_collecting_sink_filters_by_kind() {
        let sink = CollectingEventSink::new();
        assert!(sink.is_empty());

        sink.emit(&event(EventKind::StageStarted, Some("qc")));
        sink.emit(&event(EventKind::StageSucceeded, Some("qc")));
        sink.emit(&event(EventKind::StageCached, Some("convert")));
        sink.emit(&event(EventKind::PipelineFinished, None));

        assert_eq!(sink.len(), 4);
        assert_eq!(sink.stages(EventKind::StageSucceeded), vec!["qc"]);
        assert_eq!(sink.stages(EventKind::StageCached), vec!["convert"]);
        assert_eq!(sink.of_kind(EventKind::PipelineFinished).len(), 1);

        sink.clear();
        assert!(sink.is_empty());
    }
}
