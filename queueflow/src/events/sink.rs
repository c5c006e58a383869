//! Event sink trait and implementations.

use super::StageEvent;
use tracing::{debug, info, warn, Level};

/// Trait for sinks receiving stage lifecycle events.
///
/// Emitting must never fail or block for long; sinks swallow their own
/// errors.
pub trait EventSink: Send + Sync {
    /// Emits an event.
    fn emit(&self, event: &StageEvent);
}

/// A no-op event sink that discards all events.
///
/// Used as the default when no sink is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventSink;

impl EventSink for NoOpEventSink {
    fn emit(&self, _event: &StageEvent) {}
}

/// An event sink that logs events using the tracing framework.
///
/// Failure-type events are always logged at `WARN`.
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
    /// Creates a new logging event sink with the specified level.
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self { level }
    }

    /// Creates a debug-level logging sink.
    #[must_use]
    pub fn debug() -> Self {
        Self::new(Level::DEBUG)
    }
}

impl EventSink for LoggingEventSink {
    fn emit(&self, event: &StageEvent) {
        if event.kind.is_failure() {
            warn!(
                event_type = %event.kind,
                stage = %event.stage,
                event_data = %event.data,
                "Event: {}", event.kind
            );
        } else if self.level == Level::DEBUG {
            debug!(
                event_type = %event.kind,
                stage = %event.stage,
                event_data = %event.data,
                "Event: {}", event.kind
            );
        } else {
            info!(
                event_type = %event.kind,
                stage = %event.stage,
                event_data = %event.data,
                "Event: {}", event.kind
            );
        }
    }
}

/// A collecting event sink for testing purposes.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: parking_lot::RwLock<Vec<StageEvent>>,
}

impl CollectingEventSink {
    /// Creates a new collecting sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all collected events.
    #[must_use]
    pub fn events(&self) -> Vec<StageEvent> {
        self.events.read().clone()
    }

    /// Returns the number of collected events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Returns true if no events have been collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Returns the number of events of the given type name.
    #[must_use]
    pub fn count_of(&self, event_type: &str) -> usize {
        self.events
            .read()
            .iter()
            .filter(|e| e.kind.as_str() == event_type)
            .count()
    }
}

impl EventSink for CollectingEventSink {
    fn emit(&self, event: &StageEvent) {
        self.events.write().push(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::StageEventKind;
    use serde_json::json;

    #[test]
    fn test_noop_and_logging_sinks_accept_events() {
        let event = StageEvent::new(StageEventKind::SetupComplete, "gen", json!({"queues": 1}));
        NoOpEventSink.emit(&event);
        LoggingEventSink::default().emit(&event);
        LoggingEventSink::debug().emit(&event);
    }

    #[test]
    fn test_collecting_sink() {
        let sink = CollectingEventSink::new();
        assert!(sink.is_empty());

        sink.emit(&StageEvent::new(StageEventKind::WaitingForInputs, "count", json!(null)));
        sink.emit(&StageEvent::new(StageEventKind::InputsReady, "count", json!(null)));
        sink.emit(&StageEvent::new(StageEventKind::WaitingForInputs, "count", json!(null)));

        assert_eq!(sink.len(), 3);
        assert_eq!(sink.count_of("stage.waiting_for_inputs"), 2);
        assert_eq!(sink.events()[1].kind, StageEventKind::InputsReady);
    }
}
