//! Stage lifecycle events for observability.
//!
//! Stages report the notable points of their life (outputs ready, waiting on
//! upstream queues, failed forwards) to an [`EventSink`]. The default sink
//! logs through `tracing`.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

use serde::Serialize;
use serde_json::Value;
use std::fmt;

/// The kind of a stage event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageEventKind {
    /// Output queues were materialized.
    SetupComplete,
    /// An input queue does not exist yet; the stage keeps retrying.
    WaitingForInputs,
    /// Input queues resolved after waiting.
    InputsReady,
    /// A work function failed.
    TaskFailed,
    /// A produced value could not be sent downstream.
    ForwardFailed,
    /// A received message could not be decoded and was discarded.
    MessageDropped,
}

impl StageEventKind {
    /// Returns the dotted event type name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SetupComplete => "stage.setup_complete",
            Self::WaitingForInputs => "stage.waiting_for_inputs",
            Self::InputsReady => "stage.inputs_ready",
            Self::TaskFailed => "stage.task_failed",
            Self::ForwardFailed => "stage.forward_failed",
            Self::MessageDropped => "stage.message_dropped",
        }
    }

    /// Returns true for events describing a fault.
    #[must_use]
    pub fn is_failure(self) -> bool {
        matches!(
            self,
            Self::TaskFailed | Self::ForwardFailed | Self::MessageDropped
        )
    }
}

impl fmt::Display for StageEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event emitted by a stage.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageEvent {
    /// What happened.
    pub kind: StageEventKind,
    /// The stage it happened in.
    pub stage: String,
    /// Event details.
    pub data: Value,
}

impl StageEvent {
    /// Creates a new event.
    #[must_use]
    pub fn new(kind: StageEventKind, stage: impl Into<String>, data: Value) -> Self {
        Self {
            kind,
            stage: stage.into(),
            data,
        }
    }
}
