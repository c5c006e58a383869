//! Message envelopes carried through every queue hop.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;

/// Function computing a priority level from a produced value.
pub type PriorityFn = Arc<dyn Fn(&Value) -> u32 + Send + Sync>;

/// The priority attached to a unit of work.
///
/// A computed priority is resolved once, when the work's result is produced,
/// and travels downstream as a plain integer.
#[derive(Clone)]
pub enum Priority {
    /// A concrete priority level.
    Fixed(u32),
    /// A priority derived from the produced value.
    Computed(PriorityFn),
}

impl Priority {
    /// Creates a computed priority.
    pub fn computed<F>(func: F) -> Self
    where
        F: Fn(&Value) -> u32 + Send + Sync + 'static,
    {
        Self::Computed(Arc::new(func))
    }

    /// Resolves the priority for a produced value.
    #[must_use]
    pub fn resolve(&self, value: &Value) -> u32 {
        match self {
            Self::Fixed(level) => *level,
            Self::Computed(func) => func(value),
        }
    }

    /// Returns true if the priority depends on the produced value.
    #[must_use]
    pub fn is_computed(&self) -> bool {
        matches!(self, Self::Computed(_))
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::Fixed(0)
    }
}

impl From<u32> for Priority {
    fn from(level: u32) -> Self {
        Self::Fixed(level)
    }
}

impl fmt::Debug for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed(level) => f.debug_tuple("Fixed").field(level).finish(),
            Self::Computed(_) => f.write_str("Computed(..)"),
        }
    }
}

/// In-memory metadata accompanying a dispatched unit of work.
#[derive(Debug, Clone, Default)]
pub struct TaskMeta {
    /// The priority of the work.
    pub priority: Priority,
    /// Caller-supplied entries, forwarded unchanged.
    pub extra: Map<String, Value>,
}

impl TaskMeta {
    /// Creates metadata with the given priority.
    #[must_use]
    pub fn new(priority: impl Into<Priority>) -> Self {
        Self {
            priority: priority.into(),
            extra: Map::new(),
        }
    }

    /// Adds a caller-supplied entry.
    #[must_use]
    pub fn with_entry(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    /// Resolves the priority against the produced value, yielding wire metadata.
    #[must_use]
    pub fn resolve(&self, value: &Value) -> WireMeta {
        WireMeta {
            priority: self.priority.resolve(value),
            extra: self.extra.clone(),
        }
    }
}

impl From<WireMeta> for TaskMeta {
    fn from(meta: WireMeta) -> Self {
        Self {
            priority: Priority::Fixed(meta.priority),
            extra: meta.extra,
        }
    }
}

/// Metadata as it appears on the wire, with a concrete priority.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WireMeta {
    /// The resolved priority level.
    #[serde(default)]
    pub priority: u32,
    /// Caller-supplied entries.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The `{meta, value}` wrapper sent as a queue message body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Message metadata.
    pub meta: WireMeta,
    /// The produced value.
    pub value: Value,
}

impl Envelope {
    /// Creates a new envelope.
    #[must_use]
    pub fn new(meta: WireMeta, value: Value) -> Self {
        Self { meta, value }
    }

    /// Encodes the envelope as a JSON message body.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Decodes an envelope from a JSON message body.
    pub fn decode(body: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(body)
    }
}
