//! Task outputs and per-invocation outcomes.

use crate::errors::TaskError;
use serde_json::Value;

/// What a work function hands back on success.
///
/// `Empty` means "processed, nothing to forward" and is distinct from a
/// JSON `null` value.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutput {
    /// A produced value.
    Value(Value),
    /// Nothing to forward.
    Empty,
}

impl TaskOutput {
    /// Creates a value output.
    #[must_use]
    pub fn value(value: impl Into<Value>) -> Self {
        Self::Value(value.into())
    }
}

impl From<Value> for TaskOutput {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

impl From<Option<Value>> for TaskOutput {
    fn from(value: Option<Value>) -> Self {
        value.map_or(Self::Empty, Self::Value)
    }
}

/// The outcome of one dispatched unit of work.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    /// The work produced a value.
    Value(Value),
    /// The work produced nothing to forward.
    Empty,
    /// The work failed.
    Failure(TaskError),
}

impl TaskOutcome {
    /// Returns true if the outcome is a failure.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failure(_))
    }

    /// Returns the produced value, if any.
    #[must_use]
    pub fn value(&self) -> Option<&Value> {
        match self {
            Self::Value(value) => Some(value),
            _ => None,
        }
    }
}

impl From<Result<TaskOutput, TaskError>> for TaskOutcome {
    fn from(result: Result<TaskOutput, TaskError>) -> Self {
        match result {
            Ok(TaskOutput::Value(value)) => Self::Value(value),
            Ok(TaskOutput::Empty) => Self::Empty,
            Err(err) => Self::Failure(err),
        }
    }
}
