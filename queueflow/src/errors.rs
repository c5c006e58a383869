//! Error types for the queueflow framework.
//!
//! Configuration problems are reported synchronously, queue service faults
//! are split into the expected "queue does not exist" case and everything
//! else, and work-function failures are captured as values so they can be
//! surfaced to the consumer of a stage without crashing its worker pool.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// The main error type for queueflow operations.
#[derive(Debug, Error)]
pub enum QueueflowError {
    /// The pipeline or a stage was configured incorrectly.
    #[error("{0}")]
    Config(#[from] ConfigError),

    /// The queue service reported a fault.
    #[error("{0}")]
    Queue(#[from] QueueError),

    /// A work function failed.
    #[error("{0}")]
    Task(#[from] TaskError),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A worker pool was shut down while work was waiting for a slot.
    #[error("Worker pool '{0}' is closed")]
    PoolClosed(String),
}

impl QueueflowError {
    /// Returns the captured task failure, if this error is one.
    #[must_use]
    pub fn as_task_error(&self) -> Option<&TaskError> {
        match self {
            Self::Task(err) => Some(err),
            _ => None,
        }
    }
}

/// Metadata about a configuration error for better diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ContractErrorInfo {
    /// Error code (e.g., "CONFIG-UNSUPPORTED-REGION").
    pub code: String,
    /// Short summary of the error.
    pub summary: String,
    /// Hint for fixing the error.
    pub fix_hint: Option<String>,
    /// Additional context key-value pairs.
    #[serde(default)]
    pub context: HashMap<String, String>,
}

impl ContractErrorInfo {
    /// Creates a new contract error info.
    #[must_use]
    pub fn new(code: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            summary: summary.into(),
            fix_hint: None,
            context: HashMap::new(),
        }
    }

    /// Sets the fix hint.
    #[must_use]
    pub fn with_fix_hint(mut self, hint: impl Into<String>) -> Self {
        self.fix_hint = Some(hint.into());
        self
    }

    /// Adds a single context entry.
    #[must_use]
    pub fn with_context_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// Error raised when a pipeline or stage is misconfigured.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ConfigError {
    /// The error message.
    pub message: String,
    /// Optional diagnostic info.
    pub error_info: Option<ContractErrorInfo>,
}

impl ConfigError {
    /// Creates a new configuration error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_info: None,
        }
    }

    /// Sets the diagnostic info.
    #[must_use]
    pub fn with_error_info(mut self, info: ContractErrorInfo) -> Self {
        self.error_info = Some(info);
        self
    }

    /// Returns the diagnostic code, if any.
    #[must_use]
    pub fn code(&self) -> Option<&str> {
        self.error_info.as_ref().map(|info| info.code.as_str())
    }

    pub(crate) fn domain_required() -> Self {
        Self::new("`domain` field is required").with_error_info(
            ContractErrorInfo::new("CONFIG-DOMAIN-REQUIRED", "Pipeline domain is empty")
                .with_fix_hint("Pick a unique identifier for the application, e.g. `word-counter`."),
        )
    }

    pub(crate) fn unsupported_region(region: &str, supported: &[&str]) -> Self {
        Self::new(format!(
            "`region` must be one of {} - ordered queues are not supported on other regions",
            supported.join(",")
        ))
        .with_error_info(
            ContractErrorInfo::new(
                "CONFIG-UNSUPPORTED-REGION",
                format!("Region '{region}' does not support ordered queues"),
            )
            .with_context_entry("region", region),
        )
    }

    pub(crate) fn no_stages() -> Self {
        Self::new("`tasks` field is required").with_error_info(
            ContractErrorInfo::new("CONFIG-NO-STAGES", "Cannot build a pipeline without stages")
                .with_fix_hint("Register at least one stage before building."),
        )
    }

    pub(crate) fn invalid_name(name: &str) -> Self {
        Self::new(format!("Invalid stage name '{name}'")).with_error_info(
            ContractErrorInfo::new(
                "CONFIG-STAGE-NAME",
                "Stage names must be non-empty and use only letters, digits, '-' and '_'",
            )
            .with_context_entry("stage", name),
        )
    }

    pub(crate) fn queue_name_too_long(name: &str) -> Self {
        Self::new(format!("Queue name '{name}' exceeds 80 characters")).with_error_info(
            ContractErrorInfo::new("CONFIG-QUEUE-NAME", "Derived queue name is too long")
                .with_fix_hint("Shorten the domain or the stage name."),
        )
    }

    pub(crate) fn duplicate_stage(name: &str) -> Self {
        Self::new(format!("Stage '{name}' is registered more than once")).with_error_info(
            ContractErrorInfo::new("CONFIG-DUPLICATE-STAGE", "Stage names must be unique")
                .with_context_entry("stage", name),
        )
    }

    pub(crate) fn empty_priority_window(min: Option<u32>, max: Option<u32>) -> Self {
        let bound = |b: Option<u32>| b.map_or_else(|| "-".to_string(), |b| b.to_string());
        Self::new(format!(
            "Priority window [{}, {}] excludes every input queue",
            bound(min),
            bound(max)
        ))
        .with_error_info(
            ContractErrorInfo::new("CONFIG-PRIORITY-WINDOW", "No input queue in priority window")
                .with_fix_hint("Widen `min_priority`/`max_priority` to cover at least one level."),
        )
    }

    pub(crate) fn unknown_stage(target: impl std::fmt::Display) -> Self {
        Self::new(format!("Stage {target} not found")).with_error_info(ContractErrorInfo::new(
            "CONFIG-UNKNOWN-STAGE",
            "Stage lookup failed",
        ))
    }
}

/// Errors reported by a queue service.
#[derive(Debug, Clone, Error)]
pub enum QueueError {
    /// The queue does not exist (yet).
    #[error("Queue not found: {queue}")]
    NotFound {
        /// The queue name.
        queue: String,
    },

    /// Any other fault from the queue service.
    #[error("Queue service error on '{queue}': {message}")]
    Service {
        /// The queue name.
        queue: String,
        /// The fault description.
        message: String,
    },
}

impl QueueError {
    /// Creates a not-found error.
    #[must_use]
    pub fn not_found(queue: impl Into<String>) -> Self {
        Self::NotFound {
            queue: queue.into(),
        }
    }

    /// Creates a service error.
    #[must_use]
    pub fn service(queue: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Service {
            queue: queue.into(),
            message: message.into(),
        }
    }

    /// Returns true if the queue does not exist.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// A failure captured from a single work-function invocation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Task '{task}' failed: {message}")]
pub struct TaskError {
    /// The name of the task that failed.
    pub task: String,
    /// The failure description.
    pub message: String,
    /// Whether the work function panicked instead of returning an error.
    pub panicked: bool,
}

impl TaskError {
    /// Creates a task error.
    #[must_use]
    pub fn new(task: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            message: message.into(),
            panicked: false,
        }
    }

    /// Creates a task error from any error value, keeping its cause chain.
    #[must_use]
    pub fn from_error(task: impl Into<String>, err: &anyhow::Error) -> Self {
        Self::new(task, format!("{err:#}"))
    }

    /// Creates a task error for a panicked work function.
    #[must_use]
    pub fn panicked(task: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            message: message.into(),
            panicked: true,
        }
    }
}

/// Result alias used across the crate.
pub type Result<T, E = QueueflowError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contract_error_info_creation() {
        let info = ContractErrorInfo::new("TEST-001", "Test error")
            .with_fix_hint("Fix this by doing that")
            .with_context_entry("stage", "my_stage");

        assert_eq!(info.code, "TEST-001");
        assert_eq!(info.fix_hint, Some("Fix this by doing that".to_string()));
        assert_eq!(info.context.get("stage"), Some(&"my_stage".to_string()));
    }

    #[test]
    fn test_unsupported_region_message() {
        let err = ConfigError::unsupported_region("eu-west-1", &["us-west-2", "us-east-2"]);

        assert!(err.to_string().contains("us-west-2,us-east-2"));
        assert_eq!(err.code(), Some("CONFIG-UNSUPPORTED-REGION"));
    }

    #[test]
    fn test_queue_error_not_found() {
        assert!(QueueError::not_found("q").is_not_found());
        assert!(!QueueError::service("q", "throttled").is_not_found());
    }

    #[test]
    fn test_task_error_keeps_cause_chain() {
        let err = anyhow::anyhow!("disk full").context("writing batch");
        let task_err = TaskError::from_error("store", &err);

        assert_eq!(task_err.message, "writing batch: disk full");
        assert!(!task_err.panicked);
        assert_eq!(task_err.to_string(), "Task 'store' failed: writing batch: disk full");
    }

    #[test]
    fn test_queueflow_error_as_task_error() {
        let err: QueueflowError = TaskError::new("t", "boom").into();
        assert_eq!(err.as_task_error().map(|e| e.task.as_str()), Some("t"));

        let err: QueueflowError = ConfigError::no_stages().into();
        assert!(err.as_task_error().is_none());
    }
}
