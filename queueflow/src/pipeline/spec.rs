//! Stage specifications.

use crate::config::StageOptions;
use crate::errors::ConfigError;
use crate::stages::Task;
use std::sync::Arc;

/// Specification for a single stage in a pipeline.
#[derive(Debug, Clone)]
pub struct StageSpec {
    /// The work function.
    pub task: Arc<dyn Task>,
    /// The stage options.
    pub options: StageOptions,
}

impl StageSpec {
    /// Creates a new stage specification.
    #[must_use]
    pub fn new(task: Arc<dyn Task>, options: StageOptions) -> Self {
        Self { task, options }
    }

    /// Returns the stage name: the configured one, or the task's name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.options.name.as_deref().unwrap_or_else(|| self.task.name())
    }

    /// Validates the stage specification.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.options.validate()
    }
}

impl From<Arc<dyn Task>> for StageSpec {
    fn from(task: Arc<dyn Task>) -> Self {
        Self::new(task, StageOptions::default())
    }
}

impl From<(Arc<dyn Task>, StageOptions)> for StageSpec {
    fn from((task, options): (Arc<dyn Task>, StageOptions)) -> Self {
        Self::new(task, options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingTask;

    #[test]
    fn test_name_defaults_to_task_name() {
        let task: Arc<dyn Task> = Arc::new(RecordingTask::new("reduce"));

        let spec = StageSpec::from(Arc::clone(&task));
        assert_eq!(spec.name(), "reduce");
        assert_eq!(spec.options.workers, 1);

        let spec = StageSpec::from((task, StageOptions::new().with_name("shrink")));
        assert_eq!(spec.name(), "shrink");
    }

    #[test]
    fn test_validate_rejects_bad_name() {
        let task: Arc<dyn Task> = Arc::new(RecordingTask::new("reduce"));
        let spec = StageSpec::new(task, StageOptions::new().with_name("has space"));

        assert!(spec.validate().is_err());
    }
}
