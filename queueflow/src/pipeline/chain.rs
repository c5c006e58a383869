//! A built chain of stages.

use crate::config::PipelineConfig;
use crate::errors::{ConfigError, QueueflowError};
use crate::queue::{QueueHandle, QueueService};
use crate::stages::{RunOptions, StageRunner};
use futures::stream::{BoxStream, StreamExt};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::info;

/// Identifies a stage by name or by position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageRef {
    /// The stage's name.
    Name(String),
    /// The stage's position in the pipeline.
    Index(usize),
}

impl From<&str> for StageRef {
    fn from(name: &str) -> Self {
        Self::Name(name.to_string())
    }
}

impl From<String> for StageRef {
    fn from(name: String) -> Self {
        Self::Name(name)
    }
}

impl From<usize> for StageRef {
    fn from(index: usize) -> Self {
        Self::Index(index)
    }
}

impl fmt::Display for StageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Name(name) => write!(f, "'{name}'"),
            Self::Index(index) => write!(f, "#{index}"),
        }
    }
}

/// An ordered chain of stages sharing one domain and queue service.
///
/// Each process typically runs one stage of the pipeline; the stages only
/// meet through their queues.
pub struct Pipeline {
    config: PipelineConfig,
    queues: Arc<dyn QueueService>,
    stages: Vec<Arc<StageRunner>>,
}

impl Pipeline {
    pub(crate) fn new(
        config: PipelineConfig,
        queues: Arc<dyn QueueService>,
        stages: Vec<Arc<StageRunner>>,
    ) -> Self {
        Self {
            config,
            queues,
            stages,
        }
    }

    /// Returns the pipeline domain.
    #[must_use]
    pub fn domain(&self) -> &str {
        &self.config.domain
    }

    /// Returns the pipeline configuration.
    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Returns the stages in order.
    #[must_use]
    pub fn stages(&self) -> &[Arc<StageRunner>] {
        &self.stages
    }

    /// Looks up a stage by name or index.
    pub fn stage(&self, target: impl Into<StageRef>) -> Result<Arc<StageRunner>, ConfigError> {
        let target = target.into();
        let found = match &target {
            StageRef::Name(name) => self.stages.iter().find(|s| s.name() == name),
            StageRef::Index(index) => self.stages.get(*index),
        };
        found.cloned().ok_or_else(|| ConfigError::unknown_stage(&target))
    }

    /// Sets up a stage and returns the stream of its results.
    pub async fn iterate(
        &self,
        target: impl Into<StageRef>,
        args: Vec<Value>,
        options: RunOptions,
    ) -> Result<BoxStream<'static, Result<Value, QueueflowError>>, QueueflowError> {
        let stage = self.stage(target)?;
        stage.setup().await?;
        Ok(stage.run(args, options))
    }

    /// Sets up a stage and runs it, discarding its results.
    ///
    /// Only returns when the stage fails.
    pub async fn run(
        &self,
        target: impl Into<StageRef>,
        args: Vec<Value>,
        options: RunOptions,
    ) -> Result<(), QueueflowError> {
        let mut results = self.iterate(target, args, options).await?;
        while let Some(result) = results.next().await {
            result?;
        }
        Ok(())
    }

    /// Lists every queue belonging to this pipeline's domain.
    pub async fn queues(&self) -> Result<Vec<QueueHandle>, QueueflowError> {
        Ok(self.queues.list_queues(&self.queue_prefix()).await?)
    }

    /// Deletes every queue of this pipeline's domain, returning how many.
    pub async fn delete_queues(&self) -> Result<usize, QueueflowError> {
        let queues = self.queues().await?;
        for queue in &queues {
            self.queues.delete_queue(queue).await?;
        }
        info!(domain = %self.domain(), count = queues.len(), "Deleted pipeline queues");
        Ok(queues.len())
    }

    /// Removes every message from this pipeline's queues, returning how many
    /// queues were purged.
    pub async fn purge_queues(&self) -> Result<usize, QueueflowError> {
        let queues = self.queues().await?;
        for queue in &queues {
            self.queues.purge_queue(queue).await?;
        }
        info!(domain = %self.domain(), count = queues.len(), "Purged pipeline queues");
        Ok(queues.len())
    }

    fn queue_prefix(&self) -> String {
        format!("{}-", self.config.domain)
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("config", &self.config)
            .field("stages", &self.stages)
            .finish_non_exhaustive()
    }
}
