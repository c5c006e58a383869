//! Pipeline builder with validation.

use super::{Pipeline, StageSpec};
use crate::config::PipelineConfig;
use crate::errors::ConfigError;
use crate::events::{EventSink, LoggingEventSink};
use crate::queue::QueueService;
use crate::stages::StageRunner;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

/// Builder for creating validated pipelines.
///
/// Stages are chained in registration order: every stage after the first
/// consumes the output queues of the one before it, and the last stage is
/// always final.
pub struct PipelineBuilder {
    config: PipelineConfig,
    queues: Arc<dyn QueueService>,
    events: Arc<dyn EventSink>,
    stages: Vec<StageSpec>,
}

impl PipelineBuilder {
    /// Creates a new pipeline builder.
    #[must_use]
    pub fn new(config: PipelineConfig, queues: Arc<dyn QueueService>) -> Self {
        Self {
            config,
            queues,
            events: Arc::new(LoggingEventSink::default()),
            stages: Vec::new(),
        }
    }

    /// Sets the sink receiving every stage's lifecycle events.
    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Appends a stage.
    #[must_use]
    pub fn stage(mut self, spec: impl Into<StageSpec>) -> Self {
        self.stages.push(spec.into());
        self
    }

    /// Appends several stages.
    #[must_use]
    pub fn stages(mut self, specs: impl IntoIterator<Item = StageSpec>) -> Self {
        self.stages.extend(specs);
        self
    }

    /// Validates the configuration and wires the stages together.
    pub fn build(self) -> Result<Pipeline, ConfigError> {
        self.config.validate()?;
        if self.stages.is_empty() {
            return Err(ConfigError::no_stages());
        }

        let last = self.stages.len() - 1;
        let mut seen = HashSet::new();
        let mut runners = Vec::with_capacity(self.stages.len());
        let mut upstream_outputs: Vec<String> = Vec::new();

        for (index, spec) in self.stages.into_iter().enumerate() {
            spec.validate()?;
            if !seen.insert(spec.name().to_string()) {
                return Err(ConfigError::duplicate_stage(spec.name()));
            }

            let mut options = spec.options;
            if index == last {
                options.is_final = true;
            }

            let runner = StageRunner::new(
                self.config.domain.clone(),
                spec.task,
                Arc::clone(&self.queues),
                options,
            )?
            .with_inputs(std::mem::take(&mut upstream_outputs))
            .with_event_sink(Arc::clone(&self.events));

            debug!(
                stage = %runner.name(),
                index,
                inputs = runner.input_queue_names().len(),
                outputs = runner.output_queue_names().len(),
                "Stage registered"
            );
            upstream_outputs = runner.output_queue_names().to_vec();
            runners.push(Arc::new(runner));
        }

        Ok(Pipeline::new(self.config, self.queues, runners))
    }
}

impl std::fmt::Debug for PipelineBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineBuilder")
            .field("config", &self.config)
            .field("stages", &self.stages)
            .finish_non_exhaustive()
    }
}
