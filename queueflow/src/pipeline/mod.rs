//! Pipeline building and execution.
//!
//! This module provides:
//! - Stage specifications (a task plus its options)
//! - A builder that validates the configuration and chains stages through
//!   their queues
//! - The built pipeline, with per-stage run/iterate entry points and queue
//!   maintenance helpers

mod builder;
mod chain;
mod spec;

pub use builder::PipelineBuilder;
pub use chain::{Pipeline, StageRef};
pub use spec::StageSpec;
