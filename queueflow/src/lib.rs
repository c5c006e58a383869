//! # Queueflow
//!
//! Priority-aware, queue-backed task pipelines.
//!
//! A pipeline is a chain of stages. Each stage pulls work from its upstream
//! queues (or generates it on an interval), runs it with bounded
//! concurrency, and forwards every result to one of several priority-tiered
//! queues for the next stage. Stages never call each other, so every stage
//! can run in its own process:
//!
//! - **Worker pools**: semaphore-bounded execution with panic capture
//! - **Priority lanes**: one output queue per priority level, chosen per
//!   value, optionally by a function of the value itself
//! - **Lazy results**: each stage is a `futures::Stream` of its outputs;
//!   task failures surface through the stream after their batch is yielded
//! - **Pluggable queues**: any durable ordered queue behind [`queue::QueueService`]
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use queueflow::prelude::*;
//!
//! let pipeline = PipelineBuilder::new(PipelineConfig::new("word-counter"), queues)
//!     .stage(StageSpec::new(generate, StageOptions::new().with_workers(32)))
//!     .stage(reduce)
//!     .stage(count)
//!     .build()?;
//!
//! // In the process running the first stage:
//! pipeline.run("generate", vec![json!(10)], RunOptions::new()).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod config;
pub mod core;
pub mod errors;
pub mod events;
pub mod observability;
pub mod pipeline;
pub mod pool;
pub mod queue;
pub mod stages;
pub mod testing;
pub mod utils;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::{Interval, PipelineConfig, StageOptions};
    pub use crate::core::{Envelope, Priority, TaskMeta, TaskOutcome, TaskOutput};
    pub use crate::errors::{ConfigError, QueueError, QueueflowError, TaskError};
    pub use crate::events::{EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::observability::{init_tracing, LogFormat};
    pub use crate::pipeline::{Pipeline, PipelineBuilder, StageRef, StageSpec};
    pub use crate::queue::{InMemoryQueueService, QueueService};
    pub use crate::stages::{arg, arg_or, AsyncFnTask, FnTask, RunOptions, StageRunner, Task};
}
