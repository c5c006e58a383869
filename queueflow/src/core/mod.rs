//! Core domain model types for queueflow.
//!
//! This module contains the fundamental types used throughout the framework:
//! - Message envelopes and their metadata
//! - Priority values, fixed or computed from a produced value
//! - Task outputs and per-invocation outcomes
//! - Deterministic queue naming

mod envelope;
mod naming;
mod outcome;

pub use envelope::{Envelope, Priority, PriorityFn, TaskMeta, WireMeta};
pub use naming::{
    priority_levels, queue_name, validate_stage_name, GROUP_ID, MAX_PRIORITIES,
    MAX_QUEUE_NAME_LEN, QUEUE_SUFFIX,
};
pub use outcome::{TaskOutcome, TaskOutput};
