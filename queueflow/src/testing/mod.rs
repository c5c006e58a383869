//! Testing utilities for queueflow pipelines.
//!
//! This module provides:
//! - Mock tasks that record, fail, stall or emit a fixed sequence
//! - Fixtures for seeding and inspecting in-memory queues
//! - A helper for pulling a bounded number of results from a stage stream

mod fixtures;
mod mocks;

pub use fixtures::{queued_envelopes, queued_values, seed_queue, seed_raw, take_results};
pub use mocks::{FailingTask, RecordingTask, SequenceTask, SlowTask};
