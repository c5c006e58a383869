//! Bounded-concurrency execution of work functions.
//!
//! A [`WorkerPool`] runs units of work on the tokio runtime, never more than
//! its limit at once, and reports each outcome exactly once through a
//! completion callback. A [`ResultBuffer`] is the usual callback target: it
//! funnels completions from every worker into one batch the stage loop
//! drains.

mod buffer;
mod worker_pool;

pub use buffer::{Completion, ResultBuffer};
pub use worker_pool::{CompletionCallback, WorkerPool};
