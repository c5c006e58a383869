//! Observability utilities.

mod tracing;

pub use self::tracing::{init_tracing, LogFormat, DEFAULT_LOG_FILTER};
