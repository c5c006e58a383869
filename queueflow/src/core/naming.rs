//! Deterministic queue naming.

use crate::errors::ConfigError;
use regex::Regex;
use std::sync::OnceLock;

/// Suffix required for ordered-delivery queues.
pub const QUEUE_SUFFIX: &str = ".fifo";

/// Maximum number of extra priority levels above the base level.
pub const MAX_PRIORITIES: u32 = 16;

/// Maximum length of a queue name, suffix included.
pub const MAX_QUEUE_NAME_LEN: usize = 80;

/// The single grouping key used for every message, forcing total order.
pub const GROUP_ID: &str = "-";

fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("stage name pattern is valid"))
}

/// Derives the queue name for a stage at a priority level.
///
/// Level 0 is `{domain}-{stage}.fifo`, level `k` is `{domain}-{stage}--p{k}.fifo`.
#[must_use]
pub fn queue_name(domain: &str, stage: &str, priority: u32) -> String {
    if priority == 0 {
        format!("{domain}-{stage}{QUEUE_SUFFIX}")
    } else {
        format!("{domain}-{stage}--p{priority}{QUEUE_SUFFIX}")
    }
}

/// Returns the priority levels for a stage, highest first.
///
/// The number of extra levels is capped at [`MAX_PRIORITIES`].
#[must_use]
pub fn priority_levels(priorities: u32) -> Vec<u32> {
    (0..=priorities.min(MAX_PRIORITIES)).rev().collect()
}

/// Checks that a domain or stage name can be embedded in a queue name.
pub fn validate_stage_name(name: &str) -> Result<(), ConfigError> {
    if name_pattern().is_match(name) {
        Ok(())
    } else {
        Err(ConfigError::invalid_name(name))
    }
}
