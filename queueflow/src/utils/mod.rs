//! Small helpers for identifiers and randomized delays.

use rand::Rng;
use std::time::Duration;
use uuid::Uuid;

/// Generates a new UUID v4.
#[must_use]
pub fn generate_uuid() -> Uuid {
    Uuid::new_v4()
}

/// Generates a fresh per-message deduplication token.
#[must_use]
pub fn generate_dedup_id() -> String {
    generate_uuid().to_string()
}

/// Picks a random delay in `[min, max)`.
///
/// Returns `min` when the range is empty.
#[must_use]
pub fn random_delay(min: Duration, max: Duration) -> Duration {
    if max <= min {
        return min;
    }
    let secs = rand::thread_rng().gen_range(min.as_secs_f64()..max.as_secs_f64());
    Duration::from_secs_f64(secs)
}
