//! Configuration types for pipelines and stages.

use crate::core::{validate_stage_name, MAX_PRIORITIES};
use crate::errors::{ConfigError, ContractErrorInfo};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Regions where ordered-delivery queues are available.
pub const SUPPORTED_REGIONS: &[&str] = &["us-west-2", "us-east-2"];

/// Top-level pipeline configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Namespace isolating this pipeline's queues from unrelated pipelines.
    pub domain: String,
    /// Queue service region.
    #[serde(default = "default_region")]
    pub region: String,
}

fn default_region() -> String {
    "us-west-2".to_string()
}

impl PipelineConfig {
    /// Creates a configuration for a domain in the default region.
    #[must_use]
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            region: default_region(),
        }
    }

    /// Sets the region.
    #[must_use]
    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = region.into();
        self
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !SUPPORTED_REGIONS.contains(&self.region.as_str()) {
            return Err(ConfigError::unsupported_region(&self.region, SUPPORTED_REGIONS));
        }
        if self.domain.trim().is_empty() {
            return Err(ConfigError::domain_required());
        }
        validate_stage_name(&self.domain)
    }
}

/// Function computing the pause between source-stage invocations.
pub type IntervalFn = Arc<dyn Fn() -> Duration + Send + Sync>;

/// Pause between invocations of a source stage.
#[derive(Clone)]
pub enum Interval {
    /// The same pause every cycle.
    Fixed(Duration),
    /// A pause computed anew every cycle.
    Computed(IntervalFn),
}

impl Interval {
    /// Creates a computed interval.
    pub fn computed<F>(func: F) -> Self
    where
        F: Fn() -> Duration + Send + Sync + 'static,
    {
        Self::Computed(Arc::new(func))
    }

    /// Returns the pause for the next cycle.
    #[must_use]
    pub fn next(&self) -> Duration {
        match self {
            Self::Fixed(duration) => *duration,
            Self::Computed(func) => func(),
        }
    }
}

impl Default for Interval {
    fn default() -> Self {
        Self::Fixed(Duration::ZERO)
    }
}

impl fmt::Debug for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed(duration) => f.debug_tuple("Fixed").field(duration).finish(),
            Self::Computed(_) => f.write_str("Computed(..)"),
        }
    }
}

impl Serialize for Interval {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Fixed(duration) => serializer.serialize_f64(duration.as_secs_f64()),
            Self::Computed(_) => Err(serde::ser::Error::custom(
                "a computed interval cannot be serialized",
            )),
        }
    }
}

impl<'de> Deserialize<'de> for Interval {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let seconds = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(seconds)
            .map(Self::Fixed)
            .map_err(serde::de::Error::custom)
    }
}

/// Per-stage options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageOptions {
    /// Stage name; defaults to the task's name.
    #[serde(default)]
    pub name: Option<String>,
    /// Concurrency limit.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Number of extra priority levels above the base level.
    #[serde(default)]
    pub priorities: u32,
    /// Pause between source-stage invocations, in seconds.
    #[serde(default, rename = "interval_seconds")]
    pub interval: Interval,
    /// Whether `null` results are dropped like empty outputs.
    #[serde(default = "default_ignore_none")]
    pub ignore_none: bool,
    /// Whether results are kept local instead of forwarded downstream.
    #[serde(default, rename = "final")]
    pub is_final: bool,
    /// Delay between attempts to resolve missing input queues, in seconds.
    #[serde(default = "default_input_wait")]
    pub input_wait_seconds: f64,
    /// Lower bound of the idle backoff after an empty poll, in seconds.
    #[serde(default = "default_idle_backoff_min")]
    pub idle_backoff_min_seconds: f64,
    /// Upper bound of the idle backoff after an empty poll, in seconds.
    #[serde(default = "default_idle_backoff_max")]
    pub idle_backoff_max_seconds: f64,
}

fn default_workers() -> usize {
    1
}

fn default_ignore_none() -> bool {
    true
}

fn default_input_wait() -> f64 {
    2.0
}

fn default_idle_backoff_min() -> f64 {
    0.1
}

fn default_idle_backoff_max() -> f64 {
    5.0
}

impl Default for StageOptions {
    fn default() -> Self {
        Self {
            name: None,
            workers: default_workers(),
            priorities: 0,
            interval: Interval::default(),
            ignore_none: default_ignore_none(),
            is_final: false,
            input_wait_seconds: default_input_wait(),
            idle_backoff_min_seconds: default_idle_backoff_min(),
            idle_backoff_max_seconds: default_idle_backoff_max(),
        }
    }
}

impl StageOptions {
    /// Creates stage options with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the stage name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets the concurrency limit.
    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Sets the number of extra priority levels.
    #[must_use]
    pub fn with_priorities(mut self, priorities: u32) -> Self {
        self.priorities = priorities;
        self
    }

    /// Sets a fixed interval.
    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = Interval::Fixed(interval);
        self
    }

    /// Sets an interval computed every cycle.
    #[must_use]
    pub fn with_interval_fn<F>(mut self, func: F) -> Self
    where
        F: Fn() -> Duration + Send + Sync + 'static,
    {
        self.interval = Interval::computed(func);
        self
    }

    /// Sets whether `null` results are dropped.
    #[must_use]
    pub fn with_ignore_none(mut self, ignore_none: bool) -> Self {
        self.ignore_none = ignore_none;
        self
    }

    /// Marks the stage as final.
    #[must_use]
    pub fn final_stage(mut self) -> Self {
        self.is_final = true;
        self
    }

    /// Sets the delay between input resolution attempts.
    #[must_use]
    pub fn with_input_wait(mut self, wait: Duration) -> Self {
        self.input_wait_seconds = wait.as_secs_f64();
        self
    }

    /// Sets the idle backoff range.
    #[must_use]
    pub fn with_idle_backoff(mut self, min: Duration, max: Duration) -> Self {
        self.idle_backoff_min_seconds = min.as_secs_f64();
        self.idle_backoff_max_seconds = max.as_secs_f64();
        self
    }

    /// Returns the effective concurrency limit, never below 1.
    #[must_use]
    pub fn effective_workers(&self) -> usize {
        self.workers.max(1)
    }

    /// Returns the effective number of extra priority levels.
    #[must_use]
    pub fn effective_priorities(&self) -> u32 {
        self.priorities.min(MAX_PRIORITIES)
    }

    /// Gets the input resolution delay as a Duration.
    #[must_use]
    pub fn input_wait(&self) -> Duration {
        Duration::try_from_secs_f64(self.input_wait_seconds).unwrap_or_default()
    }

    /// Gets the idle backoff range as Durations.
    #[must_use]
    pub fn idle_backoff(&self) -> (Duration, Duration) {
        (
            Duration::try_from_secs_f64(self.idle_backoff_min_seconds).unwrap_or_default(),
            Duration::try_from_secs_f64(self.idle_backoff_max_seconds).unwrap_or_default(),
        )
    }

    /// Validates the options.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(name) = &self.name {
            validate_stage_name(name)?;
        }

        let durations = [
            ("input_wait_seconds", self.input_wait_seconds),
            ("idle_backoff_min_seconds", self.idle_backoff_min_seconds),
            ("idle_backoff_max_seconds", self.idle_backoff_max_seconds),
        ];
        for (field, seconds) in durations {
            if !seconds.is_finite() || seconds < 0.0 {
                return Err(ConfigError::new(format!("`{field}` must be a non-negative number"))
                    .with_error_info(
                        ContractErrorInfo::new("CONFIG-DURATION", "Invalid duration")
                            .with_context_entry("field", field),
                    ));
            }
        }

        if self.idle_backoff_min_seconds > self.idle_backoff_max_seconds {
            return Err(ConfigError::new(
                "`idle_backoff_min_seconds` must not exceed `idle_backoff_max_seconds`",
            )
            .with_error_info(ContractErrorInfo::new("CONFIG-DURATION", "Invalid backoff range")));
        }

        Ok(())
    }
}
