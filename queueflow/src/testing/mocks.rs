//! Mock tasks for testing.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::core::TaskOutput;
use crate::stages::Task;

/// A task that records every call and echoes its first argument.
#[derive(Debug)]
pub struct RecordingTask {
    name: String,
    calls: Mutex<Vec<Vec<Value>>>,
}

impl RecordingTask {
    /// Creates a new recording task.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Returns the number of times the task was called.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Returns the arguments of every call, in call order.
    #[must_use]
    pub fn calls(&self) -> Vec<Vec<Value>> {
        self.calls.lock().clone()
    }

    /// Resets call tracking.
    pub fn reset(&self) {
        self.calls.lock().clear();
    }
}

#[async_trait]
impl Task for RecordingTask {
    fn name(&self) -> &str {
        &self.name
    }

    async fn call(&self, args: Vec<Value>) -> anyhow::Result<TaskOutput> {
        let first = args.first().cloned();
        self.calls.lock().push(args);
        Ok(TaskOutput::from(first))
    }
}

/// A task that fails, either always or only for one input value.
#[derive(Debug)]
pub struct FailingTask {
    name: String,
    error: String,
    only_on: Option<Value>,
}

impl FailingTask {
    /// Creates a task failing on every call.
    #[must_use]
    pub fn new(name: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            error: error.into(),
            only_on: None,
        }
    }

    /// Creates a task failing when its first argument equals `value`, and
    /// echoing it otherwise.
    #[must_use]
    pub fn on_value(name: impl Into<String>, value: Value, error: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            error: error.into(),
            only_on: Some(value),
        }
    }
}

#[async_trait]
impl Task for FailingTask {
    fn name(&self) -> &str {
        &self.name
    }

    async fn call(&self, args: Vec<Value>) -> anyhow::Result<TaskOutput> {
        let first = args.into_iter().next();
        match &self.only_on {
            Some(trigger) if first.as_ref() != Some(trigger) => Ok(TaskOutput::from(first)),
            _ => Err(anyhow::anyhow!("{}", self.error)),
        }
    }
}

/// A task that sleeps before echoing its first argument, tracking how many
/// calls overlap.
#[derive(Debug)]
pub struct SlowTask {
    name: String,
    delay: Duration,
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl SlowTask {
    /// Creates a new slow task.
    #[must_use]
    pub fn new(name: impl Into<String>, delay: Duration) -> Self {
        Self {
            name: name.into(),
            delay,
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    /// Returns the highest number of calls observed running at once.
    #[must_use]
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Task for SlowTask {
    fn name(&self) -> &str {
        &self.name
    }

    async fn call(&self, args: Vec<Value>) -> anyhow::Result<TaskOutput> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        Ok(TaskOutput::from(args.into_iter().next()))
    }
}

/// A source task handing out a fixed list of values, then nothing.
#[derive(Debug)]
pub struct SequenceTask {
    name: String,
    items: Mutex<VecDeque<Value>>,
}

impl SequenceTask {
    /// Creates a new sequence task.
    #[must_use]
    pub fn new(name: impl Into<String>, items: impl IntoIterator<Item = Value>) -> Self {
        Self {
            name: name.into(),
            items: Mutex::new(items.into_iter().collect()),
        }
    }

    /// Returns how many values are left.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.items.lock().len()
    }
}

#[async_trait]
impl Task for SequenceTask {
    fn name(&self) -> &str {
        &self.name
    }

    async fn call(&self, _args: Vec<Value>) -> anyhow::Result<TaskOutput> {
        Ok(TaskOutput::from(self.items.lock().pop_front()))
    }
}
