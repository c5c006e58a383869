//! Work functions and the per-stage execution engine.
//!
//! A [`Task`] is the unit of work a stage runs for every message (or every
//! interval, for source stages). [`StageRunner`] binds a task to its input
//! and output queues and drives the poll/dispatch/drain loop.

mod runner;

pub use runner::{RunOptions, StageRunner};

use crate::core::TaskOutput;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt::Debug;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

/// Trait for work functions run by a stage.
///
/// `args` is `[value, ...caller_args]` for consuming stages and just the
/// caller's arguments for source stages.
#[async_trait]
pub trait Task: Send + Sync + Debug {
    /// Returns the name of the task, used as the default stage name.
    fn name(&self) -> &str;

    /// Runs the task once.
    async fn call(&self, args: Vec<Value>) -> anyhow::Result<TaskOutput>;
}

/// A task backed by a blocking closure, run on tokio's blocking pool.
pub struct FnTask<F>
where
    F: Fn(Vec<Value>) -> anyhow::Result<TaskOutput> + Send + Sync + 'static,
{
    name: String,
    func: Arc<F>,
}

impl<F> FnTask<F>
where
    F: Fn(Vec<Value>) -> anyhow::Result<TaskOutput> + Send + Sync + 'static,
{
    /// Creates a new closure-backed task.
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func: Arc::new(func),
        }
    }
}

impl<F> Debug for FnTask<F>
where
    F: Fn(Vec<Value>) -> anyhow::Result<TaskOutput> + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnTask").field("name", &self.name).finish()
    }
}

#[async_trait]
impl<F> Task for FnTask<F>
where
    F: Fn(Vec<Value>) -> anyhow::Result<TaskOutput> + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn call(&self, args: Vec<Value>) -> anyhow::Result<TaskOutput> {
        let func = Arc::clone(&self.func);
        match tokio::task::spawn_blocking(move || func(args)).await {
            Ok(result) => result,
            Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
            Err(err) => Err(anyhow::Error::new(err).context("blocking task was cancelled")),
        }
    }
}

/// A task backed by an async closure.
pub struct AsyncFnTask<F, Fut>
where
    F: Fn(Vec<Value>) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<TaskOutput>> + Send,
{
    name: String,
    func: F,
    _phantom: PhantomData<fn() -> Fut>,
}

impl<F, Fut> AsyncFnTask<F, Fut>
where
    F: Fn(Vec<Value>) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<TaskOutput>> + Send,
{
    /// Creates a new async closure-backed task.
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
            _phantom: PhantomData,
        }
    }
}

impl<F, Fut> Debug for AsyncFnTask<F, Fut>
where
    F: Fn(Vec<Value>) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<TaskOutput>> + Send,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncFnTask").field("name", &self.name).finish()
    }
}

#[async_trait]
impl<F, Fut> Task for AsyncFnTask<F, Fut>
where
    F: Fn(Vec<Value>) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<TaskOutput>> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn call(&self, args: Vec<Value>) -> anyhow::Result<TaskOutput> {
        (self.func)(args).await
    }
}

/// Deserializes the argument at `index`.
pub fn arg<T: DeserializeOwned>(args: &[Value], index: usize) -> anyhow::Result<T> {
    let value = args
        .get(index)
        .ok_or_else(|| anyhow::anyhow!("missing argument {index} (got {})", args.len()))?;
    serde_json::from_value(value.clone())
        .map_err(|err| anyhow::anyhow!("argument {index} has the wrong shape: {err}"))
}

/// Deserializes the argument at `index`, or returns `default` if it is absent.
pub fn arg_or<T: DeserializeOwned>(args: &[Value], index: usize, default: T) -> anyhow::Result<T> {
    if index < args.len() {
        arg(args, index)
    } else {
        Ok(default)
    }
}
