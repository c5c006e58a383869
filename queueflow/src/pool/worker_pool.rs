//! Semaphore-bounded worker pool.

use crate::core::{TaskMeta, TaskOutcome};
use crate::errors::{QueueflowError, TaskError};
use crate::stages::Task;
use dashmap::DashMap;
use futures::FutureExt;
use serde_json::Value;
use std::any::Any;
use std::cmp::Ordering as CmpOrdering;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, warn};
use uuid::Uuid;

/// Callback receiving the outcome of every dispatched unit of work.
///
/// Invoked exactly once per unit, possibly from several workers at once.
pub type CompletionCallback = Arc<dyn Fn(TaskMeta, TaskOutcome) + Send + Sync>;

/// Runs units of work with at most `limit` executing concurrently.
pub struct WorkerPool {
    name: String,
    limit: AtomicUsize,
    semaphore: Arc<Semaphore>,
    /// Permits to retire as running work finishes, after a limit decrease.
    pending_shrink: Arc<AtomicUsize>,
    in_flight: Arc<AtomicUsize>,
    running: Arc<DashMap<Uuid, Vec<Value>>>,
    on_complete: CompletionCallback,
}

impl WorkerPool {
    /// Creates a pool. A limit of zero is treated as one.
    #[must_use]
    pub fn new(name: impl Into<String>, limit: usize, on_complete: CompletionCallback) -> Self {
        let limit = limit.max(1);
        Self {
            name: name.into(),
            limit: AtomicUsize::new(limit),
            semaphore: Arc::new(Semaphore::new(limit)),
            pending_shrink: Arc::new(AtomicUsize::new(0)),
            in_flight: Arc::new(AtomicUsize::new(0)),
            running: Arc::new(DashMap::new()),
            on_complete,
        }
    }

    /// Returns the pool name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the concurrency limit.
    #[must_use]
    pub fn limit(&self) -> usize {
        self.limit.load(Ordering::SeqCst)
    }

    /// Returns the number of units currently executing.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Returns the arguments of every unit currently executing.
    #[must_use]
    pub fn running_payloads(&self) -> Vec<Vec<Value>> {
        self.running.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Changes the concurrency limit. A limit of zero is treated as one.
    ///
    /// Raising the limit admits waiting work immediately; lowering it takes
    /// effect as running work finishes.
    pub fn set_limit(&self, limit: usize) {
        let limit = limit.max(1);
        let previous = self.limit.swap(limit, Ordering::SeqCst);

        match limit.cmp(&previous) {
            CmpOrdering::Greater => {
                let mut grow = limit - previous;
                while grow > 0
                    && self
                        .pending_shrink
                        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                        .is_ok()
                {
                    grow -= 1;
                }
                self.semaphore.add_permits(grow);
            }
            CmpOrdering::Less => {
                let shrink = previous - limit;
                let forgotten = self.semaphore.forget_permits(shrink);
                self.pending_shrink.fetch_add(shrink - forgotten, Ordering::SeqCst);
            }
            CmpOrdering::Equal => {}
        }

        debug!(pool = %self.name, previous, limit, "Worker limit changed");
    }

    /// Dispatches a unit of work, waiting while the pool is saturated.
    ///
    /// Returns the id of the dispatched unit once it has been admitted. The
    /// work's outcome, including errors and panics, goes to the completion
    /// callback.
    pub async fn dispatch(
        &self,
        task: Arc<dyn Task>,
        args: Vec<Value>,
        meta: TaskMeta,
    ) -> Result<Uuid, QueueflowError> {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| QueueflowError::PoolClosed(self.name.clone()))?;

        let task_id = Uuid::new_v4();
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        self.running.insert(task_id, args.clone());

        let in_flight = Arc::clone(&self.in_flight);
        let running = Arc::clone(&self.running);
        let pending_shrink = Arc::clone(&self.pending_shrink);
        let on_complete = Arc::clone(&self.on_complete);

        tokio::spawn(async move {
            let outcome = match AssertUnwindSafe(task.call(args)).catch_unwind().await {
                Ok(Ok(output)) => TaskOutcome::from(Ok(output)),
                Ok(Err(err)) => TaskOutcome::Failure(TaskError::from_error(task.name(), &err)),
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    warn!(task = %task.name(), %message, "Work function panicked");
                    TaskOutcome::Failure(TaskError::panicked(task.name(), message))
                }
            };

            in_flight.fetch_sub(1, Ordering::SeqCst);
            running.remove(&task_id);
            on_complete(meta, outcome);

            // The slot is released only after the outcome is recorded.
            let retire = pending_shrink
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if retire {
                permit.forget();
            } else {
                drop(permit);
            }
        });

        Ok(task_id)
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.name)
            .field("limit", &self.limit())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "work function panicked".to_string()
    }
}
