//! The per-stage poll/dispatch/drain engine.

use super::Task;
use crate::config::StageOptions;
use crate::core::{
    priority_levels, queue_name, validate_stage_name, Envelope, Priority, TaskMeta, TaskOutcome,
    TaskOutput, GROUP_ID, MAX_QUEUE_NAME_LEN,
};
use crate::errors::{ConfigError, QueueflowError, TaskError};
use crate::events::{EventSink, NoOpEventSink, StageEvent, StageEventKind};
use crate::pool::{Completion, ResultBuffer, WorkerPool};
use crate::queue::{
    get_or_create_queue, OutgoingMessage, QueueAttributes, QueueHandle, QueueService, RawMessage,
    MAX_RECEIVE_BATCH,
};
use crate::utils::{generate_dedup_id, random_delay};
use async_stream::try_stream;
use async_trait::async_trait;
use futures::stream::{BoxStream, Stream};
use parking_lot::RwLock;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::{debug, info, warn};

/// Per-run options for a stage.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Priority attached to work a source stage generates.
    pub priority: Priority,
    /// Lowest input priority level to consume.
    pub min_priority: Option<u32>,
    /// Highest input priority level to consume.
    pub max_priority: Option<u32>,
}

impl RunOptions {
    /// Creates default run options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the priority for source-stage work.
    #[must_use]
    pub fn with_priority(mut self, priority: impl Into<Priority>) -> Self {
        self.priority = priority.into();
        self
    }

    /// Only consume input queues at or above this level.
    #[must_use]
    pub fn with_min_priority(mut self, min: u32) -> Self {
        self.min_priority = Some(min);
        self
    }

    /// Only consume input queues at or below this level.
    #[must_use]
    pub fn with_max_priority(mut self, max: u32) -> Self {
        self.max_priority = Some(max);
        self
    }
}

/// A drained batch split into forwardable values and failures, both in
/// completion order.
#[derive(Debug, Default)]
struct DrainedBatch {
    values: Vec<(TaskMeta, Value)>,
    failures: Vec<TaskError>,
}

fn partition_batch(completions: Vec<Completion>, ignore_none: bool) -> DrainedBatch {
    let mut batch = DrainedBatch::default();
    for Completion { meta, outcome } in completions {
        match outcome {
            TaskOutcome::Empty => {}
            TaskOutcome::Value(Value::Null) if ignore_none => {}
            TaskOutcome::Value(value) => batch.values.push((meta, value)),
            TaskOutcome::Failure(err) => batch.failures.push(err),
        }
    }
    batch
}

/// Runs the stage task for one unit of work and sends its value downstream
/// before the unit completes.
///
/// Forwarding happens on the worker, so values reach the output queues even
/// when nobody is reading the stage's stream.
struct ForwardingTask {
    runner: Arc<StageRunner>,
    meta: TaskMeta,
}

#[async_trait]
impl Task for ForwardingTask {
    fn name(&self) -> &str {
        self.runner.task.name()
    }

    async fn call(&self, args: Vec<Value>) -> anyhow::Result<TaskOutput> {
        let output = self.runner.task.call(args).await?;
        if let TaskOutput::Value(value) = &output {
            if !(value.is_null() && self.runner.options.ignore_none) {
                self.runner.forward(&self.meta, value).await;
            }
        }
        Ok(output)
    }
}

impl std::fmt::Debug for ForwardingTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForwardingTask")
            .field("stage", &self.runner.name)
            .field("meta", &self.meta)
            .finish()
    }
}

/// Publishes a run's pool on the stage and withdraws it when the run ends.
struct ActivePool {
    runner: Arc<StageRunner>,
    pool: Arc<WorkerPool>,
}

impl ActivePool {
    fn install(runner: &Arc<StageRunner>, pool: &Arc<WorkerPool>) -> Self {
        *runner.active_pool.write() = Some(Arc::clone(pool));
        Self {
            runner: Arc::clone(runner),
            pool: Arc::clone(pool),
        }
    }
}

impl Drop for ActivePool {
    fn drop(&mut self) {
        let mut active = self.runner.active_pool.write();
        // A later run on the same stage may have replaced it already.
        if active.as_ref().is_some_and(|pool| Arc::ptr_eq(pool, &self.pool)) {
            *active = None;
        }
    }
}

/// One pipeline step bound to its queues.
///
/// A stage without inputs is a source stage: it calls its task on every
/// cycle, paced by its interval. Any other stage consumes messages from its
/// input queues, highest priority first. Unless the stage is final, every
/// produced value is sent to the output queue matching its priority.
pub struct StageRunner {
    domain: String,
    name: String,
    task: Arc<dyn Task>,
    queues: Arc<dyn QueueService>,
    events: Arc<dyn EventSink>,
    options: StageOptions,
    workers: AtomicUsize,
    priority_levels: Vec<u32>,
    input_queue_names: Vec<String>,
    output_queue_names: OnceLock<Vec<String>>,
    output_queues: RwLock<BTreeMap<u32, QueueHandle>>,
    active_pool: RwLock<Option<Arc<WorkerPool>>>,
}

impl StageRunner {
    /// Creates a stage.
    ///
    /// The stage name is `options.name`, or the task's name when unset.
    pub fn new(
        domain: impl Into<String>,
        task: Arc<dyn Task>,
        queues: Arc<dyn QueueService>,
        options: StageOptions,
    ) -> Result<Self, ConfigError> {
        let domain = domain.into();
        if domain.is_empty() {
            return Err(ConfigError::domain_required());
        }
        options.validate()?;

        let name = options
            .name
            .clone()
            .unwrap_or_else(|| task.name().to_string());
        validate_stage_name(&name)?;

        let levels = priority_levels(options.effective_priorities());
        let longest = queue_name(&domain, &name, levels.iter().copied().max().unwrap_or(0));
        if longest.len() > MAX_QUEUE_NAME_LEN {
            return Err(ConfigError::queue_name_too_long(&longest));
        }

        Ok(Self {
            domain,
            name,
            task,
            queues,
            events: Arc::new(NoOpEventSink),
            workers: AtomicUsize::new(options.effective_workers()),
            options,
            priority_levels: levels,
            input_queue_names: Vec::new(),
            output_queue_names: OnceLock::new(),
            output_queues: RwLock::new(BTreeMap::new()),
            active_pool: RwLock::new(None),
        })
    }

    /// Sets the queues this stage consumes, highest priority first.
    #[must_use]
    pub fn with_inputs(mut self, names: Vec<String>) -> Self {
        self.input_queue_names = names;
        self
    }

    /// Sets the sink receiving lifecycle events.
    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Returns the stage name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the pipeline domain.
    #[must_use]
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Returns the stage options.
    #[must_use]
    pub fn options(&self) -> &StageOptions {
        &self.options
    }

    /// Returns true if the stage generates its own work.
    #[must_use]
    pub fn is_source(&self) -> bool {
        self.input_queue_names.is_empty()
    }

    /// Returns true if the stage keeps its results instead of forwarding them.
    #[must_use]
    pub fn is_final(&self) -> bool {
        self.options.is_final
    }

    /// Returns the output priority levels, highest first.
    #[must_use]
    pub fn priority_levels(&self) -> &[u32] {
        &self.priority_levels
    }

    /// Returns the input queue names, highest priority first.
    #[must_use]
    pub fn input_queue_names(&self) -> &[String] {
        &self.input_queue_names
    }

    /// Returns the output queue names, one per priority level, highest first.
    ///
    /// Empty for a final stage.
    #[must_use]
    pub fn output_queue_names(&self) -> &[String] {
        self.output_queue_names.get_or_init(|| {
            if self.is_final() {
                Vec::new()
            } else {
                self.priority_levels
                    .iter()
                    .map(|level| queue_name(&self.domain, &self.name, *level))
                    .collect()
            }
        })
    }

    /// Returns the current concurrency limit.
    #[must_use]
    pub fn workers(&self) -> usize {
        self.workers.load(Ordering::SeqCst)
    }

    /// Changes the concurrency limit, including for a run in progress.
    ///
    /// The new limit applies to the next run when none is active.
    pub fn set_workers(&self, workers: usize) {
        let workers = workers.max(1);
        self.workers.store(workers, Ordering::SeqCst);
        if let Some(pool) = self.active_pool.read().as_ref() {
            pool.set_limit(workers);
        }
        info!(stage = %self.name, workers, "Stage worker limit updated");
    }

    /// Returns true while a run of this stage is being iterated.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.active_pool.read().is_some()
    }

    /// Returns the arguments of the work currently executing.
    ///
    /// Only covers the active run. Work left behind by a dropped stream
    /// still finishes, but is no longer reported.
    #[must_use]
    pub fn running_payloads(&self) -> Vec<Vec<Value>> {
        self.active_pool
            .read()
            .as_ref()
            .map(|pool| pool.running_payloads())
            .unwrap_or_default()
    }

    /// Materializes the output queues, creating the missing ones.
    pub async fn setup(&self) -> Result<(), QueueflowError> {
        let attributes = QueueAttributes::default();
        let mut created = BTreeMap::new();

        for (level, name) in self.priority_levels.iter().zip(self.output_queue_names()) {
            let handle = get_or_create_queue(self.queues.as_ref(), name, &attributes).await?;
            debug!(stage = %self.name, queue = %handle.name, priority = level, "Output queue ready");
            created.insert(*level, handle);
        }
        *self.output_queues.write() = created;

        info!(
            stage = %self.name,
            outputs = self.output_queue_names().len(),
            "Stage setup complete"
        );
        self.emit(
            StageEventKind::SetupComplete,
            json!({ "queues": self.output_queue_names() }),
        );
        Ok(())
    }

    /// Resolves the input queues within a priority window, highest first.
    ///
    /// Waits for queues that do not exist yet, retrying until upstream stages
    /// have created them.
    pub async fn resolve_input_queues(
        &self,
        min_priority: Option<u32>,
        max_priority: Option<u32>,
    ) -> Result<Vec<QueueHandle>, QueueflowError> {
        let wanted = self.inputs_in_window(min_priority, max_priority);
        if wanted.is_empty() && !self.is_source() {
            return Err(ConfigError::empty_priority_window(min_priority, max_priority).into());
        }

        let mut resolved: Vec<Option<QueueHandle>> = vec![None; wanted.len()];
        let mut waited = false;

        loop {
            let mut missing = Vec::new();
            for (slot, name) in resolved.iter_mut().zip(&wanted) {
                if slot.is_some() {
                    continue;
                }
                match self.queues.get_queue(name).await {
                    Ok(Some(handle)) => *slot = Some(handle),
                    Ok(None) => missing.push(name.clone()),
                    Err(err) if err.is_not_found() => missing.push(name.clone()),
                    Err(err) => return Err(err.into()),
                }
            }

            if missing.is_empty() {
                break;
            }
            if !waited {
                warn!(
                    stage = %self.name,
                    missing = ?missing,
                    "Input queues do not exist yet, waiting for upstream stages"
                );
                self.emit(
                    StageEventKind::WaitingForInputs,
                    json!({ "missing": missing }),
                );
                waited = true;
            }
            tokio::time::sleep(self.options.input_wait()).await;
        }

        if waited {
            info!(stage = %self.name, "Input queues ready");
            self.emit(StageEventKind::InputsReady, json!({ "queues": wanted }));
        }
        Ok(resolved.into_iter().flatten().collect())
    }

    fn inputs_in_window(&self, min_priority: Option<u32>, max_priority: Option<u32>) -> Vec<String> {
        let count = self.input_queue_names.len();
        self.input_queue_names
            .iter()
            .enumerate()
            .filter(|(index, _)| {
                let priority = u32::try_from(count - index - 1).unwrap_or(u32::MAX);
                min_priority.map_or(true, |min| priority >= min)
                    && max_priority.map_or(true, |max| priority <= max)
            })
            .map(|(_, name)| name.clone())
            .collect()
    }

    /// Runs the stage, yielding every produced value.
    ///
    /// The stream only ends with an error: a queue fault, or the last task
    /// failure of a drained batch once the batch's values have been yielded.
    /// Values are forwarded as their work completes, not as they are
    /// yielded. Dropping the stream, or ending it with an error, stops
    /// polling; work already dispatched finishes and is forwarded in the
    /// background.
    pub fn run(
        self: &Arc<Self>,
        args: Vec<Value>,
        options: RunOptions,
    ) -> BoxStream<'static, Result<Value, QueueflowError>> {
        Box::pin(Arc::clone(self).run_loop(args, options))
    }

    fn run_loop(
        self: Arc<Self>,
        args: Vec<Value>,
        options: RunOptions,
    ) -> impl Stream<Item = Result<Value, QueueflowError>> + Send + 'static {
        let runner = self;
        try_stream! {
            let inputs = runner
                .resolve_input_queues(options.min_priority, options.max_priority)
                .await?;

            let buffer = Arc::new(ResultBuffer::new());
            let pool = Arc::new(WorkerPool::new(
                runner.name.clone(),
                runner.workers(),
                buffer.callback(),
            ));
            let _active = ActivePool::install(&runner, &pool);
            info!(
                stage = %runner.name,
                source = runner.is_source(),
                inputs = inputs.len(),
                "Stage running"
            );

            loop {
                let received = if runner.is_source() {
                    let meta = TaskMeta::new(options.priority.clone());
                    pool.dispatch(runner.forwarding(&meta), args.clone(), meta).await?;
                    None
                } else {
                    let messages = runner.poll(&inputs).await?;
                    let count = messages.len();
                    runner.dispatch_messages(&pool, messages, &args).await?;
                    Some(count)
                };

                let batch = runner.take_batch(&buffer);
                for (_, value) in batch.values {
                    yield value;
                }
                if let Some(err) = batch.failure {
                    Err::<(), _>(QueueflowError::Task(err))?;
                }

                match received {
                    None => tokio::time::sleep(runner.options.interval.next()).await,
                    Some(0) => {
                        let (min, max) = runner.options.idle_backoff();
                        tokio::time::sleep(random_delay(min, max)).await;
                    }
                    Some(_) => {}
                }
            }
        }
    }

    async fn poll(&self, inputs: &[QueueHandle]) -> Result<Vec<RawMessage>, QueueflowError> {
        let max = self.workers().min(MAX_RECEIVE_BATCH);
        for queue in inputs {
            let messages = self.queues.receive(queue, max).await?;
            if !messages.is_empty() {
                debug!(
                    stage = %self.name,
                    queue = %queue.name,
                    count = messages.len(),
                    "Received messages"
                );
                return Ok(messages);
            }
        }
        Ok(Vec::new())
    }

    fn forwarding(self: &Arc<Self>, meta: &TaskMeta) -> Arc<dyn Task> {
        Arc::new(ForwardingTask {
            runner: Arc::clone(self),
            meta: meta.clone(),
        })
    }

    async fn dispatch_messages(
        self: &Arc<Self>,
        pool: &WorkerPool,
        messages: Vec<RawMessage>,
        args: &[Value],
    ) -> Result<(), QueueflowError> {
        for message in messages {
            let decoded = Envelope::decode(&message.body);
            self.queues.delete_message(&message).await?;

            match decoded {
                Ok(envelope) => {
                    let mut task_args = Vec::with_capacity(args.len() + 1);
                    task_args.push(envelope.value);
                    task_args.extend_from_slice(args);
                    let meta: TaskMeta = envelope.meta.into();
                    pool.dispatch(self.forwarding(&meta), task_args, meta).await?;
                }
                Err(err) => {
                    warn!(
                        stage = %self.name,
                        queue = %message.queue.name,
                        message_id = %message.message_id,
                        error = %err,
                        "Dropping undecodable message"
                    );
                    self.emit(
                        StageEventKind::MessageDropped,
                        json!({
                            "queue": message.queue.name,
                            "message_id": message.message_id,
                            "error": err.to_string(),
                        }),
                    );
                }
            }
        }
        Ok(())
    }

    /// Drains the buffer, reporting every failure and keeping the last one.
    fn take_batch(&self, buffer: &ResultBuffer) -> ReadyBatch {
        let DrainedBatch { values, failures } =
            partition_batch(buffer.drain(), self.options.ignore_none);

        let failure_count = failures.len();
        let mut failure = None;
        for (index, err) in failures.into_iter().enumerate() {
            self.emit(
                StageEventKind::TaskFailed,
                json!({ "task": err.task, "error": err.message, "panicked": err.panicked }),
            );
            if index + 1 < failure_count {
                warn!(stage = %self.name, error = %err, "Task failure superseded by a later failure in the same batch");
            } else {
                warn!(stage = %self.name, error = %err, "Task failed");
                failure = Some(err);
            }
        }

        ReadyBatch { values, failure }
    }

    /// Sends a produced value to the output queue of its priority.
    ///
    /// Failures are logged and reported, never returned.
    async fn forward(&self, meta: &TaskMeta, value: &Value) {
        if self.is_final() {
            return;
        }

        let wire = meta.resolve(value);
        let priority = wire.priority;
        let queue = self.output_queues.read().get(&priority).cloned();
        let Some(queue) = queue else {
            warn!(
                stage = %self.name,
                priority,
                "No output queue for priority, value not forwarded"
            );
            self.emit(
                StageEventKind::ForwardFailed,
                json!({ "priority": priority, "error": "no output queue for priority" }),
            );
            return;
        };

        let body = match Envelope::new(wire, value.clone()).encode() {
            Ok(body) => body,
            Err(err) => {
                warn!(stage = %self.name, priority, error = %err, "Failed to encode value");
                self.emit(
                    StageEventKind::ForwardFailed,
                    json!({ "queue": queue.name, "priority": priority, "error": err.to_string() }),
                );
                return;
            }
        };

        let message = OutgoingMessage {
            body,
            dedup_id: generate_dedup_id(),
            group_id: GROUP_ID.to_string(),
        };
        if let Err(err) = self.queues.send(&queue, message).await {
            warn!(
                stage = %self.name,
                queue = %queue.name,
                priority,
                error = %err,
                "Failed to forward value"
            );
            self.emit(
                StageEventKind::ForwardFailed,
                json!({ "queue": queue.name, "priority": priority, "error": err.to_string() }),
            );
        }
    }

    fn emit(&self, kind: StageEventKind, data: Value) {
        self.events.emit(&StageEvent::new(kind, self.name.as_str(), data));
    }
}

/// Values to yield and the failure to surface afterwards.
#[derive(Debug)]
struct ReadyBatch {
    values: Vec<(TaskMeta, Value)>,
    failure: Option<TaskError>,
}

impl std::fmt::Debug for StageRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageRunner")
            .field("domain", &self.domain)
            .field("name", &self.name)
            .field("task", &self.task)
            .field("workers", &self.workers())
            .field("priority_levels", &self.priority_levels)
            .field("inputs", &self.input_queue_names)
            .field("final", &self.is_final())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::QueueError;
    use crate::events::CollectingEventSink;
    use crate::queue::{InMemoryQueueService, MockQueueService};
    use crate::testing::{
        queued_values, seed_queue, seed_raw, take_results, FailingTask, RecordingTask,
        SequenceTask, SlowTask,
    };
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(5);

    fn fast(options: StageOptions) -> StageOptions {
        options
            .with_idle_backoff(Duration::from_millis(1), Duration::from_millis(5))
            .with_input_wait(Duration::from_millis(10))
    }

    fn stage(
        service: &Arc<InMemoryQueueService>,
        task: Arc<dyn Task>,
        options: StageOptions,
    ) -> StageRunner {
        let queues: Arc<dyn QueueService> = Arc::clone(service) as Arc<dyn QueueService>;
        StageRunner::new("test", task, queues, fast(options)).unwrap()
    }

    fn values(results: Vec<Result<Value, QueueflowError>>) -> Vec<Value> {
        results.into_iter().map(Result::unwrap).collect()
    }

    #[test]
    fn test_output_queue_names_one_per_level() {
        let service = Arc::new(InMemoryQueueService::new());
        let runner = stage(
            &service,
            Arc::new(RecordingTask::new("gen")),
            StageOptions::new().with_priorities(2),
        );

        assert_eq!(runner.name(), "gen");
        assert_eq!(runner.priority_levels(), &[2, 1, 0]);
        assert_eq!(
            runner.output_queue_names(),
            &["test-gen--p2.fifo", "test-gen--p1.fifo", "test-gen.fifo"]
        );
    }

    #[test]
    fn test_final_stage_has_no_outputs() {
        let service = Arc::new(InMemoryQueueService::new());
        let runner = stage(
            &service,
            Arc::new(RecordingTask::new("sink")),
            StageOptions::new().with_priorities(3).final_stage(),
        );

        assert!(runner.output_queue_names().is_empty());
    }

    #[test]
    fn test_new_rejects_bad_configuration() {
        let queues: Arc<dyn QueueService> = Arc::new(InMemoryQueueService::new());
        let task: Arc<dyn Task> = Arc::new(RecordingTask::new("gen"));

        let err = StageRunner::new("", Arc::clone(&task), Arc::clone(&queues), StageOptions::new())
            .unwrap_err();
        assert_eq!(err.code(), Some("CONFIG-DOMAIN-REQUIRED"));

        let err = StageRunner::new(
            "d",
            Arc::clone(&task),
            Arc::clone(&queues),
            StageOptions::new().with_name("bad name"),
        )
        .unwrap_err();
        assert_eq!(err.code(), Some("CONFIG-STAGE-NAME"));

        let err = StageRunner::new(
            "d".repeat(70),
            task,
            queues,
            StageOptions::new().with_priorities(12),
        )
        .unwrap_err();
        assert_eq!(err.code(), Some("CONFIG-QUEUE-NAME"));
    }

    #[tokio::test]
    async fn test_setup_creates_output_queues() {
        let service = Arc::new(InMemoryQueueService::new());
        let events = Arc::new(CollectingEventSink::new());
        let runner = stage(
            &service,
            Arc::new(RecordingTask::new("gen")),
            StageOptions::new().with_priorities(1),
        )
        .with_event_sink(events.clone());

        runner.setup().await.unwrap();
        runner.setup().await.unwrap();

        let names: Vec<String> = service
            .list_queues("test-")
            .await
            .unwrap()
            .into_iter()
            .map(|q| q.name)
            .collect();
        assert_eq!(names, vec!["test-gen--p1.fifo", "test-gen.fifo"]);
        assert_eq!(events.count_of("stage.setup_complete"), 2);
    }

    #[tokio::test]
    async fn test_setup_propagates_service_errors() {
        let mut service = MockQueueService::new();
        service
            .expect_get_queue()
            .returning(|name: &str| Err(QueueError::service(name, "access denied")));
        service.expect_create_queue().never();

        let runner = StageRunner::new(
            "test",
            Arc::new(RecordingTask::new("gen")),
            Arc::new(service),
            StageOptions::new(),
        )
        .unwrap();

        let err = runner.setup().await.unwrap_err();
        assert!(matches!(err, QueueflowError::Queue(QueueError::Service { .. })));
    }

    #[tokio::test]
    async fn test_setup_creates_queues_reported_not_found() {
        let mut service = MockQueueService::new();
        service
            .expect_get_queue()
            .returning(|name: &str| Err(QueueError::not_found(name)));
        service
            .expect_create_queue()
            .times(2)
            .returning(|name: &str, _: &QueueAttributes| {
                Ok(QueueHandle::new(name, format!("memory://{name}")))
            });

        let runner = StageRunner::new(
            "test",
            Arc::new(RecordingTask::new("gen")),
            Arc::new(service),
            StageOptions::new().with_priorities(1),
        )
        .unwrap();

        runner.setup().await.unwrap();
        assert_eq!(
            runner.output_queues.read().keys().copied().collect::<Vec<_>>(),
            vec![0, 1]
        );
    }

    #[tokio::test]
    async fn test_source_routes_by_computed_priority() {
        let service = Arc::new(InMemoryQueueService::new());
        let runner = Arc::new(stage(
            &service,
            Arc::new(SequenceTask::new("gen", [json!("hello"), json!("hi")])),
            StageOptions::new().with_priorities(1),
        ));
        runner.setup().await.unwrap();

        let priority = Priority::computed(|v| u32::from(v.as_str().map_or(0, str::len) > 3));
        let mut stream = runner.run(vec![], RunOptions::new().with_priority(priority));
        let produced = values(take_results(&mut stream, 2, WAIT).await);

        assert_eq!(produced, vec![json!("hello"), json!("hi")]);
        assert_eq!(queued_values(&service, "test-gen--p1.fifo"), vec![json!("hello")]);
        assert_eq!(queued_values(&service, "test-gen.fifo"), vec![json!("hi")]);
    }

    #[tokio::test]
    async fn test_consumer_appends_caller_args_and_keeps_meta() {
        let service = Arc::new(InMemoryQueueService::new());
        let queue = seed_queue(&*service, "test-up--p1.fifo", []).await.unwrap();
        let body = Envelope::new(
            crate::core::WireMeta {
                priority: 1,
                extra: [("trace".to_string(), json!("abc"))].into_iter().collect(),
            },
            json!(5),
        )
        .encode()
        .unwrap();
        seed_raw(&*service, &queue, body).await.unwrap();

        let task = Arc::new(RecordingTask::new("work"));
        let runner = Arc::new(
            stage(&service, task.clone(), StageOptions::new().with_priorities(1))
                .with_inputs(vec!["test-up--p1.fifo".to_string()]),
        );
        runner.setup().await.unwrap();

        let mut stream = runner.run(vec![json!("extra")], RunOptions::new());
        let produced = values(take_results(&mut stream, 1, WAIT).await);

        assert_eq!(produced, vec![json!(5)]);
        assert_eq!(task.calls(), vec![vec![json!(5), json!("extra")]]);

        let forwarded = crate::testing::queued_envelopes(&service, "test-work--p1.fifo");
        assert_eq!(forwarded.len(), 1);
        assert_eq!(forwarded[0].meta.extra.get("trace"), Some(&json!("abc")));
        assert_eq!(service.depth("test-up--p1.fifo"), 0);
    }

    #[tokio::test]
    async fn test_null_results_follow_ignore_none() {
        for (ignore_none, expected) in [
            (true, vec![json!(2)]),
            (false, vec![Value::Null, json!(2)]),
        ] {
            let service = Arc::new(InMemoryQueueService::new());
            seed_queue(&*service, "test-up.fifo", [Value::Null, json!(2)])
                .await
                .unwrap();
            let runner = Arc::new(
                stage(
                    &service,
                    Arc::new(RecordingTask::new("work")),
                    StageOptions::new().with_ignore_none(ignore_none).final_stage(),
                )
                .with_inputs(vec!["test-up.fifo".to_string()]),
            );

            let mut stream = runner.run(vec![], RunOptions::new());
            let produced = values(take_results(&mut stream, expected.len(), WAIT).await);
            assert_eq!(produced, expected);
        }
    }

    #[tokio::test]
    async fn test_failure_is_not_forwarded_and_ends_stream() {
        let service = Arc::new(InMemoryQueueService::new());
        seed_queue(
            &*service,
            "test-up.fifo",
            [json!(1), json!("bad"), json!(3)],
        )
        .await
        .unwrap();
        let runner = Arc::new(
            stage(
                &service,
                Arc::new(FailingTask::on_value("work", json!("bad"), "cannot handle")),
                StageOptions::new(),
            )
            .with_inputs(vec!["test-up.fifo".to_string()]),
        );
        runner.setup().await.unwrap();

        let mut stream = runner.run(vec![], RunOptions::new());
        let results = take_results(&mut stream, 10, WAIT).await;

        let (last, before) = results.split_last().unwrap();
        let err = match last {
            Err(err) => err.as_task_error().cloned().unwrap(),
            Ok(value) => panic!("expected a failure, got {value}"),
        };
        assert_eq!(err.message, "cannot handle");
        assert!(before.iter().all(|r| matches!(r, Ok(v) if v != &json!("bad"))));
        assert!(!queued_values(&service, "test-work.fifo").contains(&json!("bad")));
        assert!(futures::StreamExt::next(&mut stream).await.is_none());
    }

    #[test]
    fn test_partition_batch_drops_empty_and_null() {
        let completions = vec![
            Completion { meta: TaskMeta::default(), outcome: TaskOutcome::Value(json!(1)) },
            Completion {
                meta: TaskMeta::default(),
                outcome: TaskOutcome::Failure(TaskError::new("t", "first")),
            },
            Completion { meta: TaskMeta::default(), outcome: TaskOutcome::Empty },
            Completion { meta: TaskMeta::default(), outcome: TaskOutcome::Value(Value::Null) },
            Completion {
                meta: TaskMeta::default(),
                outcome: TaskOutcome::Failure(TaskError::new("t", "second")),
            },
            Completion { meta: TaskMeta::default(), outcome: TaskOutcome::Value(json!(2)) },
        ];

        let batch = partition_batch(completions.clone(), true);
        let kept: Vec<Value> = batch.values.into_iter().map(|(_, v)| v).collect();
        assert_eq!(kept, vec![json!(1), json!(2)]);
        assert_eq!(batch.failures.len(), 2);

        let batch = partition_batch(completions, false);
        assert_eq!(batch.values.len(), 3);
    }

    #[test]
    fn test_take_batch_keeps_last_failure() {
        let service = Arc::new(InMemoryQueueService::new());
        let events = Arc::new(CollectingEventSink::new());
        let runner = stage(&service, Arc::new(RecordingTask::new("work")), StageOptions::new())
            .with_event_sink(events.clone());

        let buffer = ResultBuffer::new();
        buffer.push(TaskMeta::default(), TaskOutcome::Failure(TaskError::new("work", "first")));
        buffer.push(TaskMeta::default(), TaskOutcome::Value(json!("ok")));
        buffer.push(TaskMeta::default(), TaskOutcome::Failure(TaskError::new("work", "last")));

        let batch = runner.take_batch(&buffer);
        assert_eq!(batch.values.len(), 1);
        assert_eq!(batch.failure.map(|e| e.message), Some("last".to_string()));
        assert_eq!(events.count_of("stage.task_failed"), 2);
    }

    #[tokio::test]
    async fn test_send_failure_is_swallowed() {
        let service = Arc::new(InMemoryQueueService::new());
        let events = Arc::new(CollectingEventSink::new());
        let runner = Arc::new(
            stage(
                &service,
                Arc::new(SequenceTask::new("gen", [json!(1)])),
                StageOptions::new(),
            )
            .with_event_sink(events.clone()),
        );
        runner.setup().await.unwrap();
        service.set_fail_sends(true);

        let mut stream = runner.run(vec![], RunOptions::new());
        let produced = values(take_results(&mut stream, 1, WAIT).await);

        assert_eq!(produced, vec![json!(1)]);
        assert_eq!(events.count_of("stage.forward_failed"), 1);
        assert_eq!(service.depth("test-gen.fifo"), 0);
    }

    #[tokio::test]
    async fn test_out_of_range_priority_is_reported() {
        let service = Arc::new(InMemoryQueueService::new());
        let events = Arc::new(CollectingEventSink::new());
        let runner = Arc::new(
            stage(
                &service,
                Arc::new(SequenceTask::new("gen", [json!(1)])),
                StageOptions::new(),
            )
            .with_event_sink(events.clone()),
        );
        runner.setup().await.unwrap();

        let mut stream = runner.run(vec![], RunOptions::new().with_priority(4_u32));
        let produced = values(take_results(&mut stream, 1, WAIT).await);

        assert_eq!(produced, vec![json!(1)]);
        assert_eq!(events.count_of("stage.forward_failed"), 1);
    }

    #[tokio::test]
    async fn test_waits_for_missing_inputs() {
        let service = Arc::new(InMemoryQueueService::new());
        let events = Arc::new(CollectingEventSink::new());
        let runner = Arc::new(
            stage(
                &service,
                Arc::new(RecordingTask::new("work")),
                StageOptions::new().final_stage(),
            )
            .with_inputs(vec!["test-late.fifo".to_string()])
            .with_event_sink(events.clone()),
        );

        let upstream = Arc::clone(&service);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            seed_queue(&*upstream, "test-late.fifo", [json!("x")])
                .await
                .unwrap();
        });

        let mut stream = runner.run(vec![], RunOptions::new());
        let produced = values(take_results(&mut stream, 1, WAIT).await);

        assert_eq!(produced, vec![json!("x")]);
        assert_eq!(events.count_of("stage.waiting_for_inputs"), 1);
        assert_eq!(events.count_of("stage.inputs_ready"), 1);
    }

    #[tokio::test]
    async fn test_input_lookup_errors_propagate() {
        let service = Arc::new(InMemoryQueueService::new());
        let runner = stage(&service, Arc::new(RecordingTask::new("work")), StageOptions::new())
            .with_inputs(vec!["test-up.fifo".to_string()]);
        service.set_fail_lookups(true);

        let err = runner.resolve_input_queues(None, None).await.unwrap_err();
        assert!(matches!(err, QueueflowError::Queue(QueueError::Service { .. })));
    }

    #[tokio::test]
    async fn test_priority_window_limits_inputs() {
        let service = Arc::new(InMemoryQueueService::new());
        for name in ["test-up--p1.fifo", "test-up.fifo"] {
            seed_queue(&*service, name, []).await.unwrap();
        }
        let runner = stage(&service, Arc::new(RecordingTask::new("work")), StageOptions::new())
            .with_inputs(vec!["test-up--p1.fifo".to_string(), "test-up.fifo".to_string()]);

        let names = |queues: Vec<QueueHandle>| queues.into_iter().map(|q| q.name).collect::<Vec<_>>();

        let all = runner.resolve_input_queues(None, None).await.unwrap();
        assert_eq!(names(all), vec!["test-up--p1.fifo", "test-up.fifo"]);

        let high = runner.resolve_input_queues(Some(1), None).await.unwrap();
        assert_eq!(names(high), vec!["test-up--p1.fifo"]);

        let low = runner.resolve_input_queues(None, Some(0)).await.unwrap();
        assert_eq!(names(low), vec!["test-up.fifo"]);

        let err = runner.resolve_input_queues(Some(5), None).await.unwrap_err();
        assert!(matches!(err, QueueflowError::Config(_)));
    }

    #[tokio::test]
    async fn test_consumer_prefers_higher_priority_input() {
        let service = Arc::new(InMemoryQueueService::new());
        seed_queue(&*service, "test-up.fifo", [json!("low")]).await.unwrap();
        seed_queue(&*service, "test-up--p1.fifo", [json!("high")])
            .await
            .unwrap();
        let runner = Arc::new(
            stage(
                &service,
                Arc::new(RecordingTask::new("work")),
                StageOptions::new().final_stage(),
            )
            .with_inputs(vec!["test-up--p1.fifo".to_string(), "test-up.fifo".to_string()]),
        );

        let mut stream = runner.run(vec![], RunOptions::new());
        let produced = values(take_results(&mut stream, 2, WAIT).await);

        assert_eq!(produced, vec![json!("high"), json!("low")]);
    }

    #[tokio::test]
    async fn test_undecodable_message_is_dropped() {
        let service = Arc::new(InMemoryQueueService::new());
        let events = Arc::new(CollectingEventSink::new());
        let queue = seed_queue(&*service, "test-up.fifo", []).await.unwrap();
        seed_raw(&*service, &queue, "not json").await.unwrap();
        seed_queue(&*service, "test-up.fifo", [json!(5)]).await.unwrap();

        let runner = Arc::new(
            stage(
                &service,
                Arc::new(RecordingTask::new("work")),
                StageOptions::new().final_stage(),
            )
            .with_inputs(vec!["test-up.fifo".to_string()])
            .with_event_sink(events.clone()),
        );

        let mut stream = runner.run(vec![], RunOptions::new());
        let produced = values(take_results(&mut stream, 1, WAIT).await);

        assert_eq!(produced, vec![json!(5)]);
        assert_eq!(events.count_of("stage.message_dropped"), 1);
        assert_eq!(service.depth("test-up.fifo"), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_consumer_respects_worker_limit() {
        let service = Arc::new(InMemoryQueueService::new());
        seed_queue(&*service, "test-up.fifo", (0..12).map(|i| json!(i)))
            .await
            .unwrap();
        let task = Arc::new(SlowTask::new("work", Duration::from_millis(20)));
        let runner = Arc::new(
            stage(&service, task.clone(), StageOptions::new().with_workers(3).final_stage())
                .with_inputs(vec!["test-up.fifo".to_string()]),
        );

        let mut stream = runner.run(vec![], RunOptions::new());
        let produced = take_results(&mut stream, 12, WAIT).await;

        assert_eq!(produced.len(), 12);
        assert!(task.peak_concurrency() <= 3);
    }

    #[tokio::test]
    async fn test_set_workers_updates_running_stage() {
        let service = Arc::new(InMemoryQueueService::new());
        let task = Arc::new(RecordingTask::new("gen"));
        let runner = Arc::new(stage(
            &service,
            task.clone(),
            StageOptions::new()
                .with_interval(Duration::from_millis(1))
                .final_stage(),
        ));
        assert!(runner.running_payloads().is_empty());

        let mut stream = runner.run(vec![json!(10)], RunOptions::new());
        let first = values(take_results(&mut stream, 1, WAIT).await);
        assert_eq!(first, vec![json!(10)]);
        assert!(runner.is_running());

        runner.set_workers(0);
        assert_eq!(runner.workers(), 1);
        runner.set_workers(4);
        assert_eq!(runner.workers(), 4);

        let more = values(take_results(&mut stream, 2, WAIT).await);
        assert_eq!(more, vec![json!(10), json!(10)]);
        drop(stream);

        let calls = task.calls();
        assert!(calls.len() >= 3);
        assert!(calls.iter().all(|call| call == &vec![json!(10)]));
    }

    async fn wait_until(mut check: impl FnMut() -> bool) -> bool {
        let deadline = tokio::time::Instant::now() + WAIT;
        while tokio::time::Instant::now() < deadline {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        check()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_dropped_stream_still_forwards_whole_batch() {
        let service = Arc::new(InMemoryQueueService::new());
        seed_queue(&*service, "test-up.fifo", [json!(1), json!(2), json!(3)])
            .await
            .unwrap();
        let runner = Arc::new(
            stage(
                &service,
                Arc::new(SlowTask::new("work", Duration::from_millis(20))),
                StageOptions::new().with_workers(3),
            )
            .with_inputs(vec!["test-up.fifo".to_string()]),
        );
        runner.setup().await.unwrap();

        let mut stream = runner.run(vec![], RunOptions::new());
        let produced = take_results(&mut stream, 1, WAIT).await;
        assert_eq!(produced.len(), 1);
        drop(stream);

        assert!(!runner.is_running());
        assert!(wait_until(|| service.depth("test-work.fifo") == 3).await);
        let mut forwarded = queued_values(&service, "test-work.fifo");
        forwarded.sort_by_key(|v| v.as_i64());
        assert_eq!(forwarded, vec![json!(1), json!(2), json!(3)]);
        assert_eq!(service.depth("test-up.fifo"), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_failure_ends_stream_but_in_flight_work_is_forwarded() {
        let service = Arc::new(InMemoryQueueService::new());
        seed_queue(&*service, "test-up.fifo", [json!("slow"), json!("boom")])
            .await
            .unwrap();
        let task = crate::stages::AsyncFnTask::new("work", |args: Vec<Value>| async move {
            let word: String = crate::stages::arg(&args, 0)?;
            if word == "boom" {
                anyhow::bail!("boom");
            }
            tokio::time::sleep(Duration::from_millis(150)).await;
            Ok::<_, anyhow::Error>(TaskOutput::value(word))
        });
        let runner = Arc::new(
            stage(&service, Arc::new(task), StageOptions::new().with_workers(2))
                .with_inputs(vec!["test-up.fifo".to_string()]),
        );
        runner.setup().await.unwrap();

        let mut stream = runner.run(vec![], RunOptions::new());
        let results = take_results(&mut stream, 1, WAIT).await;
        let err = results.into_iter().next().unwrap().unwrap_err();
        assert_eq!(err.as_task_error().map(|e| e.message.as_str()), Some("boom"));
        drop(stream);
        assert!(!runner.is_running());

        assert!(wait_until(|| service.depth("test-work.fifo") == 1).await);
        assert_eq!(queued_values(&service, "test-work.fifo"), vec![json!("slow")]);
    }
}
