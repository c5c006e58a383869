//! Queue service abstraction.
//!
//! Stages only talk to durable ordered queues through [`QueueService`].
//! Durability, visibility timeouts, ordering and deduplication are the
//! service's responsibility; the engine relies on `get_queue`,
//! `create_queue`, `receive`, `delete_message` and `send`, while the
//! remaining operations back the pipeline's maintenance helpers.

mod memory;

pub use memory::InMemoryQueueService;

use crate::errors::QueueError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Most messages a single receive call may return.
pub const MAX_RECEIVE_BATCH: usize = 10;

/// Default visibility timeout for queues created by a stage.
pub const DEFAULT_VISIBILITY_TIMEOUT_SECONDS: u32 = 120;

/// A resolved reference to a queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueHandle {
    /// The queue name.
    pub name: String,
    /// The service-specific address of the queue.
    pub url: String,
}

impl QueueHandle {
    /// Creates a queue handle.
    #[must_use]
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
        }
    }
}

/// Attributes used when creating a queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueAttributes {
    /// Whether the queue delivers messages in order.
    pub fifo: bool,
    /// Seconds a received message stays hidden before redelivery.
    pub visibility_timeout_seconds: u32,
}

impl Default for QueueAttributes {
    fn default() -> Self {
        Self {
            fifo: true,
            visibility_timeout_seconds: DEFAULT_VISIBILITY_TIMEOUT_SECONDS,
        }
    }
}

/// A message as received from a queue.
#[derive(Debug, Clone)]
pub struct RawMessage {
    /// The queue the message was received from.
    pub queue: QueueHandle,
    /// The service-assigned message id.
    pub message_id: String,
    /// Token required to delete this delivery.
    pub receipt_handle: String,
    /// The message body.
    pub body: String,
    /// When the message was sent.
    pub sent_at: DateTime<Utc>,
}

/// A message to enqueue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    /// The message body.
    pub body: String,
    /// Idempotency token; duplicates within the service's window are dropped.
    pub dedup_id: String,
    /// Ordering group; messages in one group are delivered in order.
    pub group_id: String,
}

/// Trait for durable ordered queue services.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait QueueService: Send + Sync {
    /// Looks up a queue by name, returning `None` if it does not exist.
    async fn get_queue(&self, name: &str) -> Result<Option<QueueHandle>, QueueError>;

    /// Creates a queue, returning the existing one if it is already there.
    async fn create_queue(
        &self,
        name: &str,
        attributes: &QueueAttributes,
    ) -> Result<QueueHandle, QueueError>;

    /// Receives up to `max_messages` messages without waiting.
    async fn receive(
        &self,
        queue: &QueueHandle,
        max_messages: usize,
    ) -> Result<Vec<RawMessage>, QueueError>;

    /// Deletes a received message.
    async fn delete_message(&self, message: &RawMessage) -> Result<(), QueueError>;

    /// Sends a message.
    async fn send(&self, queue: &QueueHandle, message: OutgoingMessage) -> Result<(), QueueError>;

    /// Lists queues whose name starts with `prefix`.
    async fn list_queues(&self, prefix: &str) -> Result<Vec<QueueHandle>, QueueError>;

    /// Deletes a queue and its messages.
    async fn delete_queue(&self, queue: &QueueHandle) -> Result<(), QueueError>;

    /// Removes every message from a queue.
    async fn purge_queue(&self, queue: &QueueHandle) -> Result<(), QueueError>;
}

/// Fetches a queue, creating it if it does not exist.
///
/// A backend may report a missing queue either as `Ok(None)` or as
/// [`QueueError::NotFound`]; both lead to creation.
pub async fn get_or_create_queue(
    service: &dyn QueueService,
    name: &str,
    attributes: &QueueAttributes,
) -> Result<QueueHandle, QueueError> {
    match service.get_queue(name).await {
        Ok(Some(handle)) => Ok(handle),
        Ok(None) => service.create_queue(name, attributes).await,
        Err(err) if err.is_not_found() => service.create_queue(name, attributes).await,
        Err(err) => Err(err),
    }
}
