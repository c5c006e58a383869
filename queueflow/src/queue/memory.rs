//! Process-local queue service.
//!
//! Delivers messages in send order, hides received messages until they are
//! deleted or their visibility timeout lapses, and drops sends whose
//! deduplication id was already seen within the last five minutes. Useful for
//! tests and for running a whole pipeline inside one process.

use super::{OutgoingMessage, QueueAttributes, QueueHandle, QueueService, RawMessage};
use crate::core::{MAX_QUEUE_NAME_LEN, QUEUE_SUFFIX};
use crate::errors::QueueError;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

const DEDUP_WINDOW_MINUTES: i64 = 5;

#[derive(Debug, Clone)]
struct StoredMessage {
    sequence: u64,
    message_id: String,
    body: String,
    sent_at: DateTime<Utc>,
}

#[derive(Debug)]
struct MemoryQueue {
    handle: QueueHandle,
    attributes: QueueAttributes,
    visible: VecDeque<StoredMessage>,
    /// Received but not yet deleted, keyed by receipt handle.
    in_flight: HashMap<String, (StoredMessage, DateTime<Utc>)>,
    seen_dedup_ids: HashMap<String, DateTime<Utc>>,
}

impl MemoryQueue {
    fn new(handle: QueueHandle, attributes: QueueAttributes) -> Self {
        Self {
            handle,
            attributes,
            visible: VecDeque::new(),
            in_flight: HashMap::new(),
            seen_dedup_ids: HashMap::new(),
        }
    }

    /// Returns expired in-flight messages to the front of the queue, oldest first.
    fn restore_expired(&mut self, now: DateTime<Utc>) {
        let expired: Vec<String> = self
            .in_flight
            .iter()
            .filter(|(_, (_, invisible_until))| *invisible_until <= now)
            .map(|(receipt, _)| receipt.clone())
            .collect();

        if expired.is_empty() {
            return;
        }

        let mut restored: Vec<StoredMessage> = expired
            .iter()
            .filter_map(|receipt| self.in_flight.remove(receipt).map(|(msg, _)| msg))
            .collect();
        restored.sort_by_key(|msg| msg.sequence);

        for msg in restored.into_iter().rev() {
            self.visible.push_front(msg);
        }
    }
}

/// An in-memory [`QueueService`].
#[derive(Debug, Default)]
pub struct InMemoryQueueService {
    queues: DashMap<String, Arc<Mutex<MemoryQueue>>>,
    sequence: AtomicU64,
    fail_sends: AtomicBool,
    fail_lookups: AtomicBool,
}

impl InMemoryQueueService {
    /// Creates an empty service.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent `send` fail with a service error.
    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Makes every subsequent `get_queue` fail with a service error.
    pub fn set_fail_lookups(&self, fail: bool) {
        self.fail_lookups.store(fail, Ordering::SeqCst);
    }

    /// Returns the bodies of the currently visible messages of a queue.
    #[must_use]
    pub fn visible_bodies(&self, name: &str) -> Vec<String> {
        self.queues.get(name).map_or_else(Vec::new, |queue| {
            queue.lock().visible.iter().map(|m| m.body.clone()).collect()
        })
    }

    /// Returns the number of messages in a queue, visible or in flight.
    #[must_use]
    pub fn depth(&self, name: &str) -> usize {
        self.queues.get(name).map_or(0, |queue| {
            let queue = queue.lock();
            queue.visible.len() + queue.in_flight.len()
        })
    }

    fn queue(&self, handle: &QueueHandle) -> Result<Arc<Mutex<MemoryQueue>>, QueueError> {
        self.queues
            .get(&handle.name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| QueueError::not_found(&handle.name))
    }
}

#[async_trait]
impl QueueService for InMemoryQueueService {
    async fn get_queue(&self, name: &str) -> Result<Option<QueueHandle>, QueueError> {
        if self.fail_lookups.load(Ordering::SeqCst) {
            return Err(QueueError::service(name, "injected lookup failure"));
        }
        Ok(self.queues.get(name).map(|queue| queue.lock().handle.clone()))
    }

    async fn create_queue(
        &self,
        name: &str,
        attributes: &QueueAttributes,
    ) -> Result<QueueHandle, QueueError> {
        if name.is_empty() || name.len() > MAX_QUEUE_NAME_LEN {
            return Err(QueueError::service(name, "queue name must be 1-80 characters"));
        }
        if attributes.fifo != name.ends_with(QUEUE_SUFFIX) {
            return Err(QueueError::service(
                name,
                "ordered queue names must end with `.fifo`, and only those",
            ));
        }

        let entry = self.queues.entry(name.to_string()).or_insert_with(|| {
            let handle = QueueHandle::new(name, format!("memory://{name}"));
            Arc::new(Mutex::new(MemoryQueue::new(handle, attributes.clone())))
        });
        let handle = entry.lock().handle.clone();
        Ok(handle)
    }

    async fn receive(
        &self,
        queue: &QueueHandle,
        max_messages: usize,
    ) -> Result<Vec<RawMessage>, QueueError> {
        let queue = self.queue(queue)?;
        let mut queue = queue.lock();
        let now = Utc::now();
        queue.restore_expired(now);

        let invisible_until =
            now + ChronoDuration::seconds(i64::from(queue.attributes.visibility_timeout_seconds));
        let count = max_messages.min(queue.visible.len());
        let mut received = Vec::with_capacity(count);

        for _ in 0..count {
            let Some(msg) = queue.visible.pop_front() else {
                break;
            };
            let receipt_handle = Uuid::new_v4().to_string();
            received.push(RawMessage {
                queue: queue.handle.clone(),
                message_id: msg.message_id.clone(),
                receipt_handle: receipt_handle.clone(),
                body: msg.body.clone(),
                sent_at: msg.sent_at,
            });
            queue.in_flight.insert(receipt_handle, (msg, invisible_until));
        }

        Ok(received)
    }

    async fn delete_message(&self, message: &RawMessage) -> Result<(), QueueError> {
        let queue = self.queue(&message.queue)?;
        queue.lock().in_flight.remove(&message.receipt_handle);
        Ok(())
    }

    async fn send(&self, queue: &QueueHandle, message: OutgoingMessage) -> Result<(), QueueError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(QueueError::service(&queue.name, "injected send failure"));
        }

        let queue = self.queue(queue)?;
        let mut queue = queue.lock();
        let now = Utc::now();

        let window = ChronoDuration::minutes(DEDUP_WINDOW_MINUTES);
        queue.seen_dedup_ids.retain(|_, seen_at| now - *seen_at < window);
        if queue.seen_dedup_ids.contains_key(&message.dedup_id) {
            return Ok(());
        }
        queue.seen_dedup_ids.insert(message.dedup_id, now);

        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        queue.visible.push_back(StoredMessage {
            sequence,
            message_id: Uuid::new_v4().to_string(),
            body: message.body,
            sent_at: now,
        });
        Ok(())
    }

    async fn list_queues(&self, prefix: &str) -> Result<Vec<QueueHandle>, QueueError> {
        let mut handles: Vec<QueueHandle> = self
            .queues
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| entry.value().lock().handle.clone())
            .collect();
        handles.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(handles)
    }

    async fn delete_queue(&self, queue: &QueueHandle) -> Result<(), QueueError> {
        self.queues
            .remove(&queue.name)
            .map(|_| ())
            .ok_or_else(|| QueueError::not_found(&queue.name))
    }

    async fn purge_queue(&self, queue: &QueueHandle) -> Result<(), QueueError> {
        let queue = self.queue(queue)?;
        let mut queue = queue.lock();
        queue.visible.clear();
        queue.in_flight.clear();
        Ok(())
    }
}
