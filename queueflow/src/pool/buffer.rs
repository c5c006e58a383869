//! Funnel collecting completions from concurrent workers.

use super::CompletionCallback;
use crate::core::{TaskMeta, TaskOutcome};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;

/// One finished unit of work.
#[derive(Debug, Clone)]
pub struct Completion {
    /// The metadata the work was dispatched with.
    pub meta: TaskMeta,
    /// What the work produced.
    pub outcome: TaskOutcome,
}

/// Multi-producer buffer of completions, drained in batches by one consumer.
///
/// Every push is atomic, and a drain takes everything pushed so far in
/// completion order, so a drain never observes half an append.
#[derive(Debug)]
pub struct ResultBuffer {
    tx: mpsc::UnboundedSender<Completion>,
    rx: Mutex<mpsc::UnboundedReceiver<Completion>>,
}

impl ResultBuffer {
    /// Creates an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(rx),
        }
    }

    /// Appends a completion.
    pub fn push(&self, meta: TaskMeta, outcome: TaskOutcome) {
        // The receiver lives as long as the buffer, so sending cannot fail.
        let _ = self.tx.send(Completion { meta, outcome });
    }

    /// Takes every buffered completion, leaving the buffer empty.
    #[must_use]
    pub fn drain(&self) -> Vec<Completion> {
        let mut rx = self.rx.lock();
        let mut batch = Vec::new();
        while let Ok(completion) = rx.try_recv() {
            batch.push(completion);
        }
        batch
    }

    /// Returns a completion callback appending to this buffer.
    #[must_use]
    pub fn callback(self: &Arc<Self>) -> CompletionCallback {
        let buffer = Arc::clone(self);
        Arc::new(move |meta, outcome| buffer.push(meta, outcome))
    }
}

impl Default for ResultBuffer {
    fn default() -> Self {
        Self::new()
    }
}
