//! Queue fixtures for stage and pipeline tests.

use futures::stream::{BoxStream, StreamExt};
use serde_json::Value;
use std::time::Duration;

use crate::core::{Envelope, WireMeta, GROUP_ID};
use crate::errors::{QueueError, QueueflowError};
use crate::queue::{
    get_or_create_queue, InMemoryQueueService, OutgoingMessage, QueueAttributes, QueueHandle,
    QueueService,
};
use crate::utils::generate_dedup_id;

/// Creates `name` if needed and enqueues each value at priority 0.
pub async fn seed_queue(
    service: &dyn QueueService,
    name: &str,
    values: impl IntoIterator<Item = Value>,
) -> Result<QueueHandle, QueueError> {
    let queue = get_or_create_queue(service, name, &QueueAttributes::default()).await?;
    for value in values {
        let body = Envelope::new(WireMeta::default(), value)
            .encode()
            .map_err(|err| QueueError::service(name, err.to_string()))?;
        seed_raw(service, &queue, body).await?;
    }
    Ok(queue)
}

/// Enqueues a raw message body, bypassing envelope encoding.
pub async fn seed_raw(
    service: &dyn QueueService,
    queue: &QueueHandle,
    body: impl Into<String>,
) -> Result<(), QueueError> {
    service
        .send(
            queue,
            OutgoingMessage {
                body: body.into(),
                dedup_id: generate_dedup_id(),
                group_id: GROUP_ID.to_string(),
            },
        )
        .await
}

/// Decodes the visible messages of an in-memory queue.
///
/// Bodies that are not envelopes are skipped.
#[must_use]
pub fn queued_envelopes(service: &InMemoryQueueService, name: &str) -> Vec<Envelope> {
    service
        .visible_bodies(name)
        .iter()
        .filter_map(|body| Envelope::decode(body).ok())
        .collect()
}

/// Returns the values of the visible messages of an in-memory queue.
#[must_use]
pub fn queued_values(service: &InMemoryQueueService, name: &str) -> Vec<Value> {
    queued_envelopes(service, name)
        .into_iter()
        .map(|envelope| envelope.value)
        .collect()
}

/// Pulls up to `count` items from a stage stream.
///
/// Stops early when the stream ends, yields an error (which is included), or
/// nothing arrives within `wait`.
pub async fn take_results(
    stream: &mut BoxStream<'static, Result<Value, QueueflowError>>,
    count: usize,
    wait: Duration,
) -> Vec<Result<Value, QueueflowError>> {
    let mut results = Vec::with_capacity(count);
    while results.len() < count {
        match tokio::time::timeout(wait, stream.next()).await {
            Ok(Some(item)) => {
                let failed = item.is_err();
                results.push(item);
                if failed {
                    break;
                }
            }
            Ok(None) | Err(_) => break,
        }
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[tokio::test]
    async fn test_seed_and_read_back() {
        let service = InMemoryQueueService::new();
        let queue = seed_queue(&service, "t-s.fifo", [json!(1), json!("two")])
            .await
            .unwrap();
        seed_raw(&service, &queue, "garbage").await.unwrap();

        assert_eq!(queued_values(&service, "t-s.fifo"), vec![json!(1), json!("two")]);
        assert_eq!(service.depth("t-s.fifo"), 3);
    }

    #[tokio::test]
    async fn test_take_results_stops_at_error() {
        let items: Vec<Result<Value, QueueflowError>> = vec![
            Ok(json!(1)),
            Err(QueueError::service("q", "down").into()),
            Ok(json!(2)),
        ];
        let mut stream = futures::stream::iter(items).boxed();

        let results = take_results(&mut stream, 5, Duration::from_millis(50)).await;
        assert_eq!(results.len(), 2);
        assert!(results[1].is_err());
    }
}
