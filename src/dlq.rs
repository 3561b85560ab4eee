//! Dead-letter operations.
//!
//! The DLQ is an ordinary topic; the router publishes envelopes there with
//! their last failure attached. [`DeadLetterQueue`] lets an operator look at
//! those envelopes and replay them onto the raw topic.
//!
//! # Example
//!
//! ```rust,ignore
//! let dlq = DeadLetterQueue::new(queue, topics);
//! for entry in dlq.list(10).await? {
//!     println!("{}", entry.summary());
//! }
//! let replayed = dlq.replay(10).await?;
//! ```

use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::envelope::{Envelope, TopicSet};
use crate::queue::{AckHandle, MessageId, SharedQueue, TransportError};

/// How long each receive round waits for DLQ messages.
const RECEIVE_WAIT: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum DlqError {
    #[error("failed to read dead-letter topic: {0}")]
    Receive(#[source] TransportError),

    #[error("failed to republish {envelope_id} to the raw topic: {source}")]
    Republish {
        envelope_id: String,
        #[source]
        source: TransportError,
    },
}

/// One dead-lettered envelope.
#[derive(Debug, Clone)]
pub struct DlqEntry {
    pub message_id: MessageId,
    pub envelope: Envelope,
}

impl DlqEntry {
    /// Operator-facing view: ids, failure and the raw payload.
    pub fn summary(&self) -> Value {
        let envelope = &self.envelope;
        let event = envelope.event();
        json!({
            "messageId": self.message_id.to_string(),
            "envelopeId": envelope.id().to_string(),
            "attempt": envelope.attempt(),
            "firstEnqueuedAt": envelope.first_enqueued_at().to_rfc3339(),
            "error": envelope.last_error(),
            "provider": event.provider,
            "subject": event.subject,
            "collection": event.collection,
            "occurredAt": event.occurred_at,
            "payload": event.payload,
        })
    }
}

#[derive(Clone)]
pub struct DeadLetterQueue {
    queue: SharedQueue,
    topics: TopicSet,
}

impl DeadLetterQueue {
    pub fn new(queue: SharedQueue, topics: TopicSet) -> Self {
        Self { queue, topics }
    }

    /// Messages waiting on the DLQ, when the backend can tell.
    pub async fn count(&self) -> Option<u64> {
        self.queue.depth(&self.topics.dlq).await
    }

    /// Receive up to `limit` DLQ messages, keeping them in flight.
    async fn take(&self, limit: usize) -> Result<Vec<(DlqEntry, AckHandle)>, DlqError> {
        let mut taken = Vec::new();
        while taken.len() < limit {
            let batch = self
                .queue
                .receive(&self.topics.dlq, limit - taken.len(), RECEIVE_WAIT)
                .await
                .map_err(DlqError::Receive)?;
            if batch.is_empty() {
                break;
            }
            taken.extend(batch.into_iter().map(|d| {
                (
                    DlqEntry {
                        message_id: d.handle.message_id.clone(),
                        envelope: d.envelope,
                    },
                    d.handle,
                )
            }));
        }
        Ok(taken)
    }

    async fn release(&self, handles: impl DoubleEndedIterator<Item = &AckHandle>) {
        // Newest first, so head-of-queue backends keep the original order.
        for handle in handles.rev() {
            if let Err(e) = self.queue.nack(handle).await {
                warn!(message_id = %handle.message_id, error = %e, "Failed to release DLQ message");
            }
        }
    }

    /// Look at up to `limit` DLQ entries without consuming them.
    pub async fn list(&self, limit: usize) -> Result<Vec<DlqEntry>, DlqError> {
        let taken = self.take(limit).await?;
        self.release(taken.iter().map(|(_, handle)| handle)).await;

        debug!(count = taken.len(), "Listed DLQ entries");
        Ok(taken.into_iter().map(|(entry, _)| entry).collect())
    }

    /// Move up to `limit` DLQ entries back to the raw topic with attempt 0.
    ///
    /// Each entry is acked on the DLQ only after its replay was published. On
    /// a publish failure the remaining entries are released and the error is
    /// returned; entries replayed before it stay replayed.
    pub async fn replay(&self, limit: usize) -> Result<Vec<DlqEntry>, DlqError> {
        let taken = self.take(limit).await?;
        let mut replayed = Vec::with_capacity(taken.len());

        for (i, (entry, handle)) in taken.iter().enumerate() {
            let fresh = entry.envelope.replayed(&self.topics.raw);

            if let Err(source) = self.queue.publish(&self.topics.raw, &fresh).await {
                error!(envelope_id = %fresh.id(), error = %source, "Replay publish failed");
                self.release(taken[i..].iter().map(|(_, h)| h)).await;
                return Err(DlqError::Republish {
                    envelope_id: fresh.id().to_string(),
                    source,
                });
            }

            if let Err(e) = self.queue.ack(handle).await {
                // Already on the raw topic; the DLQ copy may show up again.
                warn!(message_id = %handle.message_id, error = %e, "Failed to ack replayed DLQ message");
            }

            info!(
                envelope_id = %fresh.id(),
                previous_attempt = entry.envelope.attempt(),
                "Replayed DLQ entry"
            );
            replayed.push(entry.clone());
        }

        Ok(replayed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::FailureRecord;
    use crate::event::RawEvent;
    use crate::queue::{MemoryQueue, QueueBackend};
    use serde_json::json;
    use std::sync::Arc;

    async fn seeded(count: usize) -> (Arc<MemoryQueue>, TopicSet, Vec<Envelope>) {
        let queue = Arc::new(MemoryQueue::default());
        let topics = TopicSet::for_domain("fitbit");
        let mut envelopes = Vec::new();
        for i in 0..count {
            let event = RawEvent::new("fitbit", "42", "sleep", format!("2026-02-0{}", i + 1), json!({"n": i}));
            let envelope = Envelope::new(event, &topics.raw)
                .retried(FailureRecord::new("fetch_details", "TransientProviderError", "503"), &topics.retry)
                .dead_lettered(FailureRecord::new("fetch_details", "AuthError", "revoked"), &topics.dlq);
            queue.publish(&topics.dlq, &envelope).await.unwrap();
            envelopes.push(envelope);
        }
        (queue, topics, envelopes)
    }

    #[tokio::test]
    async fn test_list_is_non_destructive() {
        let (queue, topics, envelopes) = seeded(3).await;
        let dlq = DeadLetterQueue::new(queue.clone(), topics.clone());

        let listed = dlq.list(2).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].envelope, envelopes[0]);
        assert_eq!(listed[1].envelope, envelopes[1]);

        assert_eq!(queue.len(&topics.dlq), 3);
        assert_eq!(queue.in_flight(&topics.dlq), 0);
        assert_eq!(dlq.count().await, Some(3));

        // Order survives the release.
        let again = dlq.list(3).await.unwrap();
        assert_eq!(
            again.iter().map(|e| e.envelope.id()).collect::<Vec<_>>(),
            envelopes.iter().map(Envelope::id).collect::<Vec<_>>()
        );
    }

    #[tokio::test]
    async fn test_replay_resets_attempt() {
        let (queue, topics, envelopes) = seeded(2).await;
        let dlq = DeadLetterQueue::new(queue.clone(), topics.clone());

        let replayed = dlq.replay(10).await.unwrap();
        assert_eq!(replayed.len(), 2);
        assert!(queue.is_empty(&topics.dlq));
        assert_eq!(queue.in_flight(&topics.dlq), 0);

        let raw = queue
            .receive(&topics.raw, 10, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(raw.len(), 2);
        let first = &raw[0].envelope;
        assert_eq!(first.attempt(), 0);
        assert_eq!(first.id(), envelopes[0].id());
        assert_eq!(first.topic(), topics.raw.as_str());
        assert_eq!(first.last_error().unwrap().kind, "AuthError");
        assert_eq!(first.event(), envelopes[0].event());
    }

    #[tokio::test]
    async fn test_summary_exposes_failure_and_payload() {
        let (queue, topics, _) = seeded(1).await;
        let entry = DeadLetterQueue::new(queue, topics).list(1).await.unwrap().remove(0);

        let summary = entry.summary();
        assert_eq!(summary["attempt"], 1);
        assert_eq!(summary["error"]["kind"], "AuthError");
        assert_eq!(summary["payload"]["n"], 0);
    }

    #[tokio::test]
    async fn test_empty_dlq() {
        let queue = Arc::new(MemoryQueue::default());
        let dlq = DeadLetterQueue::new(queue, TopicSet::for_domain("fitbit"));
        assert!(dlq.list(5).await.unwrap().is_empty());
        assert!(dlq.replay(5).await.unwrap().is_empty());
    }
}
