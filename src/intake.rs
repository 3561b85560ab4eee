//! Webhook intake adapter.
//!
//! Turns provider notifications into raw events, wraps each in an attempt-0
//! envelope and publishes it to the raw topic. The caller gets a receipt as
//! soon as the queue accepted the messages; nothing downstream runs inline.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use thiserror::Error;
use tracing::{debug, info};

use crate::envelope::{Envelope, Topic};
use crate::event::{Provider, RawEvent};
use crate::queue::{MessageId, SharedQueue, TransportError};

#[derive(Error, Debug)]
pub enum IntakeError {
    #[error("unknown provider '{0}'")]
    UnknownProvider(String),

    /// Known provider without a push flow
    #[error("{0} push notifications are not supported")]
    Unsupported(Provider),

    #[error("failed to queue notification: {0}")]
    Transport(#[from] TransportError),
}

/// What the webhook caller gets back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntakeReceipt {
    pub status: String,
    pub queued: usize,
    pub topic: String,
    pub queue_depth: Option<u64>,
    pub message_ids: Vec<String>,
}

pub struct IntakeAdapter {
    queue: SharedQueue,
    topic: Topic,
    verification_codes: HashSet<String>,
}

impl IntakeAdapter {
    /// Publish to `raw_topic`.
    pub fn new(queue: SharedQueue, raw_topic: Topic) -> Self {
        Self {
            queue,
            topic: raw_topic,
            verification_codes: HashSet::new(),
        }
    }

    /// Codes accepted by the subscriber verification handshake. Blank entries
    /// are ignored.
    pub fn with_verification_codes<I, S>(mut self, codes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.verification_codes = codes
            .into_iter()
            .map(|c| c.as_ref().trim().to_string())
            .filter(|c| !c.is_empty())
            .collect();
        self
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    pub fn is_valid_verification_code(&self, code: Option<&str>) -> bool {
        code.is_some_and(|c| !c.is_empty() && self.verification_codes.contains(c))
    }

    /// Publish one raw event as a fresh envelope.
    pub async fn submit(&self, event: RawEvent) -> Result<MessageId, IntakeError> {
        let envelope = Envelope::new(event, &self.topic);
        let id = self.queue.publish(&self.topic, &envelope).await?;
        debug!(
            envelope_id = %envelope.id(),
            message_id = %id,
            topic = %self.topic,
            "Notification queued"
        );
        Ok(id)
    }

    /// Queue a webhook body: one notification object or an array of them.
    ///
    /// Array items that are not objects are skipped; any other body queues
    /// nothing and still yields a receipt.
    pub async fn ingest(&self, provider: &str, body: &Value) -> Result<IntakeReceipt, IntakeError> {
        let provider: Provider = provider
            .parse()
            .map_err(|_| IntakeError::UnknownProvider(provider.to_string()))?;
        if provider != Provider::Fitbit {
            return Err(IntakeError::Unsupported(provider));
        }

        let notifications: Vec<&Value> = match body {
            Value::Array(items) => items.iter().filter(|item| item.is_object()).collect(),
            Value::Object(_) => vec![body],
            _ => Vec::new(),
        };

        let received_at = Utc::now();
        let mut message_ids = Vec::with_capacity(notifications.len());
        for notification in notifications {
            let event = RawEvent::from_fitbit(notification, received_at);
            message_ids.push(self.submit(event).await?.to_string());
        }

        let queue_depth = self.queue.depth(&self.topic).await;
        info!(
            provider = %provider,
            queued = message_ids.len(),
            queue_depth = ?queue_depth,
            topic = %self.topic,
            "Webhook notifications received"
        );

        Ok(IntakeReceipt {
            status: "received".to_string(),
            queued: message_ids.len(),
            topic: self.topic.to_string(),
            queue_depth,
            message_ids,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::TopicSet;
    use crate::queue::{MemoryQueue, QueueBackend};
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    fn adapter() -> (Arc<MemoryQueue>, IntakeAdapter) {
        let queue = Arc::new(MemoryQueue::default());
        let topics = TopicSet::for_domain("fitbit");
        let adapter = IntakeAdapter::new(queue.clone(), topics.raw).with_verification_codes(["abc", " ", "def "]);
        (queue, adapter)
    }

    fn notification(collection: &str) -> Value {
        json!({
            "collectionType": collection,
            "date": "2026-02-01",
            "ownerId": "228S74",
            "ownerType": "user",
            "subscriptionId": "42-all"
        })
    }

    #[tokio::test]
    async fn test_ingest_array_skips_non_objects() {
        let (queue, adapter) = adapter();
        let body = json!([notification("activities"), "junk", 7, notification("sleep")]);

        let receipt = adapter.ingest("fitbit", &body).await.unwrap();

        assert_eq!(receipt.status, "received");
        assert_eq!(receipt.queued, 2);
        assert_eq!(receipt.message_ids.len(), 2);
        assert_eq!(receipt.topic, "fitbit.notifications.raw");
        assert_eq!(receipt.queue_depth, Some(2));

        let delivered = queue
            .receive(adapter.topic(), 10, Duration::from_millis(10))
            .await
            .unwrap();
        let first = &delivered[0].envelope;
        assert_eq!(first.attempt(), 0);
        assert_eq!(first.event().subject, "42");
        assert_eq!(first.event().collection, "activities");
        assert_eq!(delivered[1].envelope.event().collection, "sleep");
    }

    #[tokio::test]
    async fn test_ingest_single_object() {
        let (_, adapter) = adapter();
        let receipt = adapter.ingest("fitbit", &notification("body")).await.unwrap();
        assert_eq!(receipt.queued, 1);
    }

    #[tokio::test]
    async fn test_ingest_scalar_body_queues_nothing() {
        let (queue, adapter) = adapter();
        let receipt = adapter.ingest("fitbit", &json!("hello")).await.unwrap();
        assert_eq!(receipt.queued, 0);
        assert!(queue.is_empty(adapter.topic()));
    }

    #[tokio::test]
    async fn test_unsupported_and_unknown_providers() {
        let (_, adapter) = adapter();
        assert!(matches!(
            adapter.ingest("google", &json!({})).await,
            Err(IntakeError::Unsupported(Provider::GoogleFit))
        ));
        assert!(matches!(
            adapter.ingest("garmin", &json!({})).await,
            Err(IntakeError::UnknownProvider(_))
        ));
    }

    #[test]
    fn test_verification_codes() {
        let (_, adapter) = adapter();
        assert!(adapter.is_valid_verification_code(Some("abc")));
        assert!(adapter.is_valid_verification_code(Some("def")));
        assert!(!adapter.is_valid_verification_code(Some("")));
        assert!(!adapter.is_valid_verification_code(Some("xyz")));
        assert!(!adapter.is_valid_verification_code(None));
    }
}
