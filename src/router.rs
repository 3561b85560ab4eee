//! Retry/DLQ router.
//!
//! Decides where a failed delivery goes next and makes it so:
//!
//! ```text
//! failed delivery (stage, error)
//!     │
//!     ├─ retryable and attempt < max_retries ──▶ retry topic (attempt + 1)
//!     │
//!     └─ otherwise ─────────────────────────────▶ DLQ (attempt unchanged)
//! ```
//!
//! The successor envelope is published first and the original acked only
//! after that succeeded. If the publish fails the original is nacked instead,
//! so the message is redelivered rather than lost.
//!
//! An optional backoff delays the retry publish. The wait is bounded by
//! [`RetryRouter::with_max_backoff`] and cut short by the shutdown signal, so
//! a stopping worker still settles its in-flight delivery promptly.

use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::envelope::{FailureRecord, TopicSet};
use crate::pipeline::StageError;
use crate::queue::{Delivery, MessageId, SharedQueue, TransportError};
use crate::shutdown::ShutdownSignal;

/// Upper bound of the backoff multiplier.
const MAX_BACKOFF_FACTOR: u32 = 32;

#[derive(Error, Debug)]
pub enum RouterError {
    /// Successor could not be published; the original was nacked.
    #[error("failed to publish to {topic}: {source}")]
    Republish {
        topic: String,
        #[source]
        source: TransportError,
    },

    /// Successor published but the original could not be acked.
    #[error("failed to ack original delivery {message_id}: {source}")]
    Ack {
        message_id: String,
        #[source]
        source: TransportError,
    },
}

/// Where a failed delivery went.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteDecision {
    Retried { attempt: u32, message_id: MessageId },
    DeadLettered { message_id: MessageId },
}

impl RouteDecision {
    pub fn is_dead_lettered(&self) -> bool {
        matches!(self, RouteDecision::DeadLettered { .. })
    }
}

pub struct RetryRouter {
    queue: SharedQueue,
    topics: TopicSet,
    max_retries: u32,
    retry_backoff: Duration,
    max_backoff: Option<Duration>,
    shutdown: Option<ShutdownSignal>,
}

impl RetryRouter {
    pub fn new(queue: SharedQueue, topics: TopicSet, max_retries: u32) -> Self {
        Self {
            queue,
            topics,
            max_retries,
            retry_backoff: Duration::ZERO,
            max_backoff: None,
            shutdown: None,
        }
    }

    /// Delay retries by `base * 2^attempt`. Zero disables the delay.
    pub fn with_retry_backoff(mut self, base: Duration) -> Self {
        self.retry_backoff = base;
        self
    }

    /// Ceiling for a single backoff wait.
    pub fn with_max_backoff(mut self, max: Duration) -> Self {
        self.max_backoff = Some(max);
        self
    }

    /// Stop waiting out a backoff once `shutdown` fires.
    pub fn with_shutdown(mut self, shutdown: ShutdownSignal) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// True when the failure goes to the retry topic.
    pub fn should_retry(&self, error: &StageError, attempt: u32) -> bool {
        error.is_retryable() && attempt < self.max_retries
    }

    fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 2u32
            .checked_pow(attempt)
            .unwrap_or(MAX_BACKOFF_FACTOR)
            .min(MAX_BACKOFF_FACTOR);
        let backoff = self.retry_backoff.saturating_mul(factor);
        match self.max_backoff {
            Some(max) => backoff.min(max),
            None => backoff,
        }
    }

    async fn wait_backoff(&self, backoff: Duration) {
        match &self.shutdown {
            Some(shutdown) => {
                tokio::select! {
                    _ = shutdown.recv() => {
                        debug!(backoff_ms = backoff.as_millis() as u64, "Backoff cut short by shutdown");
                    }
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
            None => tokio::time::sleep(backoff).await,
        }
    }

    /// Publish the successor of a failed delivery and settle the original.
    pub async fn route(
        &self,
        delivery: &Delivery,
        stage: &str,
        error: &StageError,
    ) -> Result<RouteDecision, RouterError> {
        let envelope = &delivery.envelope;
        let failure = FailureRecord::new(stage, error.kind(), error.to_string());
        let retry = self.should_retry(error, envelope.attempt());

        let (topic, successor) = if retry {
            (&self.topics.retry, envelope.retried(failure, &self.topics.retry))
        } else {
            (&self.topics.dlq, envelope.dead_lettered(failure, &self.topics.dlq))
        };

        if retry && !self.retry_backoff.is_zero() {
            self.wait_backoff(self.backoff_for(envelope.attempt())).await;
        }

        let message_id = match self.queue.publish(topic, &successor).await {
            Ok(id) => id,
            Err(source) => {
                error!(
                    envelope_id = %envelope.id(),
                    topic = %topic,
                    error = %source,
                    "Republish failed, releasing original delivery"
                );
                if let Err(e) = self.queue.nack(&delivery.handle).await {
                    warn!(message_id = %delivery.handle.message_id, error = %e, "Nack failed");
                }
                return Err(RouterError::Republish {
                    topic: topic.to_string(),
                    source,
                });
            }
        };

        self.queue
            .ack(&delivery.handle)
            .await
            .map_err(|source| RouterError::Ack {
                message_id: delivery.handle.message_id.to_string(),
                source,
            })?;

        if retry {
            info!(
                envelope_id = %envelope.id(),
                stage = stage,
                kind = error.kind(),
                attempt = successor.attempt(),
                max_retries = self.max_retries,
                "Scheduled retry"
            );
            Ok(RouteDecision::Retried {
                attempt: successor.attempt(),
                message_id,
            })
        } else {
            warn!(
                envelope_id = %envelope.id(),
                stage = stage,
                kind = error.kind(),
                attempt = envelope.attempt(),
                error = %error,
                "Dead-lettered"
            );
            Ok(RouteDecision::DeadLettered { message_id })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{Envelope, Topic};
    use crate::event::RawEvent;
    use crate::queue::{AckHandle, BackendKind, MemoryQueue, QueueBackend};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Arc;

    fn topics() -> TopicSet {
        TopicSet::for_domain("fitbit")
    }

    async fn delivered(queue: &Arc<MemoryQueue>, envelope: Envelope) -> Delivery {
        let topic = Topic::new(envelope.topic());
        queue.publish(&topic, &envelope).await.unwrap();
        queue
            .receive(&topic, 1, Duration::from_millis(10))
            .await
            .unwrap()
            .remove(0)
    }

    fn raw_envelope() -> Envelope {
        Envelope::new(
            RawEvent::new("fitbit", "42", "activities", "2026-02-01", json!({})),
            &topics().raw,
        )
    }

    #[tokio::test]
    async fn test_retryable_goes_to_retry_topic() {
        let queue = Arc::new(MemoryQueue::default());
        let router = RetryRouter::new(queue.clone(), topics(), 3);
        let delivery = delivered(&queue, raw_envelope()).await;

        let decision = router
            .route(&delivery, "fetch_details", &StageError::TransientProvider("503".into()))
            .await
            .unwrap();

        assert!(matches!(decision, RouteDecision::Retried { attempt: 1, .. }));
        assert_eq!(queue.len(&topics().retry), 1);
        assert_eq!(queue.len(&topics().dlq), 0);
        assert_eq!(queue.in_flight(&topics().raw), 0);

        let retried = queue
            .receive(&topics().retry, 1, Duration::from_millis(10))
            .await
            .unwrap()
            .remove(0)
            .envelope;
        assert_eq!(retried.attempt(), 1);
        assert_eq!(retried.id(), delivery.envelope.id());
        assert_eq!(retried.last_error().unwrap().kind, "TransientProviderError");
        assert_eq!(retried.last_error().unwrap().stage, "fetch_details");
    }

    #[tokio::test]
    async fn test_non_retryable_goes_to_dlq() {
        let queue = Arc::new(MemoryQueue::default());
        let router = RetryRouter::new(queue.clone(), topics(), 3);
        let delivery = delivered(&queue, raw_envelope()).await;

        let decision = router
            .route(&delivery, "parse", &StageError::Parse("bad date".into()))
            .await
            .unwrap();

        assert!(decision.is_dead_lettered());
        assert_eq!(queue.len(&topics().retry), 0);
        let dead = queue
            .receive(&topics().dlq, 1, Duration::from_millis(10))
            .await
            .unwrap()
            .remove(0)
            .envelope;
        assert_eq!(dead.attempt(), 0);
        assert_eq!(dead.last_error().unwrap().kind, "ParseError");
        assert_eq!(dead.event(), delivery.envelope.event());
    }

    #[tokio::test]
    async fn test_exhausted_budget_goes_to_dlq() {
        let queue = Arc::new(MemoryQueue::default());
        let router = RetryRouter::new(queue.clone(), topics(), 2);

        let mut envelope = raw_envelope();
        for _ in 0..2 {
            envelope = envelope.retried(
                FailureRecord::new("persist", "TransientStoreError", "busy"),
                &topics().retry,
            );
        }
        let delivery = delivered(&queue, envelope).await;

        let decision = router
            .route(&delivery, "persist", &StageError::TransientStore("busy".into()))
            .await
            .unwrap();
        assert!(decision.is_dead_lettered());
        assert_eq!(queue.len(&topics().dlq), 1);
    }

    #[test]
    fn test_zero_max_retries_never_retries() {
        let router = RetryRouter::new(Arc::new(MemoryQueue::default()), topics(), 0);
        assert!(!router.should_retry(&StageError::TransientProvider("x".into()), 0));
    }

    #[test]
    fn test_backoff_is_capped() {
        let router = RetryRouter::new(Arc::new(MemoryQueue::default()), topics(), 3)
            .with_retry_backoff(Duration::from_millis(100));
        assert_eq!(router.backoff_for(0), Duration::from_millis(100));
        assert_eq!(router.backoff_for(3), Duration::from_millis(800));
        assert_eq!(router.backoff_for(10), Duration::from_millis(3200));
        assert_eq!(router.backoff_for(40), Duration::from_millis(3200));
    }

    #[test]
    fn test_backoff_respects_ceiling() {
        let router = RetryRouter::new(Arc::new(MemoryQueue::default()), topics(), 3)
            .with_retry_backoff(Duration::from_millis(100))
            .with_max_backoff(Duration::from_millis(250));
        assert_eq!(router.backoff_for(0), Duration::from_millis(100));
        assert_eq!(router.backoff_for(2), Duration::from_millis(250));
        assert_eq!(router.backoff_for(10), Duration::from_millis(250));
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_backoff() {
        let queue = Arc::new(MemoryQueue::default());
        let shutdown = ShutdownSignal::new();
        let router = RetryRouter::new(queue.clone(), topics(), 3)
            .with_retry_backoff(Duration::from_secs(600))
            .with_shutdown(shutdown.clone());
        let delivery = delivered(&queue, raw_envelope()).await;

        let trigger = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.trigger();
        });

        let decision = tokio::time::timeout(
            Duration::from_secs(5),
            router.route(&delivery, "fetch_details", &StageError::TransientProvider("429".into())),
        )
        .await
        .expect("backoff should end on shutdown")
        .unwrap();

        assert!(matches!(decision, RouteDecision::Retried { attempt: 1, .. }));
        assert_eq!(queue.len(&topics().retry), 1);
        assert_eq!(queue.in_flight(&topics().raw), 0);
    }

    /// Delegates to a memory queue but refuses publishes to one topic.
    struct BrokenTopic {
        inner: Arc<MemoryQueue>,
        broken: Topic,
    }

    #[async_trait]
    impl QueueBackend for BrokenTopic {
        fn kind(&self) -> BackendKind {
            BackendKind::Memory
        }

        async fn publish(&self, topic: &Topic, envelope: &Envelope) -> Result<MessageId, TransportError> {
            if *topic == self.broken {
                return Err(TransportError::Unreachable("connection reset".into()));
            }
            self.inner.publish(topic, envelope).await
        }

        async fn receive(
            &self,
            topic: &Topic,
            max_messages: usize,
            wait: Duration,
        ) -> Result<Vec<Delivery>, TransportError> {
            self.inner.receive(topic, max_messages, wait).await
        }

        async fn ack(&self, handle: &AckHandle) -> Result<(), TransportError> {
            self.inner.ack(handle).await
        }

        async fn nack(&self, handle: &AckHandle) -> Result<(), TransportError> {
            self.inner.nack(handle).await
        }
    }

    #[tokio::test]
    async fn test_failed_republish_keeps_original() {
        let inner = Arc::new(MemoryQueue::default());
        let queue = Arc::new(BrokenTopic {
            inner: inner.clone(),
            broken: topics().retry,
        });
        let router = RetryRouter::new(queue, topics(), 3);
        let delivery = delivered(&inner, raw_envelope()).await;

        let result = router
            .route(&delivery, "fetch_details", &StageError::TransientProvider("503".into()))
            .await;

        assert!(matches!(result, Err(RouterError::Republish { .. })));
        // Nacked back onto the raw topic, not lost.
        assert_eq!(inner.len(&topics().raw), 1);
        assert_eq!(inner.in_flight(&topics().raw), 0);
        assert_eq!(inner.len(&topics().retry), 0);
    }
}
