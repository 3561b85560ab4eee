//! Transport-level retry.
//!
//! Wraps any backend and retries calls that failed with a transient
//! [`TransportError`], backing off exponentially between attempts. This is
//! where connection blips are absorbed; they never reach the pipeline's
//! retry topic.

use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

use super::{AckHandle, BackendKind, Delivery, MessageId, QueueBackend, SharedQueue, TransportError};
use crate::envelope::{Envelope, Topic};

/// Upper bound for a single backoff sleep.
const MAX_BACKOFF: Duration = Duration::from_secs(10);

pub struct ResilientQueue {
    inner: SharedQueue,
    retries: u32,
    base_delay: Duration,
}

impl ResilientQueue {
    pub fn new(inner: SharedQueue, retries: u32, base_delay: Duration) -> Self {
        Self {
            inner,
            retries,
            base_delay,
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(1 << attempt.min(6))
            .min(MAX_BACKOFF)
    }

    async fn with_retry<T, F, Fut>(&self, operation: &str, mut call: F) -> Result<T, TransportError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        let mut attempt = 0;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.retries => {
                    let delay = self.backoff(attempt);
                    warn!(
                        backend = %self.inner.kind(),
                        operation = operation,
                        attempt = attempt + 1,
                        max_retries = self.retries,
                        backoff_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient transport error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl QueueBackend for ResilientQueue {
    fn kind(&self) -> BackendKind {
        self.inner.kind()
    }

    async fn publish(&self, topic: &Topic, envelope: &Envelope) -> Result<MessageId, TransportError> {
        self.with_retry("publish", || self.inner.publish(topic, envelope))
            .await
    }

    async fn receive(
        &self,
        topic: &Topic,
        max_messages: usize,
        wait: Duration,
    ) -> Result<Vec<Delivery>, TransportError> {
        self.with_retry("receive", || self.inner.receive(topic, max_messages, wait))
            .await
    }

    async fn ack(&self, handle: &AckHandle) -> Result<(), TransportError> {
        self.with_retry("ack", || self.inner.ack(handle)).await
    }

    async fn nack(&self, handle: &AckHandle) -> Result<(), TransportError> {
        self.with_retry("nack", || self.inner.nack(handle)).await
    }

    async fn depth(&self, topic: &Topic) -> Option<u64> {
        self.inner.depth(topic).await
    }

    async fn close(&self) {
        self.inner.close().await
    }
}
