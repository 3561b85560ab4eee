//! Queue abstraction.
//!
//! Every transport implements [`QueueBackend`]: publish, receive a batch, and
//! ack/nack individual deliveries. The backend is picked once at startup by
//! [`connect`] and shared as a [`SharedQueue`]; the pipeline never branches on
//! which one it got.
//!
//! ## Delivery guarantees
//!
//! At-least-once. A delivery that is neither acked nor nacked is handed out
//! again after a backend-defined timeout (visibility timeout, idle claim, ack
//! deadline) or after a restart. Nacking makes it available again right away.
//!
//! ## Backends
//!
//! - [`MemoryQueue`]: per-topic FIFO in process memory, for development and tests
//! - [`RedisStreamQueue`]: log-based broker on Redis Streams with consumer groups
//! - [`PubSubQueue`]: Google Cloud Pub/Sub over REST, one subscription per topic
//! - [`SqsQueue`]: Amazon SQS, URL-addressed queues with visibility timeouts

pub mod memory;
pub mod pubsub;
pub mod redis_stream;
pub mod resilient;
pub mod sigv4;
pub mod sqs;

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::QueueConfig;
use crate::envelope::{Envelope, Topic, TopicSet};

pub use memory::MemoryQueue;
pub use pubsub::PubSubQueue;
pub use redis_stream::RedisStreamQueue;
pub use resilient::ResilientQueue;
pub use sqs::SqsQueue;

/// Errors raised by queue transports.
#[derive(Error, Debug)]
pub enum TransportError {
    /// Backend settings are missing or invalid. Never retried.
    #[error("queue backend misconfigured: {0}")]
    Config(String),

    /// Backend could not be reached
    #[error("queue backend unreachable: {0}")]
    Unreachable(String),

    /// Backend answered with an error
    #[error("{backend} request failed: {message}")]
    Backend {
        backend: BackendKind,
        message: String,
    },

    /// Envelope could not be encoded for the wire
    #[error("failed to encode envelope: {0}")]
    Encode(#[from] serde_json::Error),

    /// The ack handle does not belong to a live delivery
    #[error("unknown delivery handle: {0}")]
    UnknownHandle(String),
}

impl TransportError {
    /// Whether retrying the same call later can succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TransportError::Unreachable(_) | TransportError::Backend { .. }
        )
    }
}

/// The closed set of transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
pub enum BackendKind {
    #[serde(rename = "memory")]
    Memory,
    #[serde(rename = "log-broker", alias = "redis", alias = "redis-streams", alias = "kafka")]
    LogBroker,
    #[serde(rename = "cloud-pubsub", alias = "pubsub", alias = "gcp_pubsub")]
    CloudPubSub,
    #[serde(rename = "cloud-queue", alias = "sqs", alias = "aws_sqs")]
    CloudQueue,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Memory => "memory",
            BackendKind::LogBroker => "log-broker",
            BackendKind::CloudPubSub => "cloud-pubsub",
            BackendKind::CloudQueue => "cloud-queue",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(BackendKind::Memory),
            "log-broker" | "redis" | "redis-streams" | "kafka" => Ok(BackendKind::LogBroker),
            "cloud-pubsub" | "pubsub" | "gcp_pubsub" => Ok(BackendKind::CloudPubSub),
            "cloud-queue" | "sqs" | "aws_sqs" => Ok(BackendKind::CloudQueue),
            other => Err(format!("unsupported queue backend '{}'", other)),
        }
    }
}

/// Backend-assigned id of a published message.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageId(pub String);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything a backend needs to ack or nack one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckHandle {
    pub topic: Topic,
    pub message_id: MessageId,
    /// Backend-native receipt (stream id, ack id, receipt handle, ...)
    pub receipt: String,
}

/// One received message.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub envelope: Envelope,
    pub handle: AckHandle,
}

/// Capability set shared by every transport.
///
/// Implementations must be safe to call concurrently.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Hand an envelope to the transport.
    async fn publish(&self, topic: &Topic, envelope: &Envelope) -> Result<MessageId, TransportError>;

    /// Receive up to `max_messages`, waiting at most `wait` for the first one.
    ///
    /// An empty batch means the wait elapsed with nothing to deliver.
    async fn receive(
        &self,
        topic: &Topic,
        max_messages: usize,
        wait: Duration,
    ) -> Result<Vec<Delivery>, TransportError>;

    /// Commit a delivery; it will not be handed out again.
    async fn ack(&self, handle: &AckHandle) -> Result<(), TransportError>;

    /// Release a delivery for immediate redelivery.
    async fn nack(&self, handle: &AckHandle) -> Result<(), TransportError>;

    /// Approximate number of messages waiting on a topic, when the backend knows.
    async fn depth(&self, _topic: &Topic) -> Option<u64> {
        None
    }

    /// Release connections. Called once on shutdown.
    async fn close(&self) {}
}

/// The process-wide queue handle, owned by the binary and injected everywhere.
pub type SharedQueue = Arc<dyn QueueBackend>;

/// Knobs for a [`Consumer`].
#[derive(Debug, Clone, Copy)]
pub struct ConsumeOptions {
    pub batch_size: usize,
    pub wait: Duration,
}

impl Default for ConsumeOptions {
    fn default() -> Self {
        Self {
            batch_size: 25,
            wait: Duration::from_secs(2),
        }
    }
}

/// Lazy, restartable sequence of deliveries from one topic.
///
/// Fetches a batch at a time and hands deliveries out one by one. Dropping a
/// consumer with buffered deliveries does not lose them: they were never
/// acked and will be redelivered. Call [`Consumer::release`] to hand them back
/// right away instead.
pub struct Consumer {
    queue: SharedQueue,
    topic: Topic,
    options: ConsumeOptions,
    buffered: VecDeque<Delivery>,
}

impl Consumer {
    pub fn new(queue: SharedQueue, topic: Topic, options: ConsumeOptions) -> Self {
        Self {
            queue,
            topic,
            options,
            buffered: VecDeque::new(),
        }
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    /// Next buffered delivery, or one receive round if the buffer is empty.
    ///
    /// Returns `Ok(None)` when the round came back empty.
    pub async fn poll(&mut self) -> Result<Option<Delivery>, TransportError> {
        self.poll_with_wait(self.options.wait).await
    }

    /// [`poll`](Self::poll) with a one-off wait instead of the configured one.
    pub async fn poll_with_wait(&mut self, wait: Duration) -> Result<Option<Delivery>, TransportError> {
        if self.buffered.is_empty() {
            let batch = self
                .queue
                .receive(&self.topic, self.options.batch_size.max(1), wait)
                .await?;
            self.buffered.extend(batch);
        }
        Ok(self.buffered.pop_front())
    }

    /// Suspend until the next delivery arrives.
    pub async fn next(&mut self) -> Result<Delivery, TransportError> {
        loop {
            if let Some(delivery) = self.poll().await? {
                return Ok(delivery);
            }
        }
    }

    /// Number of deliveries fetched but not yet handed out.
    pub fn buffered(&self) -> usize {
        self.buffered.len()
    }

    /// Nack every buffered delivery so other consumers can pick them up.
    pub async fn release(&mut self) {
        while let Some(delivery) = self.buffered.pop_front() {
            if let Err(e) = self.queue.nack(&delivery.handle).await {
                warn!(
                    topic = %self.topic,
                    message_id = %delivery.handle.message_id,
                    error = %e,
                    "Failed to release buffered delivery"
                );
            }
        }
    }
}

/// Start consuming a topic.
pub fn consume(queue: &SharedQueue, topic: &Topic, options: ConsumeOptions) -> Consumer {
    Consumer::new(queue.clone(), topic.clone(), options)
}

/// Build the configured backend.
///
/// If it fails to initialize and `fallback_to_memory` is set, the in-memory
/// backend is used instead and a warning is logged. Otherwise the error is
/// returned and the caller must not start.
pub async fn connect(config: &QueueConfig, topics: &TopicSet) -> Result<SharedQueue, TransportError> {
    let backend = match connect_backend(config, topics).await {
        Ok(backend) => backend,
        Err(e) if config.fallback_to_memory => {
            warn!(
                backend = %config.backend,
                error = %e,
                "Queue backend init failed, falling back to in-memory queue"
            );
            Arc::new(MemoryQueue::new(config.memory.visibility_timeout()))
        }
        Err(e) => return Err(e),
    };

    info!(backend = %backend.kind(), "Queue backend ready");

    if config.transport_retries == 0 {
        return Ok(backend);
    }

    Ok(Arc::new(ResilientQueue::new(
        backend,
        config.transport_retries,
        Duration::from_millis(config.transport_backoff_ms),
    )))
}

async fn connect_backend(config: &QueueConfig, topics: &TopicSet) -> Result<SharedQueue, TransportError> {
    let backend: SharedQueue = match config.backend {
        BackendKind::Memory => Arc::new(MemoryQueue::new(config.memory.visibility_timeout())),
        BackendKind::LogBroker => Arc::new(RedisStreamQueue::connect(&config.redis, topics).await?),
        BackendKind::CloudPubSub => Arc::new(PubSubQueue::connect(&config.pubsub, topics).await?),
        BackendKind::CloudQueue => Arc::new(SqsQueue::connect(&config.sqs, topics).await?),
    };
    Ok(backend)
}
