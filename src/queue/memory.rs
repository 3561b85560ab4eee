//! In-memory queue backend.
//!
//! One FIFO per topic, living in process memory. Nothing survives a restart,
//! so this backend is meant for development, tests and the init fallback.
//! Single consumer per topic.
//!
//! Received messages move to an in-flight table until acked. A nack, or a
//! visibility timeout running out, puts them back at the head of the topic.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use super::{AckHandle, BackendKind, Delivery, MessageId, QueueBackend, TransportError};
use crate::envelope::{Envelope, Topic};

/// Default time a delivery stays invisible before it is handed out again.
pub const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
struct StoredMessage {
    seq: u64,
    body: Vec<u8>,
}

#[derive(Debug, Default)]
struct TopicState {
    ready: VecDeque<StoredMessage>,
    in_flight: HashMap<u64, (StoredMessage, Instant)>,
}

impl TopicState {
    /// Move expired in-flight messages back to the head, oldest first.
    fn requeue_expired(&mut self, now: Instant) {
        let mut expired: Vec<u64> = self
            .in_flight
            .iter()
            .filter(|(_, (_, deadline))| *deadline <= now)
            .map(|(seq, _)| *seq)
            .collect();
        if expired.is_empty() {
            return;
        }
        expired.sort_unstable_by(|a, b| b.cmp(a));
        for seq in expired {
            if let Some((message, _)) = self.in_flight.remove(&seq) {
                self.ready.push_front(message);
            }
        }
    }
}

/// Per-topic in-process FIFO queue.
pub struct MemoryQueue {
    topics: Mutex<HashMap<Topic, TopicState>>,
    published: Notify,
    next_seq: AtomicU64,
    visibility_timeout: Duration,
}

impl MemoryQueue {
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            published: Notify::new(),
            next_seq: AtomicU64::new(1),
            visibility_timeout,
        }
    }

    /// Take up to `max` ready messages and mark them in flight.
    fn take_ready(&self, topic: &Topic, max: usize) -> Vec<Delivery> {
        let now = Instant::now();
        let deadline = now + self.visibility_timeout;
        let mut topics = self.topics.lock();
        let state = topics.entry(topic.clone()).or_default();
        state.requeue_expired(now);

        let mut deliveries = Vec::new();
        while deliveries.len() < max {
            let Some(message) = state.ready.pop_front() else {
                break;
            };
            let id = MessageId(message.seq.to_string());
            deliveries.push(Delivery {
                envelope: Envelope::from_wire(topic, &message.body),
                handle: AckHandle {
                    topic: topic.clone(),
                    message_id: id.clone(),
                    receipt: id.0,
                },
            });
            state.in_flight.insert(message.seq, (message, deadline));
        }
        deliveries
    }

    fn parse_receipt(handle: &AckHandle) -> Result<u64, TransportError> {
        handle
            .receipt
            .parse()
            .map_err(|_| TransportError::UnknownHandle(handle.receipt.clone()))
    }

    /// Messages waiting on a topic, excluding in-flight ones.
    pub fn len(&self, topic: &Topic) -> usize {
        self.topics.lock().get(topic).map_or(0, |s| s.ready.len())
    }

    pub fn is_empty(&self, topic: &Topic) -> bool {
        self.len(topic) == 0
    }

    /// Messages handed out but not yet acked.
    pub fn in_flight(&self, topic: &Topic) -> usize {
        self.topics.lock().get(topic).map_or(0, |s| s.in_flight.len())
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new(DEFAULT_VISIBILITY_TIMEOUT)
    }
}

#[async_trait]
impl QueueBackend for MemoryQueue {
    fn kind(&self) -> BackendKind {
        BackendKind::Memory
    }

    async fn publish(&self, topic: &Topic, envelope: &Envelope) -> Result<MessageId, TransportError> {
        let body = envelope.to_bytes()?;
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        self.topics
            .lock()
            .entry(topic.clone())
            .or_default()
            .ready
            .push_back(StoredMessage { seq, body });
        self.published.notify_waiters();

        debug!(topic = %topic, seq = seq, "Published to memory queue");
        Ok(MessageId(seq.to_string()))
    }

    async fn receive(
        &self,
        topic: &Topic,
        max_messages: usize,
        wait: Duration,
    ) -> Result<Vec<Delivery>, TransportError> {
        let give_up = Instant::now() + wait;
        loop {
            // Register interest before checking so a publish in between is not missed.
            let published = self.published.notified();
            tokio::pin!(published);
            published.as_mut().enable();

            let batch = self.take_ready(topic, max_messages);
            if !batch.is_empty() {
                return Ok(batch);
            }

            let now = Instant::now();
            if now >= give_up {
                return Ok(Vec::new());
            }

            // Wake up for the earliest visibility deadline as well.
            let next_expiry = self
                .topics
                .lock()
                .get(topic)
                .and_then(|s| s.in_flight.values().map(|(_, d)| *d).min());
            let wake_at = next_expiry.map_or(give_up, |d| d.min(give_up));

            let _ = tokio::time::timeout_at(wake_at, published).await;
        }
    }

    async fn ack(&self, handle: &AckHandle) -> Result<(), TransportError> {
        let seq = Self::parse_receipt(handle)?;
        let mut topics = self.topics.lock();
        let removed = topics
            .get_mut(&handle.topic)
            .and_then(|s| s.in_flight.remove(&seq));
        match removed {
            Some(_) => Ok(()),
            None => Err(TransportError::UnknownHandle(handle.receipt.clone())),
        }
    }

    async fn nack(&self, handle: &AckHandle) -> Result<(), TransportError> {
        let seq = Self::parse_receipt(handle)?;
        {
            let mut topics = self.topics.lock();
            let state = topics
                .get_mut(&handle.topic)
                .ok_or_else(|| TransportError::UnknownHandle(handle.receipt.clone()))?;
            let (message, _) = state
                .in_flight
                .remove(&seq)
                .ok_or_else(|| TransportError::UnknownHandle(handle.receipt.clone()))?;
            state.ready.push_front(message);
        }
        self.published.notify_waiters();
        Ok(())
    }

    async fn depth(&self, topic: &Topic) -> Option<u64> {
        Some(self.len(topic) as u64)
    }
}
