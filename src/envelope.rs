//! Envelopes and topics.
//!
//! An [`Envelope`] carries a [`RawEvent`] through the queue system together
//! with its retry bookkeeping. Envelopes are values: the retry router never
//! edits one in place, it derives a successor with [`Envelope::retried`] or
//! [`Envelope::dead_lettered`] and publishes that instead.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

use crate::event::RawEvent;

/// A named logical channel, mapped by each backend to its native resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Topic(Arc<str>);

impl Topic {
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(Arc::from(name.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The three topics of one domain, resolved once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicSet {
    pub raw: Topic,
    pub retry: Topic,
    pub dlq: Topic,
}

impl TopicSet {
    /// `<domain>.notifications.{raw,retry,dlq}`
    pub fn for_domain(domain: &str) -> Self {
        Self {
            raw: Topic::new(format!("{}.notifications.raw", domain)),
            retry: Topic::new(format!("{}.notifications.retry", domain)),
            dlq: Topic::new(format!("{}.notifications.dlq", domain)),
        }
    }

    pub fn all(&self) -> [&Topic; 3] {
        [&self.raw, &self.retry, &self.dlq]
    }
}

/// Why the last processing attempt of an envelope failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureRecord {
    /// Pipeline stage that failed
    pub stage: String,

    /// Error taxonomy name (e.g. "ParseError", "TransientProviderError")
    pub kind: String,

    /// Human-readable detail
    pub message: String,

    pub failed_at: DateTime<Utc>,
}

impl FailureRecord {
    pub fn new(stage: impl Into<String>, kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            kind: kind.into(),
            message: message.into(),
            failed_at: Utc::now(),
        }
    }
}

impl fmt::Display for FailureRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} in {}: {}", self.kind, self.stage, self.message)
    }
}

/// A raw event plus the retry bookkeeping that travels with it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Logical id, shared by every successor of the same intake
    id: Uuid,
    attempt: u32,
    first_enqueued_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_error: Option<FailureRecord>,
    topic: String,
    event: RawEvent,
}

impl Envelope {
    /// First envelope of an event, attempt 0.
    pub fn new(event: RawEvent, topic: &Topic) -> Self {
        Self {
            id: Uuid::new_v4(),
            attempt: 0,
            first_enqueued_at: Utc::now(),
            last_error: None,
            topic: topic.to_string(),
            event,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn first_enqueued_at(&self) -> DateTime<Utc> {
        self.first_enqueued_at
    }

    pub fn last_error(&self) -> Option<&FailureRecord> {
        self.last_error.as_ref()
    }

    /// Topic this envelope was published to.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn event(&self) -> &RawEvent {
        &self.event
    }

    /// Successor for the retry topic: attempt + 1, failure attached.
    pub fn retried(&self, failure: FailureRecord, retry_topic: &Topic) -> Self {
        Self {
            attempt: self.attempt.saturating_add(1),
            last_error: Some(failure),
            topic: retry_topic.to_string(),
            ..self.clone()
        }
    }

    /// Successor for the DLQ: attempt unchanged, failure attached.
    pub fn dead_lettered(&self, failure: FailureRecord, dlq_topic: &Topic) -> Self {
        Self {
            last_error: Some(failure),
            topic: dlq_topic.to_string(),
            ..self.clone()
        }
    }

    /// Successor for a manual replay out of the DLQ: attempt reset to 0.
    ///
    /// The logical id and last error are kept so the dedupe claim resumes and
    /// the history stays visible.
    pub fn replayed(&self, raw_topic: &Topic) -> Self {
        Self {
            attempt: 0,
            topic: raw_topic.to_string(),
            ..self.clone()
        }
    }

    /// Encode for a transport message body.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Decode a transport message body.
    ///
    /// A body that is not a valid envelope is wrapped into a fresh envelope
    /// whose raw event carries the original bytes, so the parse stage can
    /// reject it and the router can dead-letter it. Nothing is dropped here.
    pub fn from_wire(topic: &Topic, body: &[u8]) -> Self {
        match serde_json::from_slice::<Envelope>(body) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(topic = %topic, error = %e, "Undecodable message body");
                Self::new(RawEvent::undecodable(body, &e.to_string()), topic)
            }
        }
    }
}
