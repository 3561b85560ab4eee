//! Raw provider events.
//!
//! A [`RawEvent`] is what the intake adapter builds from one inbound provider
//! notification. It is immutable once created: retries and dead-lettering wrap
//! it in new [`Envelope`](crate::envelope::Envelope)s but never touch it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Wearable data providers known to the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    Fitbit,
    GoogleFit,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Fitbit => "fitbit",
            Provider::GoogleFit => "google_fit",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fitbit" => Ok(Provider::Fitbit),
            "google" | "google_fit" | "googlefit" => Ok(Provider::GoogleFit),
            other => Err(format!("unrecognized provider '{}'", other)),
        }
    }
}

/// A provider notification as received, before any pipeline stage ran.
///
/// # Example
///
/// ```json
/// {
///   "provider": "fitbit",
///   "subject": "42",
///   "collection": "activities",
///   "occurredAt": "2026-02-01",
///   "receivedAt": "2026-02-01T10:00:00Z",
///   "payload": {"collectionType": "activities", "date": "2026-02-01", "ownerId": "ABC", "subscriptionId": "42-activities"}
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawEvent {
    /// Provider id as sent on the wire (validated by the parse stage)
    pub provider: String,

    /// Application user the notification is about
    pub subject: String,

    /// Provider collection / category (e.g. "activities", "sleep")
    pub collection: String,

    /// Day or timestamp the data refers to
    pub occurred_at: String,

    /// When the intake adapter accepted the notification
    pub received_at: DateTime<Utc>,

    /// Untouched provider payload
    pub payload: Value,

    /// Set when the queue message body could not be decoded; `payload` then
    /// holds the body as text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decode_error: Option<String>,
}

impl RawEvent {
    pub fn new(
        provider: impl Into<String>,
        subject: impl Into<String>,
        collection: impl Into<String>,
        occurred_at: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            provider: provider.into(),
            subject: subject.into(),
            collection: collection.into(),
            occurred_at: occurred_at.into(),
            received_at: Utc::now(),
            payload,
            decode_error: None,
        }
    }

    /// Build a raw event from a Fitbit subscription notification.
    ///
    /// Missing fields become empty strings; the parse stage rejects them later
    /// so the notification still lands in the DLQ with its payload intact.
    pub fn from_fitbit(notification: &Value, received_at: DateTime<Utc>) -> Self {
        let field = |name: &str| {
            notification
                .get(name)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .trim()
                .to_string()
        };

        let subscription_id = field("subscriptionId");
        let subject = match subscription_id.split_once('-') {
            Some((prefix, _)) if !prefix.is_empty() => prefix.to_string(),
            _ => field("ownerId"),
        };

        Self {
            provider: Provider::Fitbit.as_str().to_string(),
            subject,
            collection: field("collectionType"),
            occurred_at: field("date"),
            received_at,
            payload: notification.clone(),
            decode_error: None,
        }
    }

    /// Wrap a message body that could not be decoded into an envelope.
    pub(crate) fn undecodable(body: &[u8], reason: &str) -> Self {
        Self {
            provider: String::new(),
            subject: String::new(),
            collection: String::new(),
            occurred_at: String::new(),
            received_at: Utc::now(),
            payload: Value::String(String::from_utf8_lossy(body).into_owned()),
            decode_error: Some(reason.to_string()),
        }
    }
}
