//! Parse stage: validate the envelope's raw event and decode it into a
//! [`Notification`].
//!
//! Parsing is pure, so every failure here is a [`StageError::Parse`].

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate};

use super::{Flow, PipelineContext, Stage, StageError, StageResult};
use crate::event::{Provider, RawEvent};

/// A provider notification the later stages can act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub provider: Provider,
    pub subject: String,
    /// Collection as sent by the provider (e.g. "activities", "userRevokedAccess")
    pub collection: String,
    pub date: NaiveDate,
}

impl Notification {
    /// `YYYY-MM-DD`
    pub fn date_string(&self) -> String {
        self.date.format("%Y-%m-%d").to_string()
    }
}

#[derive(Debug, Default)]
pub struct ParseStage;

impl ParseStage {
    pub fn new() -> Self {
        Self
    }
}

/// Accepts `YYYY-MM-DD` or an RFC 3339 timestamp.
fn parse_date(value: &str) -> Result<NaiveDate, StageError> {
    let value = value.trim();
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .or_else(|_| DateTime::parse_from_rfc3339(value).map(|ts| ts.date_naive()))
        .map_err(|_| StageError::Parse(format!("invalid date '{}'", value)))
}

fn required<'a>(field: &str, value: &'a str) -> Result<&'a str, StageError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(StageError::Parse(format!("missing {}", field)));
    }
    Ok(value)
}

pub fn parse_event(event: &RawEvent) -> Result<Notification, StageError> {
    if let Some(reason) = &event.decode_error {
        return Err(StageError::Parse(format!(
            "undecodable message body ({}): {}",
            reason,
            event.payload.as_str().unwrap_or_default()
        )));
    }

    if !event.payload.is_object() {
        return Err(StageError::Parse("payload is not a JSON object".into()));
    }

    let provider = required("provider", &event.provider)?
        .parse::<Provider>()
        .map_err(StageError::Parse)?;

    Ok(Notification {
        provider,
        subject: required("subject", &event.subject)?.to_string(),
        collection: required("collection", &event.collection)?.to_string(),
        date: parse_date(required("date", &event.occurred_at)?)?,
    })
}

#[async_trait]
impl Stage for ParseStage {
    fn name(&self) -> &'static str {
        "parse"
    }

    async fn run(&self, ctx: &mut PipelineContext) -> StageResult {
        let notification = parse_event(ctx.envelope.event())?;
        ctx.notification = Some(notification);
        Ok(Flow::Continue)
    }
}
