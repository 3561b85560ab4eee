//! Normalized metric output.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

use crate::event::RawEvent;

/// One sample of a metric series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricPoint {
    /// Date or timestamp as reported by the provider.
    pub timestamp: String,
    pub value: f64,
    /// Provider-specific detail kept alongside the value.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub extra: Value,
}

impl MetricPoint {
    pub fn new(timestamp: impl Into<String>, value: f64) -> Self {
        Self {
            timestamp: timestamp.into(),
            value,
            extra: Value::Null,
        }
    }

    pub fn with_extra(mut self, extra: Value) -> Self {
        self.extra = extra;
        self
    }
}

/// Everything fetched for one notification.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricDetails {
    /// Series name (`steps`, `calories`, ...) -> points
    pub series: BTreeMap<String, Vec<MetricPoint>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
}

impl MetricDetails {
    pub fn insert(&mut self, name: impl Into<String>, points: Vec<MetricPoint>) {
        self.series.insert(name.into(), points);
    }

    pub fn note(&mut self, note: impl Into<String>) {
        self.notes.push(note.into());
    }

    pub fn point_count(&self) -> usize {
        self.series.values().map(Vec::len).sum()
    }
}

/// Final output of the pipeline, written once to the record store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedRecord {
    pub dedupe_key: String,
    pub provider: String,
    pub subject: String,
    pub collection: String,
    pub occurred_at: String,
    pub metrics: MetricDetails,
    pub processed_at: DateTime<Utc>,
    /// Attempt on which processing succeeded.
    pub attempt: u32,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct InvalidRecord(pub String);

impl ProcessedRecord {
    pub fn new(dedupe_key: impl Into<String>, event: &RawEvent, metrics: MetricDetails, attempt: u32) -> Self {
        Self {
            dedupe_key: dedupe_key.into(),
            provider: event.provider.clone(),
            subject: event.subject.clone(),
            collection: event.collection.clone(),
            occurred_at: event.occurred_at.clone(),
            metrics,
            processed_at: Utc::now(),
            attempt,
        }
    }

    /// Reject records the store must never see.
    pub fn validate(&self) -> Result<(), InvalidRecord> {
        for (field, value) in [
            ("dedupe_key", &self.dedupe_key),
            ("provider", &self.provider),
            ("subject", &self.subject),
            ("collection", &self.collection),
        ] {
            if value.trim().is_empty() {
                return Err(InvalidRecord(format!("{} is empty", field)));
            }
        }

        for (name, points) in &self.metrics.series {
            if name.trim().is_empty() {
                return Err(InvalidRecord("metric series without a name".into()));
            }
            if let Some(point) = points.iter().find(|p| !p.value.is_finite()) {
                return Err(InvalidRecord(format!(
                    "{} has a non-finite value at {}",
                    name, point.timestamp
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(metrics: MetricDetails) -> ProcessedRecord {
        let event = RawEvent::new("fitbit", "42", "activities", "2026-02-01", json!({}));
        ProcessedRecord::new("abc123", &event, metrics, 0)
    }

    #[test]
    fn test_valid_record() {
        let mut metrics = MetricDetails::default();
        metrics.insert("steps", vec![MetricPoint::new("2026-02-01", 8042.0)]);
        let record = record(metrics);

        assert!(record.validate().is_ok());
        assert_eq!(record.metrics.point_count(), 1);
        assert_eq!(record.subject, "42");
    }

    #[test]
    fn test_non_finite_value_is_invalid() {
        let mut metrics = MetricDetails::default();
        metrics.insert("weight", vec![MetricPoint::new("2026-02-01", f64::NAN)]);
        let err = record(metrics).validate().unwrap_err();
        assert!(err.0.contains("weight"));
    }

    #[test]
    fn test_empty_identity_is_invalid() {
        let mut record = record(MetricDetails::default());
        record.subject = " ".into();
        let err = record.validate().unwrap_err();
        assert_eq!(err.0, "subject is empty");

        let boxed: Box<dyn std::error::Error> = Box::new(err);
        assert_eq!(boxed.to_string(), "subject is empty");
    }

    #[test]
    fn test_extra_is_omitted_when_null() {
        let point = MetricPoint::new("2026-02-01", 1.0);
        let json = serde_json::to_value(&point).unwrap();
        assert!(json.get("extra").is_none());

        let point = point.with_extra(json!({"unit": "kg"}));
        assert_eq!(serde_json::to_value(&point).unwrap()["extra"]["unit"], "kg");
    }
}
