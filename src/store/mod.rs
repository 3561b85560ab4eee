//! Dedupe and record stores.
//!
//! Both are shared by every worker instance, so implementations must make
//! check-and-set and writes safe under concurrency.
//!
//! Dedupe keys go through two states. A delivery that gets past the dedupe
//! stage leaves a *pending* claim tagged with its envelope id; the persist
//! stage turns it into *completed*. Retries of the same envelope carry the
//! same id, so they resume their own claim instead of being reported as
//! duplicates.

pub mod jsonl;
pub mod memory;
pub mod redis_dedupe;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::config::{DedupeBackend, RecordBackend, VitalflowConfig};
use crate::event::RawEvent;
use crate::record::ProcessedRecord;

pub use self::jsonl::JsonlRecordStore;
pub use self::memory::{MemoryDedupeStore, MemoryRecordStore};
pub use self::redis_dedupe::RedisDedupeStore;

#[derive(Error, Debug)]
pub enum StoreError {
    /// Store could not be reached or failed mid-operation. Retryable.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The store refused the data. Not retryable.
    #[error("store rejected data: {0}")]
    Invalid(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Unavailable(e.to_string())
    }
}

impl From<deadpool_redis::redis::RedisError> for StoreError {
    fn from(e: deadpool_redis::redis::RedisError) -> Self {
        StoreError::Unavailable(e.to_string())
    }
}

impl From<deadpool_redis::PoolError> for StoreError {
    fn from(e: deadpool_redis::PoolError) -> Self {
        StoreError::Unavailable(e.to_string())
    }
}

/// Digest identifying one logical event across redeliveries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DedupeKey(String);

impl DedupeKey {
    /// SHA-256 over provider, subject, collection and occurred-at.
    pub fn for_event(event: &RawEvent) -> Self {
        let mut hasher = Sha256::new();
        for (i, part) in [
            &event.provider,
            &event.subject,
            &event.collection,
            &event.occurred_at,
        ]
        .into_iter()
        .enumerate()
        {
            if i > 0 {
                hasher.update(b"|");
            }
            hasher.update(part.as_bytes());
        }
        DedupeKey(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DedupeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Result of a dedupe check-and-set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupeStatus {
    /// First time this key is seen; the claim now belongs to the caller.
    Fresh,
    /// The caller already holds the claim (a retry of the same envelope).
    Resumed,
    /// Completed already, or claimed by another envelope.
    Seen,
}

impl DedupeStatus {
    pub fn is_seen(&self) -> bool {
        matches!(self, DedupeStatus::Seen)
    }
}

#[async_trait]
pub trait DedupeStore: Send + Sync {
    /// Atomically claim `key` for `owner` unless it is already known.
    async fn check_and_set(&self, key: &DedupeKey, owner: Uuid) -> Result<DedupeStatus, StoreError>;

    /// Record that the event behind `key` has been persisted.
    async fn mark_completed(&self, key: &DedupeKey) -> Result<(), StoreError>;

    /// Drop a pending claim held by `owner`, so a later notification of the
    /// same event can be processed. Completed keys are left alone.
    async fn release(&self, key: &DedupeKey, owner: Uuid) -> Result<(), StoreError>;
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn write(&self, record: &ProcessedRecord) -> Result<(), StoreError>;
}

pub type SharedDedupeStore = Arc<dyn DedupeStore>;
pub type SharedRecordStore = Arc<dyn RecordStore>;

/// Build the stores selected in `[store]`.
pub async fn from_config(
    config: &VitalflowConfig,
) -> Result<(SharedDedupeStore, SharedRecordStore), StoreError> {
    let ttl = std::time::Duration::from_secs(config.store.dedupe_ttl_secs);

    let dedupe: SharedDedupeStore = match config.store.dedupe {
        DedupeBackend::Memory => Arc::new(MemoryDedupeStore::new(ttl)),
        DedupeBackend::Redis => Arc::new(
            RedisDedupeStore::connect(config.dedupe_redis_url(), &config.queue.redis.key_prefix, ttl)
                .await?,
        ),
    };

    let records: SharedRecordStore = match config.store.records {
        RecordBackend::Memory => Arc::new(MemoryRecordStore::new()),
        RecordBackend::Jsonl => Arc::new(JsonlRecordStore::open(&config.store.records_path).await?),
    };

    Ok((dedupe, records))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_dedupe_key_is_deterministic() {
        let a = RawEvent::new("fitbit", "42", "steps", "2026-02-01", json!({"x": 1}));
        let b = RawEvent::new("fitbit", "42", "steps", "2026-02-01", json!({"y": 2}));
        let c = RawEvent::new("fitbit", "42", "steps", "2026-02-02", json!({}));

        assert_eq!(DedupeKey::for_event(&a), DedupeKey::for_event(&b));
        assert_ne!(DedupeKey::for_event(&a), DedupeKey::for_event(&c));
        assert_eq!(DedupeKey::for_event(&a).as_str().len(), 64);
    }

    #[test]
    fn test_dedupe_key_field_boundaries() {
        let a = RawEvent::new("fitbit", "4", "2steps", "2026-02-01", json!({}));
        let b = RawEvent::new("fitbit", "42", "steps", "2026-02-01", json!({}));
        assert_ne!(DedupeKey::for_event(&a), DedupeKey::for_event(&b));
    }

    #[test]
    fn test_store_error_classification() {
        assert!(StoreError::Unavailable("timeout".into()).is_transient());
        assert!(!StoreError::Invalid("schema".into()).is_transient());
    }
}
