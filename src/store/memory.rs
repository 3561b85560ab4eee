//! In-process stores for development and tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use uuid::Uuid;

use super::{DedupeKey, DedupeStatus, DedupeStore, RecordStore, StoreError};
use crate::record::ProcessedRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyState {
    Pending(Uuid),
    Completed,
}

/// Dedupe index in a mutex-guarded map. Entries expire after `ttl` and are
/// swept out on the next claim.
pub struct MemoryDedupeStore {
    entries: Mutex<HashMap<DedupeKey, (KeyState, Instant)>>,
    ttl: Duration,
}

impl MemoryDedupeStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_completed(&self, key: &DedupeKey) -> bool {
        matches!(
            self.entries.lock().get(key),
            Some((KeyState::Completed, _))
        )
    }
}

impl Default for MemoryDedupeStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(7 * 24 * 60 * 60))
    }
}

#[async_trait]
impl DedupeStore for MemoryDedupeStore {
    async fn check_and_set(&self, key: &DedupeKey, owner: Uuid) -> Result<DedupeStatus, StoreError> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        entries.retain(|_, (_, stored_at)| now.duration_since(*stored_at) < self.ttl);

        if let Some((state, _)) = entries.get(key) {
            return Ok(match state {
                KeyState::Pending(holder) if *holder == owner => DedupeStatus::Resumed,
                _ => DedupeStatus::Seen,
            });
        }

        entries.insert(key.clone(), (KeyState::Pending(owner), now));
        Ok(DedupeStatus::Fresh)
    }

    async fn mark_completed(&self, key: &DedupeKey) -> Result<(), StoreError> {
        self.entries
            .lock()
            .insert(key.clone(), (KeyState::Completed, Instant::now()));
        Ok(())
    }

    async fn release(&self, key: &DedupeKey, owner: Uuid) -> Result<(), StoreError> {
        let mut entries = self.entries.lock();
        if matches!(entries.get(key), Some((KeyState::Pending(holder), _)) if *holder == owner) {
            entries.remove(key);
        }
        Ok(())
    }
}

/// Records kept in memory, keyed by dedupe key.
#[derive(Default)]
pub struct MemoryRecordStore {
    records: Mutex<HashMap<String, ProcessedRecord>>,
    writes: Mutex<u64>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, dedupe_key: &str) -> Option<ProcessedRecord> {
        self.records.lock().get(dedupe_key).cloned()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of write calls, including overwrites of the same key.
    pub fn writes(&self) -> u64 {
        *self.writes.lock()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn write(&self, record: &ProcessedRecord) -> Result<(), StoreError> {
        self.records
            .lock()
            .insert(record.dedupe_key.clone(), record.clone());
        *self.writes.lock() += 1;
        Ok(())
    }
}
