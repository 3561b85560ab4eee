//! Append-only JSON-lines record store.
//!
//! One `ProcessedRecord` per line. Writes are serialized through a mutex and
//! flushed before returning, so a line is either fully on disk or missing.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{RecordStore, StoreError};
use crate::record::ProcessedRecord;

pub struct JsonlRecordStore {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonlRecordStore {
    /// Open `path` for appending, creating parent directories as needed.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        info!(path = %path.display(), "JSONL record store opened");
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl RecordStore for JsonlRecordStore {
    async fn write(&self, record: &ProcessedRecord) -> Result<(), StoreError> {
        let mut line = serde_json::to_vec(record).map_err(|e| StoreError::Invalid(e.to_string()))?;
        line.push(b'\n');

        let mut file = self.file.lock().await;
        file.write_all(&line).await?;
        file.flush().await?;

        debug!(dedupe_key = %record.dedupe_key, path = %self.path.display(), "Record appended");
        Ok(())
    }
}
