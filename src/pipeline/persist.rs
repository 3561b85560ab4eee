//! Persist stage: write the processed record, then mark the dedupe key
//! completed.
//!
//! The record is written before the key is completed. A crash in between
//! leaves a pending claim that the retried envelope resumes, so the event is
//! written again rather than lost.

use async_trait::async_trait;
use tracing::info;

use super::{Flow, PipelineContext, Stage, StageError, StageResult};
use crate::record::ProcessedRecord;
use crate::store::{SharedDedupeStore, SharedRecordStore};

pub struct PersistStage {
    records: SharedRecordStore,
    dedupe: SharedDedupeStore,
}

impl PersistStage {
    pub fn new(records: SharedRecordStore, dedupe: SharedDedupeStore) -> Self {
        Self { records, dedupe }
    }
}

#[async_trait]
impl Stage for PersistStage {
    fn name(&self) -> &'static str {
        "persist"
    }

    async fn run(&self, ctx: &mut PipelineContext) -> StageResult {
        let key = ctx.require_dedupe_key(self.name())?.clone();
        let details = ctx
            .details
            .clone()
            .ok_or_else(|| StageError::Pipeline("persist ran before fetch_details".into()))?;

        let record = ProcessedRecord::new(
            key.as_str(),
            ctx.envelope.event(),
            details,
            ctx.envelope.attempt(),
        );
        record
            .validate()
            .map_err(|e| StageError::Validation(e.to_string()))?;

        self.records.write(&record).await?;
        self.dedupe.mark_completed(&key).await?;

        info!(
            dedupe_key = %key,
            subject = %record.subject,
            collection = %record.collection,
            attempt = record.attempt,
            "Record persisted"
        );
        ctx.record = Some(record);
        Ok(Flow::Continue)
    }
}
