//! Dedupe stage: claim the event's dedupe key or stop the pipeline.

use async_trait::async_trait;
use tracing::{debug, info};

use super::{Flow, PipelineContext, Stage, StageResult};
use crate::store::{DedupeKey, DedupeStatus, SharedDedupeStore};

pub struct DedupeStage {
    store: SharedDedupeStore,
}

impl DedupeStage {
    pub fn new(store: SharedDedupeStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Stage for DedupeStage {
    fn name(&self) -> &'static str {
        "dedupe"
    }

    async fn run(&self, ctx: &mut PipelineContext) -> StageResult {
        ctx.require_notification(self.name())?;

        let key = DedupeKey::for_event(ctx.envelope.event());
        let status = self.store.check_and_set(&key, ctx.envelope.id()).await?;

        let flow = match status {
            DedupeStatus::Fresh => Flow::Continue,
            DedupeStatus::Resumed => {
                debug!(
                    envelope_id = %ctx.envelope.id(),
                    attempt = ctx.envelope.attempt(),
                    dedupe_key = %key,
                    "Resuming dedupe claim"
                );
                Flow::Continue
            }
            DedupeStatus::Seen => {
                info!(
                    envelope_id = %ctx.envelope.id(),
                    dedupe_key = %key,
                    "Duplicate event skipped"
                );
                Flow::AlreadySeen
            }
        };

        ctx.dedupe_key = Some(key);
        Ok(flow)
    }
}
