//! The staged processing pipeline.
//!
//! Every delivery runs through the same ordered list of [`Stage`]s, sharing
//! one [`PipelineContext`]:
//!
//! ```text
//! parse ──▶ dedupe ──▶ fetch_details ──▶ persist
//!              │
//!              └── already seen: stop, ack
//! ```
//!
//! A stage either lets the message continue, stops it as a duplicate, or
//! fails with a [`StageError`]. The pipeline never decides what happens to a
//! failed message; it reports the failing stage and error to the caller,
//! which hands them to the retry router.

pub mod dedupe;
pub mod fetch;
pub mod parse;
pub mod persist;

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use crate::envelope::Envelope;
use crate::instrument::Timing;
use crate::provider::{AuthFailureSink, CredentialSource, ProviderError, ProviderRegistry};
use crate::record::{MetricDetails, ProcessedRecord};
use crate::store::{DedupeKey, SharedDedupeStore, SharedRecordStore, StoreError};

pub use dedupe::DedupeStage;
pub use fetch::FetchDetailsStage;
pub use parse::{Notification, ParseStage};
pub use persist::PersistStage;

/// Failure of a single stage.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StageError {
    /// Malformed payload
    #[error("malformed payload: {0}")]
    Parse(String),

    /// Provider credential expired or revoked
    #[error("{0}")]
    Auth(String),

    /// Network failure or rate limit talking to the provider
    #[error("{0}")]
    TransientProvider(String),

    /// Provider refused the request for good
    #[error("{0}")]
    ProviderRejected(String),

    /// Dedupe or record store unavailable
    #[error("{0}")]
    TransientStore(String),

    /// Record failed validation or the store refused it
    #[error("invalid record: {0}")]
    Validation(String),

    /// Misconfigured pipeline (e.g. no client for a provider)
    #[error("{0}")]
    Pipeline(String),
}

impl StageError {
    /// Stable name of the error class, recorded in failure records.
    pub fn kind(&self) -> &'static str {
        match self {
            StageError::Parse(_) => "ParseError",
            StageError::Auth(_) => "AuthError",
            StageError::TransientProvider(_) => "TransientProviderError",
            StageError::ProviderRejected(_) => "ProviderRejected",
            StageError::TransientStore(_) => "TransientStoreError",
            StageError::Validation(_) => "ValidationError",
            StageError::Pipeline(_) => "PipelineError",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StageError::TransientProvider(_) | StageError::TransientStore(_)
        )
    }
}

impl From<ProviderError> for StageError {
    fn from(e: ProviderError) -> Self {
        match e {
            ProviderError::Auth(msg) => StageError::Auth(msg),
            ProviderError::Transient(msg) => StageError::TransientProvider(msg),
            e @ ProviderError::Rejected { .. } => StageError::ProviderRejected(e.to_string()),
        }
    }
}

impl From<StoreError> for StageError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Unavailable(msg) => StageError::TransientStore(msg),
            StoreError::Invalid(msg) => StageError::Validation(msg),
        }
    }
}

/// What a stage tells the pipeline to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// Already processed: skip the remaining stages and ack.
    AlreadySeen,
}

pub type StageResult = Result<Flow, StageError>;

/// State shared by the stages for one delivery.
#[derive(Debug, Clone)]
pub struct PipelineContext {
    pub envelope: Envelope,
    pub notification: Option<Notification>,
    pub dedupe_key: Option<DedupeKey>,
    pub details: Option<MetricDetails>,
    pub record: Option<ProcessedRecord>,
}

impl PipelineContext {
    pub fn new(envelope: Envelope) -> Self {
        Self {
            envelope,
            notification: None,
            dedupe_key: None,
            details: None,
            record: None,
        }
    }

    /// The parsed notification, or an error naming the stage that needed it.
    pub fn require_notification(&self, stage: &str) -> Result<&Notification, StageError> {
        self.notification
            .as_ref()
            .ok_or_else(|| StageError::Pipeline(format!("{} ran before parse", stage)))
    }

    pub fn require_dedupe_key(&self, stage: &str) -> Result<&DedupeKey, StageError> {
        self.dedupe_key
            .as_ref()
            .ok_or_else(|| StageError::Pipeline(format!("{} ran before dedupe", stage)))
    }
}

/// One step of the pipeline.
#[async_trait]
pub trait Stage: Send + Sync {
    /// Short name used in logs, timing lines and failure records
    fn name(&self) -> &'static str;

    async fn run(&self, ctx: &mut PipelineContext) -> StageResult;
}

/// How a delivery left the pipeline.
#[derive(Debug)]
pub enum PipelineOutcome {
    /// Every stage succeeded.
    Completed(PipelineContext),
    /// The dedupe stage found the event already handled.
    Duplicate(PipelineContext),
    /// A stage failed; nothing after it ran.
    Failed {
        stage: &'static str,
        error: StageError,
        context: PipelineContext,
    },
}

/// Collaborators of the standard stages.
#[derive(Clone)]
pub struct PipelineDeps {
    pub dedupe: SharedDedupeStore,
    pub records: SharedRecordStore,
    pub providers: Arc<ProviderRegistry>,
    pub credentials: Arc<dyn CredentialSource>,
    pub auth_failures: Arc<dyn AuthFailureSink>,
}

/// Fixed, ordered list of stages.
pub struct Pipeline {
    stages: Vec<Arc<dyn Stage>>,
    timing: Timing,
}

impl Pipeline {
    pub fn new(timing: Timing) -> Self {
        Self {
            stages: Vec::new(),
            timing,
        }
    }

    /// parse → dedupe → fetch_details → persist
    pub fn standard(deps: PipelineDeps, timing: Timing) -> Self {
        Self::new(timing)
            .with_stage(Arc::new(ParseStage::new()))
            .with_stage(Arc::new(DedupeStage::new(deps.dedupe.clone())))
            .with_stage(Arc::new(FetchDetailsStage::new(
                deps.providers,
                deps.credentials,
                deps.auth_failures,
            )))
            .with_stage(Arc::new(PersistStage::new(deps.records, deps.dedupe)))
    }

    /// Append a stage.
    pub fn with_stage(mut self, stage: Arc<dyn Stage>) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    pub fn timing(&self) -> &Timing {
        &self.timing
    }

    /// Run one envelope through every stage in order.
    pub async fn run(&self, envelope: &Envelope) -> PipelineOutcome {
        let mut ctx = PipelineContext::new(envelope.clone());

        for stage in &self.stages {
            let operation = format!("worker.stage.{}", stage.name());
            let result = self.timing.measure(&operation, stage.run(&mut ctx)).await;

            match result {
                Ok(Flow::Continue) => {}
                Ok(Flow::AlreadySeen) => {
                    debug!(
                        envelope_id = %envelope.id(),
                        stage = stage.name(),
                        "Pipeline short-circuited"
                    );
                    return PipelineOutcome::Duplicate(ctx);
                }
                Err(error) => {
                    return PipelineOutcome::Failed {
                        stage: stage.name(),
                        error,
                        context: ctx,
                    };
                }
            }
        }

        PipelineOutcome::Completed(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::TopicSet;
    use crate::event::RawEvent;
    use parking_lot::Mutex;
    use serde_json::json;

    struct Recording {
        name: &'static str,
        result: StageResult,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl Stage for Recording {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn run(&self, _ctx: &mut PipelineContext) -> StageResult {
            self.log.lock().push(self.name);
            self.result.clone()
        }
    }

    fn envelope() -> Envelope {
        let topics = TopicSet::for_domain("fitbit");
        Envelope::new(
            RawEvent::new("fitbit", "42", "steps", "2026-02-01", json!({})),
            &topics.raw,
        )
    }

    fn pipeline(results: Vec<(&'static str, StageResult)>) -> (Pipeline, Arc<Mutex<Vec<&'static str>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = results.into_iter().fold(Pipeline::new(Timing::disabled()), |p, (name, result)| {
            p.with_stage(Arc::new(Recording {
                name,
                result,
                log: log.clone(),
            }))
        });
        (pipeline, log)
    }

    #[tokio::test]
    async fn test_stages_run_in_order() {
        let (pipeline, log) = pipeline(vec![
            ("a", Ok(Flow::Continue)),
            ("b", Ok(Flow::Continue)),
            ("c", Ok(Flow::Continue)),
        ]);

        assert!(matches!(pipeline.run(&envelope()).await, PipelineOutcome::Completed(_)));
        assert_eq!(*log.lock(), vec!["a", "b", "c"]);
        assert_eq!(pipeline.stage_names(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_failure_stops_pipeline() {
        let (pipeline, log) = pipeline(vec![
            ("a", Ok(Flow::Continue)),
            ("b", Err(StageError::TransientProvider("429".into()))),
            ("c", Ok(Flow::Continue)),
        ]);

        match pipeline.run(&envelope()).await {
            PipelineOutcome::Failed { stage, error, .. } => {
                assert_eq!(stage, "b");
                assert!(error.is_retryable());
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(*log.lock(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_already_seen_short_circuits() {
        let (pipeline, log) = pipeline(vec![
            ("a", Ok(Flow::AlreadySeen)),
            ("b", Ok(Flow::Continue)),
        ]);

        assert!(matches!(pipeline.run(&envelope()).await, PipelineOutcome::Duplicate(_)));
        assert_eq!(*log.lock(), vec!["a"]);
    }

    #[test]
    fn test_error_taxonomy() {
        let cases = [
            (StageError::Parse("x".into()), "ParseError", false),
            (StageError::Auth("x".into()), "AuthError", false),
            (StageError::TransientProvider("x".into()), "TransientProviderError", true),
            (StageError::ProviderRejected("x".into()), "ProviderRejected", false),
            (StageError::TransientStore("x".into()), "TransientStoreError", true),
            (StageError::Validation("x".into()), "ValidationError", false),
            (StageError::Pipeline("x".into()), "PipelineError", false),
        ];
        for (error, kind, retryable) in cases {
            assert_eq!(error.kind(), kind);
            assert_eq!(error.is_retryable(), retryable, "{}", kind);
        }
    }

    #[test]
    fn test_error_conversions() {
        assert_eq!(
            StageError::from(ProviderError::Transient("timeout".into())).kind(),
            "TransientProviderError"
        );
        assert_eq!(
            StageError::from(StoreError::Invalid("schema".into())).kind(),
            "ValidationError"
        );
        assert_eq!(
            StageError::from(StoreError::Unavailable("down".into())).kind(),
            "TransientStoreError"
        );
    }
}
