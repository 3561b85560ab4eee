//! Fetch-details stage: pull the metrics a notification refers to from the
//! provider API.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use super::{Flow, PipelineContext, Stage, StageError, StageResult};
use crate::provider::{
    AuthFailureSink, CredentialSource, FetchRequest, ProviderError, ProviderRegistry,
};

pub struct FetchDetailsStage {
    providers: Arc<ProviderRegistry>,
    credentials: Arc<dyn CredentialSource>,
    auth_failures: Arc<dyn AuthFailureSink>,
}

impl FetchDetailsStage {
    pub fn new(
        providers: Arc<ProviderRegistry>,
        credentials: Arc<dyn CredentialSource>,
        auth_failures: Arc<dyn AuthFailureSink>,
    ) -> Self {
        Self {
            providers,
            credentials,
            auth_failures,
        }
    }
}

#[async_trait]
impl Stage for FetchDetailsStage {
    fn name(&self) -> &'static str {
        "fetch_details"
    }

    async fn run(&self, ctx: &mut PipelineContext) -> StageResult {
        let notification = ctx.require_notification(self.name())?;
        let provider = notification.provider.as_str();

        let client = self.providers.get(provider).ok_or_else(|| {
            StageError::Pipeline(format!("no client registered for provider {}", provider))
        })?;

        let request = FetchRequest {
            subject: notification.subject.clone(),
            collection: notification.collection.clone(),
            date: notification.date_string(),
        };

        let result = match self.credentials.access_token(provider, &request.subject).await {
            Ok(token) => client.fetch_details(&request, &token).await,
            Err(e) => Err(e),
        };

        let details = match result {
            Ok(details) => details,
            Err(ProviderError::Auth(reason)) => {
                self.auth_failures
                    .auth_failed(provider, &request.subject, &reason)
                    .await;
                return Err(StageError::Auth(reason));
            }
            Err(e) => return Err(e.into()),
        };

        debug!(
            provider = provider,
            collection = %request.collection,
            points = details.point_count(),
            "Provider details fetched"
        );
        ctx.details = Some(details);
        Ok(Flow::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{Envelope, TopicSet};
    use crate::event::RawEvent;
    use crate::pipeline::parse::parse_event;
    use crate::provider::{ProviderApi, StaticCredentials};
    use crate::record::{MetricDetails, MetricPoint};
    use parking_lot::Mutex;
    use serde_json::json;

    struct Scripted(Mutex<Vec<Result<MetricDetails, ProviderError>>>);

    #[async_trait]
    impl ProviderApi for Scripted {
        fn provider(&self) -> &str {
            "fitbit"
        }

        async fn fetch_details(
            &self,
            request: &FetchRequest,
            access_token: &str,
        ) -> Result<MetricDetails, ProviderError> {
            assert_eq!(request.date, "2026-02-01");
            assert_eq!(access_token, "tok");
            self.0.lock().remove(0)
        }
    }

    #[derive(Default)]
    struct RecordingSink(Mutex<Vec<(String, String)>>);

    #[async_trait]
    impl AuthFailureSink for RecordingSink {
        async fn auth_failed(&self, provider: &str, subject: &str, _reason: &str) {
            self.0.lock().push((provider.to_string(), subject.to_string()));
        }
    }

    fn context(provider: &str) -> PipelineContext {
        let topics = TopicSet::for_domain("fitbit");
        let event = RawEvent::new(provider, "42", "activities", "2026-02-01", json!({}));
        let mut ctx = PipelineContext::new(Envelope::new(event, &topics.raw));
        ctx.notification = Some(parse_event(ctx.envelope.event()).unwrap());
        ctx
    }

    fn stage(
        results: Vec<Result<MetricDetails, ProviderError>>,
        sink: Arc<RecordingSink>,
    ) -> FetchDetailsStage {
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(Scripted(Mutex::new(results))));
        FetchDetailsStage::new(
            Arc::new(registry),
            Arc::new(StaticCredentials::new().with_token("fitbit", "42", "tok")),
            sink,
        )
    }

    #[tokio::test]
    async fn test_details_stored_in_context() {
        let mut details = MetricDetails::default();
        details.insert("steps", vec![MetricPoint::new("2026-02-01", 9000.0)]);
        let stage = stage(vec![Ok(details.clone())], Arc::default());

        let mut ctx = context("fitbit");
        assert_eq!(stage.run(&mut ctx).await.unwrap(), Flow::Continue);
        assert_eq!(ctx.details, Some(details));
    }

    #[tokio::test]
    async fn test_error_mapping() {
        let stage = stage(
            vec![
                Err(ProviderError::Transient("429".into())),
                Err(ProviderError::Rejected {
                    status: 400,
                    message: "bad".into(),
                }),
            ],
            Arc::default(),
        );

        let err = stage.run(&mut context("fitbit")).await.unwrap_err();
        assert_eq!(err.kind(), "TransientProviderError");
        let err = stage.run(&mut context("fitbit")).await.unwrap_err();
        assert_eq!(err.kind(), "ProviderRejected");
    }

    #[tokio::test]
    async fn test_auth_failure_signals_sink() {
        let sink = Arc::new(RecordingSink::default());
        let stage = stage(vec![Err(ProviderError::Auth("expired_token".into()))], sink.clone());

        let err = stage.run(&mut context("fitbit")).await.unwrap_err();
        assert_eq!(err.kind(), "AuthError");
        assert!(!err.is_retryable());
        assert_eq!(*sink.0.lock(), vec![("fitbit".to_string(), "42".to_string())]);
    }

    #[tokio::test]
    async fn test_missing_credential_is_auth_error() {
        let sink = Arc::new(RecordingSink::default());
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(Scripted(Mutex::new(vec![]))));
        let stage = FetchDetailsStage::new(
            Arc::new(registry),
            Arc::new(StaticCredentials::new()),
            sink.clone(),
        );

        let err = stage.run(&mut context("fitbit")).await.unwrap_err();
        assert_eq!(err.kind(), "AuthError");
        assert_eq!(sink.0.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_unregistered_provider() {
        let stage = stage(vec![], Arc::default());
        let err = stage.run(&mut context("google_fit")).await.unwrap_err();
        assert_eq!(err.kind(), "PipelineError");
    }
}
