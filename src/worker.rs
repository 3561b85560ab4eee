//! The worker loop.
//!
//! Consumes the raw and the retry topic and feeds every delivery through the
//! [`Pipeline`]. Each delivery ends in exactly one settlement:
//!
//! ```text
//! Completed ──▶ ack
//! Duplicate ──▶ ack
//! Failed ─────▶ RetryRouter (retry topic or DLQ, then ack; nack if that fails)
//! ```
//!
//! Stage errors never escape the loop. Transport errors while polling are
//! logged and counted, and the loop keeps going.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::envelope::TopicSet;
use crate::health::WorkerHealth;
use crate::instrument::Timing;
use crate::pipeline::{Pipeline, PipelineOutcome};
use crate::queue::{consume, ConsumeOptions, Consumer, Delivery, SharedQueue, TransportError};
use crate::router::{RetryRouter, RouteDecision};
use crate::shutdown::ShutdownSignal;
use crate::store::SharedDedupeStore;

/// Pause after a failed poll before trying again.
const POLL_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// How one delivery was settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandleOutcome {
    Processed,
    Duplicate,
    Routed(RouteDecision),
    /// Neither acked nor routed; the backend will hand it out again.
    Unsettled,
}

/// One consume round came back without a delivery, or failed.
#[derive(Error, Debug)]
enum PollError {
    #[error("no message within poll wait")]
    Idle,
    #[error(transparent)]
    Transport(#[from] TransportError),
}

pub struct Worker {
    queue: SharedQueue,
    topics: TopicSet,
    pipeline: Pipeline,
    router: RetryRouter,
    dedupe: SharedDedupeStore,
    health: Arc<WorkerHealth>,
    options: ConsumeOptions,
}

impl Worker {
    pub fn new(
        queue: SharedQueue,
        topics: TopicSet,
        pipeline: Pipeline,
        router: RetryRouter,
        dedupe: SharedDedupeStore,
    ) -> Self {
        let options = ConsumeOptions::default();
        Self {
            queue,
            topics,
            pipeline,
            router,
            dedupe,
            health: Arc::new(WorkerHealth::for_poll_wait(options.wait)),
            options,
        }
    }

    pub fn with_options(mut self, options: ConsumeOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_health(mut self, health: Arc<WorkerHealth>) -> Self {
        self.health = health;
        self
    }

    pub fn health(&self) -> Arc<WorkerHealth> {
        self.health.clone()
    }

    fn timing(&self) -> &Timing {
        self.pipeline.timing()
    }

    /// Run one delivery through the pipeline and settle it.
    pub async fn handle(&self, delivery: Delivery) -> HandleOutcome {
        let envelope = &delivery.envelope;
        debug!(
            envelope_id = %envelope.id(),
            topic = %delivery.handle.topic,
            message_id = %delivery.handle.message_id,
            attempt = envelope.attempt(),
            "Processing delivery"
        );

        match self.pipeline.run(envelope).await {
            PipelineOutcome::Completed(_) => {
                if !self.ack(&delivery).await {
                    return HandleOutcome::Unsettled;
                }
                self.health.record_processed();
                HandleOutcome::Processed
            }
            PipelineOutcome::Duplicate(_) => {
                if !self.ack(&delivery).await {
                    return HandleOutcome::Unsettled;
                }
                self.health.record_duplicate();
                HandleOutcome::Duplicate
            }
            PipelineOutcome::Failed {
                stage,
                error,
                context,
            } => match self.router.route(&delivery, stage, &error).await {
                Ok(decision) => {
                    match &decision {
                        RouteDecision::Retried { .. } => self.health.record_retried(),
                        RouteDecision::DeadLettered { .. } => {
                            self.health.record_dead_lettered();
                            // Let a later notification of the same event through.
                            if let Some(key) = &context.dedupe_key {
                                if let Err(e) = self.dedupe.release(key, envelope.id()).await {
                                    warn!(dedupe_key = %key, error = %e, "Failed to release dedupe claim");
                                }
                            }
                        }
                    }
                    HandleOutcome::Routed(decision)
                }
                Err(e) => {
                    error!(
                        envelope_id = %envelope.id(),
                        stage = stage,
                        error = %e,
                        "Failed to route failed delivery"
                    );
                    self.health.record_transport_error();
                    HandleOutcome::Unsettled
                }
            },
        }
    }

    async fn ack(&self, delivery: &Delivery) -> bool {
        match self.queue.ack(&delivery.handle).await {
            Ok(()) => true,
            Err(e) => {
                error!(
                    message_id = %delivery.handle.message_id,
                    topic = %delivery.handle.topic,
                    error = %e,
                    "Failed to ack delivery"
                );
                self.health.record_transport_error();
                false
            }
        }
    }

    async fn poll(&self, consumer: &mut Consumer, wait: Duration) -> Result<Delivery, PollError> {
        let operation = format!("worker.queue.consume.{}", consumer.topic());
        let result = self
            .timing()
            .measure_unless(
                &operation,
                async {
                    match consumer.poll_with_wait(wait).await {
                        Ok(Some(delivery)) => Ok(delivery),
                        Ok(None) => Err(PollError::Idle),
                        Err(e) => Err(PollError::Transport(e)),
                    }
                },
                |e| matches!(e, PollError::Idle),
            )
            .await;
        self.health.record_poll();
        result
    }

    fn consumers(&self) -> [Consumer; 2] {
        [
            consume(&self.queue, &self.topics.raw, self.options),
            consume(&self.queue, &self.topics.retry, self.options),
        ]
    }

    /// Handle everything currently waiting on the raw and retry topics,
    /// including retries scheduled along the way. Returns the number of
    /// deliveries handled.
    pub async fn process_available(&self) -> usize {
        let mut consumers = self.consumers();
        let mut handled = 0;

        loop {
            let mut round = 0;
            for consumer in consumers.iter_mut() {
                match self.poll(consumer, Duration::ZERO).await {
                    Ok(delivery) => {
                        self.handle(delivery).await;
                        round += 1;
                    }
                    Err(PollError::Idle) => {}
                    Err(PollError::Transport(e)) => {
                        warn!(topic = %consumer.topic(), error = %e, "Poll failed");
                        self.health.record_transport_error();
                    }
                }
            }
            if round == 0 {
                break;
            }
            handled += round;
        }

        handled
    }

    /// Consume until `shutdown` fires.
    ///
    /// The raw topic is polled with the configured wait while idle; the retry
    /// topic is checked every round without waiting. On shutdown the
    /// in-flight delivery is settled first, buffered deliveries are released
    /// and the backend is closed.
    pub async fn run(&self, shutdown: ShutdownSignal) {
        let [mut raw, mut retry] = self.consumers();
        self.health.set_consuming(true);

        info!(
            backend = %self.queue.kind(),
            raw = %self.topics.raw,
            retry = %self.topics.retry,
            stages = ?self.pipeline.stage_names(),
            "Worker consuming"
        );

        let mut busy = false;
        'consume: while !shutdown.is_shutdown() {
            let mut round = 0;

            for (consumer, idle_wait) in [(&mut raw, self.options.wait), (&mut retry, Duration::ZERO)] {
                let wait = if busy { Duration::ZERO } else { idle_wait };

                let polled = tokio::select! {
                    _ = shutdown.recv() => break 'consume,
                    polled = self.poll(consumer, wait) => polled,
                };

                match polled {
                    Ok(delivery) => {
                        self.handle(delivery).await;
                        round += 1;
                    }
                    Err(PollError::Idle) => {}
                    Err(PollError::Transport(e)) => {
                        warn!(topic = %consumer.topic(), error = %e, "Poll failed, backing off");
                        self.health.record_transport_error();
                        tokio::select! {
                            _ = shutdown.recv() => break 'consume,
                            _ = tokio::time::sleep(POLL_ERROR_BACKOFF) => {}
                        }
                    }
                }
            }

            busy = round > 0;

            let stats = self.health.snapshot();
            if round > 0 && stats.processed > 0 && stats.processed % 100 == 0 {
                info!(
                    processed = stats.processed,
                    duplicates = stats.duplicates,
                    retried = stats.retried,
                    dead_lettered = stats.dead_lettered,
                    "Worker statistics"
                );
            }
        }

        self.health.set_consuming(false);
        raw.release().await;
        retry.release().await;
        self.queue.close().await;

        let stats = self.health.snapshot();
        info!(
            processed = stats.processed,
            duplicates = stats.duplicates,
            retried = stats.retried,
            dead_lettered = stats.dead_lettered,
            transport_errors = stats.transport_errors,
            "Worker stopped"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{Envelope, Topic};
    use crate::event::RawEvent;
    use crate::pipeline::PipelineDeps;
    use crate::provider::{
        FetchRequest, LogAuthFailures, ProviderApi, ProviderError, ProviderRegistry,
        StaticCredentials,
    };
    use crate::queue::{AckHandle, BackendKind, MemoryQueue, MessageId, QueueBackend};
    use crate::record::{MetricDetails, MetricPoint};
    use crate::store::{DedupeKey, DedupeStatus, DedupeStore, MemoryDedupeStore, MemoryRecordStore};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    /// Memory queue that remembers every publish.
    #[derive(Default)]
    struct RecordingQueue {
        inner: MemoryQueue,
        published: Mutex<Vec<(Topic, Envelope)>>,
    }

    impl RecordingQueue {
        fn published_to(&self, topic: &Topic) -> Vec<Envelope> {
            self.published
                .lock()
                .iter()
                .filter(|(t, _)| t == topic)
                .map(|(_, e)| e.clone())
                .collect()
        }
    }

    #[async_trait]
    impl QueueBackend for RecordingQueue {
        fn kind(&self) -> BackendKind {
            BackendKind::Memory
        }

        async fn publish(&self, topic: &Topic, envelope: &Envelope) -> Result<MessageId, TransportError> {
            self.published.lock().push((topic.clone(), envelope.clone()));
            self.inner.publish(topic, envelope).await
        }

        async fn receive(
            &self,
            topic: &Topic,
            max_messages: usize,
            wait: Duration,
        ) -> Result<Vec<Delivery>, TransportError> {
            self.inner.receive(topic, max_messages, wait).await
        }

        async fn ack(&self, handle: &AckHandle) -> Result<(), TransportError> {
            self.inner.ack(handle).await
        }

        async fn nack(&self, handle: &AckHandle) -> Result<(), TransportError> {
            self.inner.nack(handle).await
        }

        async fn depth(&self, topic: &Topic) -> Option<u64> {
            self.inner.depth(topic).await
        }
    }

    /// Provider answering from a script, then succeeding.
    #[derive(Default)]
    struct ScriptedProvider {
        script: Mutex<VecDeque<Result<MetricDetails, ProviderError>>>,
        calls: AtomicUsize,
    }

    impl ScriptedProvider {
        fn with_script(results: Vec<Result<MetricDetails, ProviderError>>) -> Self {
            Self {
                script: Mutex::new(results.into()),
                calls: AtomicUsize::new(0),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ProviderApi for ScriptedProvider {
        fn provider(&self) -> &str {
            "fitbit"
        }

        async fn fetch_details(
            &self,
            request: &FetchRequest,
            _access_token: &str,
        ) -> Result<MetricDetails, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.script.lock().pop_front().unwrap_or_else(|| {
                let mut details = MetricDetails::default();
                details.insert("steps", vec![MetricPoint::new(request.date.clone(), 8042.0)]);
                Ok(details)
            })
        }
    }

    struct Harness {
        queue: Arc<RecordingQueue>,
        topics: TopicSet,
        provider: Arc<ScriptedProvider>,
        dedupe: Arc<MemoryDedupeStore>,
        records: Arc<MemoryRecordStore>,
        worker: Worker,
    }

    fn harness(provider: ScriptedProvider, max_retries: u32) -> Harness {
        let queue = Arc::new(RecordingQueue::default());
        let topics = TopicSet::for_domain("fitbit");
        let provider = Arc::new(provider);
        let dedupe = Arc::new(MemoryDedupeStore::default());
        let records = Arc::new(MemoryRecordStore::new());

        let mut providers = ProviderRegistry::new();
        providers.register(provider.clone());

        let pipeline = Pipeline::standard(
            PipelineDeps {
                dedupe: dedupe.clone(),
                records: records.clone(),
                providers: Arc::new(providers),
                credentials: Arc::new(StaticCredentials::new().with_fallback("fitbit", "tok")),
                auth_failures: Arc::new(LogAuthFailures),
            },
            Timing::disabled(),
        );
        let router = RetryRouter::new(queue.clone(), topics.clone(), max_retries);
        let worker = Worker::new(queue.clone(), topics.clone(), pipeline, router, dedupe.clone())
            .with_options(ConsumeOptions {
                batch_size: 10,
                wait: Duration::from_millis(20),
            });

        Harness {
            queue,
            topics,
            provider,
            dedupe,
            records,
            worker,
        }
    }

    fn event(date: &str) -> RawEvent {
        RawEvent::new(
            "fitbit",
            "42",
            "activities",
            date,
            json!({"collectionType": "activities", "date": date, "subscriptionId": "42-activities"}),
        )
    }

    impl Harness {
        async fn submit(&self, event: RawEvent) -> Envelope {
            let envelope = Envelope::new(event, &self.topics.raw);
            self.queue.publish(&self.topics.raw, &envelope).await.unwrap();
            envelope
        }
    }

    #[tokio::test]
    async fn test_transient_failures_then_success() {
        let h = harness(
            ScriptedProvider::with_script(vec![
                Err(ProviderError::Transient("429 Too Many Requests".into())),
                Err(ProviderError::Transient("503 Service Unavailable".into())),
            ]),
            3,
        );
        let original = h.submit(event("2026-02-01")).await;

        assert_eq!(h.worker.process_available().await, 3);

        let retries = h.queue.published_to(&h.topics.retry);
        assert_eq!(retries.iter().map(Envelope::attempt).collect::<Vec<_>>(), vec![1, 2]);
        assert!(retries.iter().all(|e| e.id() == original.id()));
        assert!(h.queue.published_to(&h.topics.dlq).is_empty());

        assert_eq!(h.records.writes(), 1);
        let key = DedupeKey::for_event(original.event());
        assert_eq!(h.records.get(key.as_str()).unwrap().attempt, 2);
        assert!(h.dedupe.is_completed(&key));

        let stats = h.worker.health().snapshot();
        assert_eq!(stats.processed, 1);
        assert_eq!(stats.retried, 2);
        assert_eq!(stats.dead_lettered, 0);
        assert_eq!(h.queue.inner.in_flight(&h.topics.raw), 0);
        assert_eq!(h.queue.inner.in_flight(&h.topics.retry), 0);
    }

    #[tokio::test]
    async fn test_parse_error_goes_straight_to_dlq() {
        let h = harness(ScriptedProvider::default(), 3);
        let original = h.submit(event("not-a-date")).await;

        h.worker.process_available().await;

        assert!(h.queue.published_to(&h.topics.retry).is_empty());
        let dead = h.queue.published_to(&h.topics.dlq);
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].attempt(), 0);
        assert_eq!(dead[0].last_error().unwrap().kind, "ParseError");
        assert_eq!(dead[0].last_error().unwrap().stage, "parse");
        assert_eq!(dead[0].event().payload, original.event().payload);

        assert_eq!(h.provider.calls(), 0);
        assert!(h.records.is_empty());
        // Dead-lettered messages stay on the DLQ topic for inspection.
        assert_eq!(h.queue.inner.len(&h.topics.dlq), 1);
    }

    #[tokio::test]
    async fn test_duplicate_notification_is_acked_without_fetching() {
        let h = harness(ScriptedProvider::default(), 3);
        h.submit(event("2026-02-01")).await;
        h.submit(event("2026-02-01")).await;

        h.worker.process_available().await;

        assert_eq!(h.provider.calls(), 1);
        assert_eq!(h.records.writes(), 1);
        let stats = h.worker.health().snapshot();
        assert_eq!(stats.processed, 1);
        assert_eq!(stats.duplicates, 1);
        assert_eq!(h.queue.inner.in_flight(&h.topics.raw), 0);
        assert!(h.queue.inner.is_empty(&h.topics.raw));
    }

    #[tokio::test]
    async fn test_exhausted_retries_dead_letter_and_release_claim() {
        let h = harness(
            ScriptedProvider::with_script(vec![
                Err(ProviderError::Transient("timeout".into())),
                Err(ProviderError::Transient("timeout".into())),
                Err(ProviderError::Transient("timeout".into())),
            ]),
            2,
        );
        let original = h.submit(event("2026-02-01")).await;

        h.worker.process_available().await;

        let retries = h.queue.published_to(&h.topics.retry);
        assert_eq!(retries.iter().map(Envelope::attempt).collect::<Vec<_>>(), vec![1, 2]);
        let dead = h.queue.published_to(&h.topics.dlq);
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].attempt(), 2);
        assert_eq!(dead[0].last_error().unwrap().kind, "TransientProviderError");
        assert!(h.records.is_empty());

        // The claim was dropped, so a fresh notification is not a duplicate.
        let key = DedupeKey::for_event(original.event());
        assert_eq!(
            h.dedupe.check_and_set(&key, Uuid::new_v4()).await.unwrap(),
            DedupeStatus::Fresh
        );
    }

    #[tokio::test]
    async fn test_auth_error_is_not_retried() {
        let h = harness(
            ScriptedProvider::with_script(vec![Err(ProviderError::Auth("expired_token".into()))]),
            3,
        );
        h.submit(event("2026-02-01")).await;

        h.worker.process_available().await;

        assert!(h.queue.published_to(&h.topics.retry).is_empty());
        let dead = h.queue.published_to(&h.topics.dlq);
        assert_eq!(dead[0].last_error().unwrap().kind, "AuthError");
    }

    #[tokio::test]
    async fn test_run_until_shutdown() {
        let h = Arc::new(harness(ScriptedProvider::default(), 3));
        let shutdown = ShutdownSignal::new();

        let runner = {
            let h = h.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { h.worker.run(shutdown).await })
        };

        h.submit(event("2026-02-01")).await;
        h.submit(event("2026-02-02")).await;

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while h.records.len() < 2 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(h.records.len(), 2);
        assert!(h.worker.health().is_healthy());

        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(2), runner)
            .await
            .unwrap()
            .unwrap();
        assert!(!h.worker.health().is_healthy());
    }
}
