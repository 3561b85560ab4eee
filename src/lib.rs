//! # Vitalflow
//!
//! Queue-first ingestion for wearable provider webhooks.
//!
//! ## Architecture
//!
//! ```text
//! webhook -> IntakeAdapter -> <domain>.notifications.raw
//!                                   │
//!                                   ▼
//!         Worker: parse -> dedupe -> fetch_details -> persist
//!                                   │ failure
//!                                   ▼
//!         RetryRouter -> <domain>.notifications.retry (back to the worker)
//!                     -> <domain>.notifications.dlq   (terminal, replayable)
//! ```
//!
//! ## Modules
//!
//! - [`queue`]: transport-neutral queue with memory, Redis Streams, Pub/Sub and SQS backends
//! - [`envelope`] / [`event`]: what travels through the queues
//! - [`intake`]: webhook bodies to raw-topic envelopes
//! - [`pipeline`]: the ordered processing stages
//! - [`router`]: retry / dead-letter decisions
//! - [`worker`]: the consume loop tying it together
//! - [`store`] / [`provider`]: dedupe index, record output and provider APIs
//! - [`dlq`]: inspection and replay of dead-lettered envelopes

pub mod config;
pub mod dlq;
pub mod envelope;
pub mod event;
pub mod health;
pub mod instrument;
pub mod intake;
pub mod pipeline;
pub mod provider;
pub mod queue;
pub mod record;
pub mod router;
pub mod shutdown;
pub mod store;
pub mod worker;

pub use config::VitalflowConfig;
pub use envelope::{Envelope, FailureRecord, Topic, TopicSet};
pub use event::{Provider, RawEvent};
pub use intake::{IntakeAdapter, IntakeReceipt};
pub use pipeline::{Pipeline, PipelineDeps, Stage, StageError};
pub use queue::{QueueBackend, SharedQueue, TransportError};
pub use router::{RetryRouter, RouteDecision};
pub use worker::Worker;

/// Install the tracing subscriber: `RUST_LOG` wins, else `level`.
pub fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    // A second init (tests, embedding) keeps the first subscriber.
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
