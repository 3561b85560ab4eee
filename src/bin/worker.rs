//! Vitalflow worker.
//!
//! Consumes the raw and retry topics, runs every delivery through
//! parse -> dedupe -> fetch_details -> persist and routes failures to the
//! retry topic or the DLQ. Serves `/health` and `/metrics` on
//! `[worker] health_port`.
//!
//! ## Configuration
//!
//! `config/vitalflow.toml` (or `VITALFLOW_CONFIG`), overridden by the
//! environment: `QUEUE_BACKEND`, `WORKER_MAX_RETRIES`, `WORKER_BATCH_SIZE`,
//! `WORKER_POLL_SECONDS`, `WORKER_TIMING_*`, `LOG_LEVEL`, ... `RUST_LOG`
//! takes precedence over the configured log level.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use vitalflow::health::{self, WorkerHealth};
use vitalflow::instrument::Timing;
use vitalflow::pipeline::{Pipeline, PipelineDeps};
use vitalflow::provider::{FitbitClient, LogAuthFailures, ProviderRegistry, StaticCredentials};
use vitalflow::queue::{self, ConsumeOptions};
use vitalflow::router::RetryRouter;
use vitalflow::shutdown::ShutdownSignal;
use vitalflow::store;
use vitalflow::worker::Worker;
use vitalflow::VitalflowConfig;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    let config = VitalflowConfig::load()?;
    vitalflow::init_logging(&config.logging.level);

    let topics = config.topics();
    info!(
        backend = %config.queue.backend,
        raw = %topics.raw,
        retry = %topics.retry,
        dlq = %topics.dlq,
        max_retries = config.worker.max_retries,
        "Vitalflow worker starting"
    );

    // Init failures end the process here unless fallback_to_memory is set.
    let queue = queue::connect(&config.queue, &topics).await?;
    let (dedupe, records) = store::from_config(&config).await?;

    let mut providers = ProviderRegistry::new();
    providers.register(Arc::new(FitbitClient::from_config(&config.provider.fitbit)));

    let timing = Timing::from_config(&config.timing);
    let pipeline = Pipeline::standard(
        PipelineDeps {
            dedupe: dedupe.clone(),
            records,
            providers: Arc::new(providers),
            credentials: Arc::new(StaticCredentials::from_fitbit_config(&config.provider.fitbit)),
            auth_failures: Arc::new(LogAuthFailures),
        },
        timing,
    );

    let shutdown = ShutdownSignal::new();
    tokio::spawn(shutdown.clone().listen());

    // A backoff wait must not outlast the health staleness window.
    let health = Arc::new(WorkerHealth::for_poll_wait(config.worker.poll_wait()));
    let router = RetryRouter::new(queue.clone(), topics.clone(), config.worker.max_retries)
        .with_retry_backoff(Duration::from_millis(config.worker.retry_backoff_ms))
        .with_max_backoff(health.stale_after() / 2)
        .with_shutdown(shutdown.clone());

    let worker = Worker::new(queue, topics, pipeline, router, dedupe)
        .with_options(ConsumeOptions {
            batch_size: config.worker.batch_size,
            wait: config.worker.poll_wait(),
        })
        .with_health(health.clone());

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.worker.health_port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "Health endpoint listening");

    let health_shutdown = shutdown.clone();
    let health_server = tokio::spawn(async move {
        let result = axum::serve(listener, health::router(health))
            .with_graceful_shutdown(async move { health_shutdown.recv().await })
            .await;
        if let Err(e) = result {
            error!(error = %e, "Health server failed");
        }
    });

    worker.run(shutdown.clone()).await;

    if tokio::time::timeout(shutdown.timeout(), health_server).await.is_err() {
        error!("Health server did not stop in time");
    }

    info!("Worker shutdown complete");
    Ok(())
}
