//! Vitalflow intake server.
//!
//! Accepts provider webhooks and queues them on the raw topic. Processing
//! happens in the `worker` binary.
//!
//! ## Endpoints
//!
//! - `GET /webhooks/:provider?verify=<code>`: subscriber verification (204 / 404)
//! - `POST /webhooks/:provider`: queue notifications, 202 with a receipt
//! - `GET /health`, `GET /metrics`

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

use vitalflow::intake::{IntakeAdapter, IntakeError};
use vitalflow::queue::{self, SharedQueue};
use vitalflow::shutdown::ShutdownSignal;
use vitalflow::VitalflowConfig;

struct Metrics {
    webhooks_received: AtomicU64,
    notifications_queued: AtomicU64,
    start_time: Instant,
}

impl Metrics {
    fn new() -> Self {
        Self {
            webhooks_received: AtomicU64::new(0),
            notifications_queued: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }
}

#[derive(Clone)]
struct AppState {
    intake: Arc<IntakeAdapter>,
    queue: SharedQueue,
    metrics: Arc<Metrics>,
}

#[derive(Debug, Deserialize)]
struct VerifyQuery {
    verify: Option<String>,
}

fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(get_metrics))
        .route("/webhooks/:provider", get(verify_subscriber).post(receive_webhook))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    let config = VitalflowConfig::load()?;
    vitalflow::init_logging(&config.logging.level);

    let topics = config.topics();
    let queue = queue::connect(&config.queue, &topics).await?;

    let intake = IntakeAdapter::new(queue.clone(), topics.raw.clone())
        .with_verification_codes(&config.provider.fitbit.verification_codes);

    let state = AppState {
        intake: Arc::new(intake),
        queue: queue.clone(),
        metrics: Arc::new(Metrics::new()),
    };

    let shutdown = ShutdownSignal::new();
    tokio::spawn(shutdown.clone().listen());

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, topic = %topics.raw, "Vitalflow intake listening");

    let server_shutdown = shutdown.clone();
    axum::serve(listener, app(state))
        .with_graceful_shutdown(async move { server_shutdown.recv().await })
        .await?;

    queue.close().await;
    info!("Intake server stopped");
    Ok(())
}

async fn health_check(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "status": "ok", "backend": state.queue.kind().as_str() }))
}

async fn get_metrics(State(state): State<AppState>) -> Json<Value> {
    let uptime = state.metrics.start_time.elapsed().as_secs();
    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": uptime,
        "webhooks": {
            "received": state.metrics.webhooks_received.load(Ordering::Relaxed),
            "queued": state.metrics.notifications_queued.load(Ordering::Relaxed),
        },
        "queue_depth": state.queue.depth(state.intake.topic()).await,
        "status": "running"
    }))
}

async fn verify_subscriber(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    Query(query): Query<VerifyQuery>,
) -> StatusCode {
    let fitbit = provider.eq_ignore_ascii_case("fitbit");
    if fitbit && state.intake.is_valid_verification_code(query.verify.as_deref()) {
        StatusCode::NO_CONTENT
    } else {
        warn!(provider = %provider, "Subscriber verification rejected");
        StatusCode::NOT_FOUND
    }
}

async fn receive_webhook(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    state.metrics.webhooks_received.fetch_add(1, Ordering::Relaxed);

    match state.intake.ingest(&provider, &body).await {
        Ok(receipt) => {
            state
                .metrics
                .notifications_queued
                .fetch_add(receipt.queued as u64, Ordering::Relaxed);
            (StatusCode::ACCEPTED, Json(receipt)).into_response()
        }
        Err(IntakeError::Unsupported(p)) => (
            StatusCode::NOT_IMPLEMENTED,
            Json(json!({
                "status": "not_supported",
                "provider": p.as_str(),
                "detail": format!("{} push webhook flow is not configured in this service", p),
            })),
        )
            .into_response(),
        Err(e @ IntakeError::UnknownProvider(_)) => {
            (StatusCode::NOT_FOUND, Json(json!({ "error": e.to_string() }))).into_response()
        }
        Err(e @ IntakeError::Transport(_)) => {
            error!(provider = %provider, error = %e, "Failed to queue webhook");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}
