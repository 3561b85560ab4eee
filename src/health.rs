//! Worker liveness and counters.
//!
//! The worker loop updates a shared [`WorkerHealth`]; [`router`] exposes it
//! over HTTP:
//!
//! - `GET /health`: 200 while the loop is consuming and polled recently, else 503
//! - `GET /metrics`: counters and uptime as JSON

use axum::{extract::State, http::StatusCode, response::Json, routing::get, Router};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Shared worker state. Cheap to update from the hot loop.
pub struct WorkerHealth {
    consuming: AtomicBool,
    last_poll: Mutex<Option<Instant>>,
    /// A poll older than this marks the worker unhealthy
    stale_after: Duration,
    start_time: Instant,
    processed: AtomicU64,
    duplicates: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
    transport_errors: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HealthSnapshot {
    pub processed: u64,
    pub duplicates: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub transport_errors: u64,
}

impl WorkerHealth {
    pub fn new(stale_after: Duration) -> Self {
        Self {
            consuming: AtomicBool::new(false),
            last_poll: Mutex::new(None),
            stale_after,
            start_time: Instant::now(),
            processed: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
            retried: AtomicU64::new(0),
            dead_lettered: AtomicU64::new(0),
            transport_errors: AtomicU64::new(0),
        }
    }

    /// Stale threshold derived from the poll wait: a few missed polls.
    pub fn for_poll_wait(wait: Duration) -> Self {
        Self::new((wait * 3).max(Duration::from_secs(10)))
    }

    pub fn stale_after(&self) -> Duration {
        self.stale_after
    }

    pub fn set_consuming(&self, consuming: bool) {
        self.consuming.store(consuming, Ordering::Relaxed);
    }

    pub fn record_poll(&self) {
        *self.last_poll.lock() = Some(Instant::now());
    }

    pub fn record_processed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_duplicate(&self) {
        self.duplicates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retried(&self) {
        self.retried.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dead_lettered(&self) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_transport_error(&self) {
        self.transport_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn is_healthy(&self) -> bool {
        if !self.consuming.load(Ordering::Relaxed) {
            return false;
        }
        self.last_poll
            .lock()
            .is_some_and(|at| at.elapsed() <= self.stale_after)
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            transport_errors: self.transport_errors.load(Ordering::Relaxed),
        }
    }
}

impl Default for WorkerHealth {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

/// `/health` and `/metrics` for a worker.
pub fn router(health: Arc<WorkerHealth>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(get_metrics))
        .with_state(health)
}

async fn health_check(State(health): State<Arc<WorkerHealth>>) -> (StatusCode, Json<Value>) {
    let last_poll_ms = (*health.last_poll.lock()).map(|at| at.elapsed().as_millis() as u64);

    if health.is_healthy() {
        (
            StatusCode::OK,
            Json(json!({ "status": "ok", "last_poll_ms": last_poll_ms })),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "unavailable",
                "consuming": health.consuming.load(Ordering::Relaxed),
                "last_poll_ms": last_poll_ms,
            })),
        )
    }
}

async fn get_metrics(State(health): State<Arc<WorkerHealth>>) -> Json<Value> {
    let uptime = health.uptime_seconds();
    let counters = health.snapshot();

    let uptime_str = if uptime < 60 {
        format!("{}s", uptime)
    } else if uptime < 3600 {
        format!("{}m {}s", uptime / 60, uptime % 60)
    } else {
        format!("{}h {}m {}s", uptime / 3600, (uptime % 3600) / 60, uptime % 60)
    };

    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": uptime,
        "uptime": uptime_str,
        "messages": {
            "processed": counters.processed,
            "duplicates": counters.duplicates,
            "retried": counters.retried,
            "dead_lettered": counters.dead_lettered,
        },
        "transport_errors": counters.transport_errors,
        "status": if health.is_healthy() { "running" } else { "stalled" },
    }))
}
