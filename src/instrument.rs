//! Timing instrumentation.
//!
//! [`Timing::measure`] wraps a fallible future and emits one structured log
//! line when it finishes: at the configured level on success, at `warn` when
//! the call ran past the slow threshold, at `error` when it failed. The
//! wrapped result is passed through untouched.

use std::fmt::Display;
use std::future::Future;
use std::str::FromStr;
use std::time::{Duration, Instant};
use tracing::Level;

use crate::config::TimingConfig;

#[derive(Debug, Clone)]
pub struct Timing {
    enabled: bool,
    level: Level,
    slow_threshold: Option<Duration>,
}

impl Timing {
    pub fn new(enabled: bool, level: Level, slow_threshold: Option<Duration>) -> Self {
        Self {
            enabled,
            level,
            slow_threshold,
        }
    }

    /// No timing logs at all.
    pub fn disabled() -> Self {
        Self::new(false, Level::INFO, None)
    }

    pub fn from_config(config: &TimingConfig) -> Self {
        // Unknown names were rejected by config validation already.
        let level = Level::from_str(&config.log_level).unwrap_or(Level::INFO);
        let threshold = (config.warn_ms > 0).then(|| Duration::from_millis(config.warn_ms));
        Self::new(config.enabled, level, threshold)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Level of a successful call's timing line; slow calls go to `warn`.
    fn level_for(&self, elapsed: Duration) -> Level {
        if self.is_slow(elapsed) {
            Level::WARN
        } else {
            self.level
        }
    }

    fn is_slow(&self, elapsed: Duration) -> bool {
        self.slow_threshold.is_some_and(|t| elapsed >= t)
    }

    /// Time `fut`, log the outcome, return its result unchanged.
    pub async fn measure<T, E, Fut>(&self, operation: &str, fut: Fut) -> Result<T, E>
    where
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        self.measure_unless(operation, fut, |_| false).await
    }

    /// Like [`Timing::measure`], but errors for which `quiet` returns true are
    /// passed through without a timing line.
    pub async fn measure_unless<T, E, Fut, Q>(&self, operation: &str, fut: Fut, quiet: Q) -> Result<T, E>
    where
        Fut: Future<Output = Result<T, E>>,
        E: Display,
        Q: FnOnce(&E) -> bool,
    {
        if !self.enabled {
            return fut.await;
        }

        let started = Instant::now();
        let result = fut.await;
        let elapsed = started.elapsed();
        let duration_ms = elapsed.as_secs_f64() * 1000.0;

        match &result {
            Ok(_) => {
                emit(self.level_for(elapsed), operation, duration_ms, self.is_slow(elapsed));
            }
            Err(e) if quiet(e) => {}
            Err(e) => {
                tracing::error!(
                    operation = operation,
                    duration_ms = duration_ms,
                    status = "error",
                    error = %e,
                    "timing"
                );
            }
        }

        result
    }
}

impl Default for Timing {
    fn default() -> Self {
        Self::from_config(&TimingConfig::default())
    }
}

fn emit(level: Level, operation: &str, duration_ms: f64, slow: bool) {
    macro_rules! timing_line {
        ($mac:ident) => {
            tracing::$mac!(
                operation = operation,
                duration_ms = duration_ms,
                status = "ok",
                slow = slow,
                "timing"
            )
        };
    }

    match level {
        Level::TRACE => timing_line!(trace),
        Level::DEBUG => timing_line!(debug),
        Level::INFO => timing_line!(info),
        Level::WARN => timing_line!(warn),
        _ => timing_line!(error),
    }
}
