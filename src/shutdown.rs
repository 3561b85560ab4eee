//! Graceful shutdown coordination.
//!
//! A [`ShutdownSignal`] is shared by every long-running component (intake
//! server, worker loop, health server). It fires once, either on SIGINT /
//! SIGTERM via [`ShutdownSignal::listen`] or programmatically via
//! [`ShutdownSignal::trigger`], and stays fired.
//!
//! # Example
//!
//! ```rust,ignore
//! let shutdown = ShutdownSignal::new();
//! tokio::spawn(shutdown.clone().listen());
//!
//! let worker_shutdown = shutdown.clone();
//! tokio::spawn(async move { worker.run(worker_shutdown).await });
//!
//! shutdown.recv().await;
//! ```

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

/// Default drain timeout in seconds.
const DEFAULT_SHUTDOWN_TIMEOUT: u64 = 30;

#[derive(Clone)]
pub struct ShutdownSignal {
    sender: Arc<watch::Sender<bool>>,
    timeout: Duration,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(DEFAULT_SHUTDOWN_TIMEOUT))
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
            timeout,
        }
    }

    /// How long components may take to drain after the signal fired.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Wait for SIGINT or SIGTERM, then fire the signal.
    pub async fn listen(self) {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to install Ctrl+C handler");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => info!("Received Ctrl+C, initiating graceful shutdown..."),
            _ = terminate => info!("Received SIGTERM, initiating graceful shutdown..."),
            _ = self.recv() => return,
        }

        self.sender.send_replace(true);
    }

    /// Fire the signal.
    pub fn trigger(&self) {
        if !self.sender.send_replace(true) {
            info!("Shutdown triggered programmatically");
        }
    }

    /// Non-blocking check.
    pub fn is_shutdown(&self) -> bool {
        *self.sender.borrow()
    }

    /// Resolve once the signal has fired (immediately if it already has).
    pub async fn recv(&self) {
        let mut receiver = self.sender.subscribe();
        // The sender lives in `self`, so the channel cannot close under us.
        let _ = receiver.wait_for(|fired| *fired).await;
    }

    /// Like [`recv`](Self::recv), giving up after `timeout`.
    ///
    /// Returns `true` if the signal fired in time.
    pub async fn wait_with_timeout(&self, timeout: Duration) -> bool {
        tokio::select! {
            _ = self.recv() => true,
            _ = tokio::time::sleep(timeout) => {
                warn!(timeout_secs = timeout.as_secs(), "Shutdown timeout reached");
                false
            }
        }
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_custom_timeout() {
        assert_eq!(ShutdownSignal::new().timeout(), Duration::from_secs(30));
        let signal = ShutdownSignal::with_timeout(Duration::from_secs(60));
        assert_eq!(signal.timeout(), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_manual_trigger() {
        let signal = ShutdownSignal::new();
        assert!(!signal.is_shutdown());

        let trigger_signal = signal.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger_signal.trigger();
        });

        let result = tokio::time::timeout(Duration::from_millis(500), signal.recv()).await;
        assert!(result.is_ok());
        assert!(signal.is_shutdown());
    }

    #[tokio::test]
    async fn test_late_subscriber_sees_fired_signal() {
        let signal = ShutdownSignal::new();
        signal.trigger();

        let clone = signal.clone();
        assert!(clone.is_shutdown());
        assert!(clone.wait_with_timeout(Duration::from_millis(50)).await);
    }

    #[tokio::test]
    async fn test_timeout_without_signal() {
        let signal = ShutdownSignal::new();
        assert!(!signal.wait_with_timeout(Duration::from_millis(10)).await);
    }
}
