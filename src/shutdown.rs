// Graceful shutdown handling for signal trapping

use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

use crate::models::JobId;

/// Shared shutdown state across the application
#[derive(Clone)]
pub struct ShutdownState {
    shutdown_requested: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl ShutdownState {
    pub fn new() -> Self {
        Self {
            shutdown_requested: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Request a shutdown and wake everyone waiting for one
    pub fn request_shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
        log::info!("Shutdown requested");
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    /// Resolves once shutdown has been requested, immediately if it already was
    pub async fn wait(&self) {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        // Register before checking the flag so a concurrent request is not lost
        notified.as_mut().enable();
        if self.is_shutdown_requested() {
            return;
        }
        notified.await;
    }
}

impl Default for ShutdownState {
    fn default() -> Self {
        Self::new()
    }
}

/// Result of graceful shutdown cleanup
#[derive(Debug, Clone, Default)]
pub struct ShutdownResult {
    /// Jobs that were live and have been cancelled
    pub jobs_cancelled: Vec<JobId>,
    /// Any errors encountered during cleanup
    pub errors: Vec<String>,
}

impl ShutdownResult {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if shutdown was clean (no errors)
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn log_summary(&self) {
        log::info!(
            "Shutdown complete: {} jobs cancelled",
            self.jobs_cancelled.len()
        );
        for error in &self.errors {
            log::warn!("Cleanup error: {}", error);
        }
    }
}

/// Register signal handlers for graceful shutdown
/// This sets up handlers for SIGINT (Ctrl+C), SIGTERM, and SIGHUP
#[cfg(unix)]
pub fn register_signal_handlers(state: ShutdownState) -> Result<()> {
    use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;
    use std::thread;

    let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP])
        .map_err(|e| anyhow::anyhow!("Failed to register signal handlers: {}", e))?;

    thread::spawn(move || {
        for signal in signals.forever() {
            match signal {
                SIGINT => log::info!("Received SIGINT (Ctrl+C)"),
                SIGTERM => log::info!("Received SIGTERM"),
                SIGHUP => log::info!("Received SIGHUP"),
                _ => continue,
            }
            state.request_shutdown();
        }
    });

    log::info!("Signal handlers registered (SIGINT, SIGTERM, SIGHUP)");
    Ok(())
}

/// Register signal handlers for Windows
#[cfg(windows)]
pub fn register_signal_handlers(state: ShutdownState) -> Result<()> {
    ctrlc::set_handler(move || {
        log::info!("Received Ctrl+C");
        state.request_shutdown();
    })
    .map_err(|e| anyhow::anyhow!("Failed to register Ctrl+C handler: {}", e))?;

    log::info!("Signal handler registered (Ctrl+C)");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_shutdown_state_clone_shares_flag() {
        let state1 = ShutdownState::new();
        let state2 = state1.clone();
        assert!(!state2.is_shutdown_requested());

        state1.request_shutdown();
        assert!(state2.is_shutdown_requested());
    }

    #[tokio::test]
    async fn test_wait_wakes_on_request() {
        let state = ShutdownState::new();
        let waiter = {
            let state = state.clone();
            tokio::spawn(async move { state.wait().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        state.request_shutdown();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_after_request_returns_immediately() {
        let state = ShutdownState::new();
        state.request_shutdown();
        tokio::time::timeout(Duration::from_millis(100), state.wait())
            .await
            .unwrap();
    }

    #[test]
    fn test_shutdown_result_is_clean() {
        let mut result = ShutdownResult::new();
        assert!(result.is_clean());

        result.errors.push("Some error".to_string());
        assert!(!result.is_clean());
    }
}
