//! Graceful Shutdown Handler
//!
//! Coordinates teardown of a role handler: one signal fans out to every
//! session task, and `stop()` waits for the sessions to drain.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::Notify;

/// Shutdown coordinator shared by a handler and its sessions.
#[derive(Clone)]
pub struct ShutdownController {
    initiated: Arc<AtomicBool>,
    active_sessions: Arc<AtomicUsize>,
    signal_tx: broadcast::Sender<()>,
    drained: Arc<Notify>,
}

impl ShutdownController {
    pub fn new() -> Self {
        let (signal_tx, _) = broadcast::channel(1);
        Self {
            initiated: Arc::new(AtomicBool::new(false)),
            active_sessions: Arc::new(AtomicUsize::new(0)),
            signal_tx,
            drained: Arc::new(Notify::new()),
        }
    }

    /// Subscribe to the shutdown signal.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.signal_tx.subscribe()
    }

    /// Resolve once shutdown has been initiated (immediately if it already was).
    pub async fn cancelled(&self) {
        let mut rx = self.signal_tx.subscribe();
        if self.is_shutdown() {
            return;
        }
        let _ = rx.recv().await;
    }

    /// Initiate shutdown. Idempotent.
    pub fn shutdown(&self) {
        if !self.initiated.swap(true, Ordering::SeqCst) {
            tracing::debug!(
                "shutdown signalled with {} active sessions",
                self.active_sessions()
            );
            let _ = self.signal_tx.send(());
            if self.active_sessions() == 0 {
                self.drained.notify_waiters();
            }
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.initiated.load(Ordering::SeqCst)
    }

    pub fn active_sessions(&self) -> usize {
        self.active_sessions.load(Ordering::SeqCst)
    }

    fn session_ended(&self) {
        let prev = self.active_sessions.fetch_sub(1, Ordering::SeqCst);
        if prev == 1 && self.is_shutdown() {
            self.drained.notify_waiters();
        }
    }

    /// Wait until every session guard is dropped, up to `timeout`.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let drained = self.drained.notified();
        tokio::pin!(drained);
        drained.as_mut().enable();

        if self.active_sessions() == 0 {
            return true;
        }

        tokio::select! {
            _ = drained => true,
            _ = tokio::time::sleep(timeout) => {
                tracing::warn!(
                    "drain timeout: {} sessions still active",
                    self.active_sessions()
                );
                false
            }
        }
    }

    /// Track a session until the returned guard is dropped.
    pub fn session_guard(&self) -> SessionGuard {
        self.active_sessions.fetch_add(1, Ordering::SeqCst);
        SessionGuard {
            controller: self.clone(),
        }
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard for one live session.
pub struct SessionGuard {
    controller: ShutdownController,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.controller.session_ended();
    }
}

/// Wait for Ctrl+C or SIGTERM, then signal the controller.
#[cfg_attr(coverage_nightly, coverage(off))]
pub async fn shutdown_signal(controller: ShutdownController) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received Ctrl+C, shutting down"),
        _ = terminate => tracing::info!("received SIGTERM, shutting down"),
    }

    controller.shutdown();
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn test_shutdown_is_idempotent() {
        let controller = ShutdownController::new();
        assert!(!controller.is_shutdown());

        controller.shutdown();
        controller.shutdown();
        assert!(controller.is_shutdown());
    }

    #[test]
    fn test_session_guards() {
        let controller = ShutdownController::default();
        let a = controller.session_guard();
        let b = controller.session_guard();
        assert_eq!(controller.active_sessions(), 2);

        drop(a);
        assert_eq!(controller.active_sessions(), 1);
        drop(b);
        assert_eq!(controller.active_sessions(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_after_shutdown() {
        let controller = ShutdownController::new();
        controller.shutdown();

        let result = tokio::time::timeout(Duration::from_millis(100), controller.cancelled()).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_cancelled_wakes_waiter() {
        let controller = ShutdownController::new();
        let waiter = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.cancelled().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        controller.shutdown();

        let result = tokio::time::timeout(Duration::from_millis(200), waiter).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_wait_for_drain_with_sessions() {
        let controller = ShutdownController::new();
        let guard = controller.session_guard();
        controller.shutdown();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            drop(guard);
        });

        assert!(controller.wait_for_drain(Duration::from_millis(500)).await);
    }

    #[tokio::test]
    async fn test_wait_for_drain_timeout() {
        let controller = ShutdownController::new();
        let _guard = controller.session_guard();
        controller.shutdown();

        assert!(!controller.wait_for_drain(Duration::from_millis(30)).await);
    }
}
