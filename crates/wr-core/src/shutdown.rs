use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::info;

// ---------------------------------------------------------------------------
// ShutdownSignal — cooperative shutdown coordination
// ---------------------------------------------------------------------------

/// Broadcast-based shutdown coordinator.
///
/// Long-running loops `select!` on a subscribed receiver; short code
/// paths poll `is_shutting_down()`. A second, separate flag carries the
/// force-cancel escalation (e.g. a repeated SIGTERM) that soft-cancels
/// the in-flight activation.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    trigger: broadcast::Sender<()>,
    shutting_down: Arc<AtomicBool>,
    force_cancel: Arc<AtomicBool>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (trigger, _) = broadcast::channel(1);
        Self {
            trigger,
            shutting_down: Arc::new(AtomicBool::new(false)),
            force_cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.trigger.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Relaxed)
    }

    /// Begin graceful shutdown. Idempotent; the first call broadcasts.
    pub fn trigger(&self) {
        if self
            .shutting_down
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok()
        {
            info!(event = "shutdown", "shutdown signal triggered");
            let _ = self.trigger.send(());
        }
    }

    /// Escalate: cancel the in-flight activation instead of waiting for
    /// it. Implies `trigger()`.
    pub fn force_cancel(&self) {
        self.trigger();
        self.force_cancel.store(true, Ordering::SeqCst);
        info!("force cancel requested");
    }

    /// The flag the agent loop polls between iterations and tool calls.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.force_cancel.clone()
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn new_signal_is_idle() {
        let signal = ShutdownSignal::new();
        assert!(!signal.is_shutting_down());
        assert!(!signal.cancel_flag().load(Ordering::Relaxed));
    }

    #[test]
    fn trigger_is_idempotent() {
        let signal = ShutdownSignal::new();
        signal.trigger();
        signal.trigger();
        assert!(signal.is_shutting_down());
        assert!(!signal.cancel_flag().load(Ordering::Relaxed));
    }

    #[test]
    fn force_cancel_implies_shutdown() {
        let signal = ShutdownSignal::new();
        signal.force_cancel();
        assert!(signal.is_shutting_down());
        assert!(signal.cancel_flag().load(Ordering::Relaxed));
    }

    #[test]
    fn clones_share_state() {
        let signal = ShutdownSignal::new();
        let clone = signal.clone();
        signal.trigger();
        assert!(clone.is_shutting_down());
    }

    #[tokio::test]
    async fn subscribers_receive_trigger() {
        let signal = ShutdownSignal::new();
        let mut rx = signal.subscribe();
        signal.trigger();
        let received = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(received.is_ok());
    }
}
