//! Stop signalling for long-running background services.

use std::sync::Arc;

use tokio::sync::watch;

/// A handle to stop a background service.
///
/// This is a lightweight, cloneable handle that can be used to stop a
/// service from any task. Every clone shares the same signal.
#[derive(Debug, Clone)]
pub struct ServiceHandle {
    name: &'static str,
    stop_signal: Arc<watch::Sender<bool>>,
}

impl ServiceHandle {
    /// Create a new handle for the named service.
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        let (stop_signal, _) = watch::channel(false);
        Self {
            name,
            stop_signal: Arc::new(stop_signal),
        }
    }

    /// Name of the service this handle controls.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Signal the service to stop.
    pub fn stop(&self) {
        self.stop_signal.send_replace(true);
    }

    /// Check if the stop signal has been sent.
    #[must_use]
    pub fn should_stop(&self) -> bool {
        *self.stop_signal.borrow()
    }

    /// Resolve once the stop signal has been sent.
    pub async fn stopped(&self) {
        let mut rx = self.stop_signal.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = rx.wait_for(|stop| *stop).await;
    }
}
