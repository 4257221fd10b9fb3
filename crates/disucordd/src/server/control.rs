//! External control signal for the lifecycle controller.
//!
//! A presentation layer (or the binary's signal handlers) flips the
//! desired-running flag and sets the endpoint; the controller samples both
//! every poll interval.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::watch;

use crate::config::Endpoint;

/// Cloneable handle carrying the desired-running flag and the endpoint.
#[derive(Debug, Clone)]
pub struct ControlHandle {
    inner: Arc<ControlInner>,
}

#[derive(Debug)]
struct ControlInner {
    running: AtomicBool,
    endpoint: watch::Sender<Endpoint>,
}

impl ControlHandle {
    /// Creates a handle with the flag off.
    pub fn new(endpoint: Endpoint) -> Self {
        let (endpoint, _) = watch::channel(endpoint);
        Self {
            inner: Arc::new(ControlInner {
                running: AtomicBool::new(false),
                endpoint,
            }),
        }
    }

    pub fn request_start(&self) {
        self.set_running(true);
    }

    pub fn request_stop(&self) {
        self.set_running(false);
    }

    pub fn set_running(&self, running: bool) {
        self.inner.running.store(running, Ordering::Release);
    }

    /// Flips the flag, returning the new value.
    pub fn toggle(&self) -> bool {
        !self.inner.running.fetch_xor(true, Ordering::AcqRel)
    }

    pub fn is_running_requested(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Sets the endpoint used by the next start. A running server keeps
    /// its current socket.
    pub fn set_endpoint(&self, endpoint: Endpoint) {
        self.inner.endpoint.send_replace(endpoint);
    }

    pub fn endpoint(&self) -> Endpoint {
        self.inner.endpoint.borrow().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_off() {
        let control = ControlHandle::new(Endpoint::default());
        assert!(!control.is_running_requested());
    }

    #[test]
    fn test_toggle() {
        let control = ControlHandle::new(Endpoint::default());
        assert!(control.toggle());
        assert!(control.is_running_requested());
        assert!(!control.toggle());
        assert!(!control.is_running_requested());
    }

    #[test]
    fn test_clones_share_state() {
        let control = ControlHandle::new(Endpoint::default());
        let other = control.clone();

        other.request_start();
        other.set_endpoint(Endpoint::new("0.0.0.0", 9999));

        assert!(control.is_running_requested());
        assert_eq!(control.endpoint(), Endpoint::new("0.0.0.0", 9999));

        control.request_stop();
        assert!(!other.is_running_requested());
    }
}
