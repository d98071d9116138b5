use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::watch;

/// Broadcasts server shutdown to long-lived connections (WebSocket streams)
/// so they can send a close frame before the listener stops.
#[derive(Clone)]
pub struct ShutdownCoordinator {
    tx: Arc<watch::Sender<bool>>,
    active: Arc<AtomicUsize>,
}

/// Held by a connection for as long as it is open.
pub struct ConnectionGuard {
    active: Arc<AtomicUsize>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Track a new connection. The receiver flips to `true` on shutdown.
    pub fn register(&self) -> (ConnectionGuard, watch::Receiver<bool>) {
        self.active.fetch_add(1, Ordering::AcqRel);
        (
            ConnectionGuard {
                active: self.active.clone(),
            },
            self.tx.subscribe(),
        )
    }

    pub fn shutdown(&self) {
        tracing::debug!(connections = self.active_count(), "signalling shutdown");
        self.tx.send_replace(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guards_track_active_connections() {
        let coordinator = ShutdownCoordinator::new();
        let (a, _rx_a) = coordinator.register();
        let (b, _rx_b) = coordinator.register();
        assert_eq!(coordinator.active_count(), 2);
        drop(a);
        assert_eq!(coordinator.active_count(), 1);
        drop(b);
        assert_eq!(coordinator.active_count(), 0);
    }

    #[tokio::test]
    async fn shutdown_notifies_registered_receivers() {
        let coordinator = ShutdownCoordinator::new();
        let (_guard, mut rx) = coordinator.register();
        assert!(!*rx.borrow());

        let clone = coordinator.clone();
        tokio::spawn(async move { clone.shutdown() });

        rx.changed().await.unwrap();
        assert!(*rx.borrow());
        assert!(coordinator.is_shutting_down());
    }

    #[test]
    fn late_registrations_see_shutdown_immediately() {
        let coordinator = ShutdownCoordinator::new();
        coordinator.shutdown();
        let (_guard, rx) = coordinator.register();
        assert!(*rx.borrow());
    }
}
