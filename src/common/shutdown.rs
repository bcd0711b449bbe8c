//! Cooperative shutdown coordinator.
//!
//! Components hold a clone and race `wait()` against their work; calling
//! `shutdown()` resolves every pending and future wait. In-flight external
//! calls are allowed to finish on their own timeouts rather than being
//! aborted.

use std::sync::Arc;

use tokio::sync::watch;

#[derive(Clone)]
pub struct Shutdown {
    sender: Arc<watch::Sender<bool>>,
    receiver: watch::Receiver<bool>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            sender: Arc::new(tx),
            receiver: rx,
        }
    }

    /// Signal termination. Idempotent.
    pub fn shutdown(&self) {
        let _ = self.sender.send(true);
    }

    /// Whether shutdown has been signalled.
    pub fn is_terminated(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolves once shutdown is signalled.
    pub fn wait(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut rx = self.receiver.clone();
        async move {
            while !*rx.borrow_and_update() {
                if rx.changed().await.is_err() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_wait_resolves_after_signal() {
        let shutdown = Shutdown::new();
        let waiter = shutdown.wait();

        shutdown.shutdown();
        tokio::time::timeout(Duration::from_secs(1), waiter).await.expect("wait should resolve");
        assert!(shutdown.is_terminated());
    }

    #[tokio::test]
    async fn test_wait_after_signal_resolves_immediately() {
        let shutdown = Shutdown::new();
        shutdown.shutdown();
        tokio::time::timeout(Duration::from_secs(1), shutdown.wait()).await.expect("wait should resolve");
    }
}
