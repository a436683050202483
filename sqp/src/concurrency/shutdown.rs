//! Cooperative shutdown signal.
//!
//! The orchestrator observes the signal only at step boundaries, so a step that is already
//! running completes before the run stops.

use tokio::sync::watch;

/// Sending side of the shutdown signal.
#[derive(Debug, Clone)]
pub struct ShutdownTx(watch::Sender<bool>);

impl ShutdownTx {
    /// Requests shutdown. Returns `false` if shutdown had already been requested.
    pub fn shutdown(&self) -> bool {
        self.0.send_if_modified(|requested| {
            if *requested {
                return false;
            }
            *requested = true;
            true
        })
    }

    pub fn is_shutdown(&self) -> bool {
        *self.0.borrow()
    }

    pub fn subscribe(&self) -> ShutdownRx {
        ShutdownRx(self.0.subscribe())
    }
}

/// Receiving side of the shutdown signal.
#[derive(Debug, Clone)]
pub struct ShutdownRx(watch::Receiver<bool>);

impl ShutdownRx {
    pub fn is_shutdown(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once shutdown is requested, or immediately if it already was.
    pub async fn wait(&mut self) {
        // An error means every sender is gone and shutdown can no longer be requested.
        if self.0.wait_for(|requested| *requested).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Creates a shutdown channel in the running state.
pub fn create_shutdown_channel() -> (ShutdownTx, ShutdownRx) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTx(tx), ShutdownRx(rx))
}
