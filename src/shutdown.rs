//! Graceful shutdown coordination.
//!
//! A [`ShutdownSignal`] is cloned into every long-lived task the engine
//! spawns: dispatch lanes, the relay publisher and subscriber, and the
//! scheduler timers. When a termination signal arrives (or [`trigger`] is
//! called programmatically) every subscriber is released and the tasks stop
//! together.
//!
//! [`trigger`]: ShutdownSignal::trigger

use tokio::sync::broadcast;
use tracing::info;

/// Broadcast-based shutdown notification shared across engine tasks.
#[derive(Clone)]
pub struct ShutdownSignal {
    sender: broadcast::Sender<()>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1);
        Self { sender }
    }

    /// Blocks until SIGINT or SIGTERM, then notifies all subscribers.
    pub async fn wait(&self) {
        let ctrl_c = async {
            tokio::signal::ctrl_c()
                .await
                .expect("failed to install Ctrl+C handler");
        };

        #[cfg(unix)]
        let terminate = async {
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                info!("Received Ctrl+C, shutting down");
            }
            _ = terminate => {
                info!("Received SIGTERM, shutting down");
            }
        }

        let _ = self.sender.send(());
    }

    /// A receiver released when shutdown is triggered.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.sender.subscribe()
    }

    /// Triggers shutdown without an OS signal (tests, embedding).
    pub fn trigger(&self) {
        let _ = self.sender.send(());
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}
