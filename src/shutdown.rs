//! Graceful shutdown handling

use std::sync::Arc;
use tokio::signal;
use tokio::sync::Notify;
use tracing::info;

/// Shutdown coordinator: owns the signal handling and fans the stop signal
/// out to the server, the IDF autosaver and anything else that subscribes.
pub struct ShutdownCoordinator {
    notify: Arc<Notify>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            notify: Arc::new(Notify::new()),
        }
    }

    /// Get a shutdown notifier
    pub fn subscribe(&self) -> ShutdownNotifier {
        ShutdownNotifier {
            notify: self.notify.clone(),
        }
    }

    /// Wait for SIGINT or SIGTERM, then notify all subscribers.
    pub async fn wait_for_signal(&self) {
        let ctrl_c = async {
            signal::ctrl_c()
                .await
                .expect("failed to install Ctrl+C handler");
        };

        #[cfg(unix)]
        let terminate = async {
            signal::unix::signal(signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                info!("received Ctrl+C signal");
            }
            _ = terminate => {
                info!("received SIGTERM signal");
            }
        }

        self.notify.notify_waiters();
    }

    /// Trigger shutdown manually
    pub fn shutdown(&self) {
        info!("manual shutdown triggered");
        self.notify.notify_waiters();
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// Shutdown notifier for components
#[derive(Clone)]
pub struct ShutdownNotifier {
    notify: Arc<Notify>,
}

impl ShutdownNotifier {
    /// Wait for the shutdown signal
    pub async fn wait(&self) {
        self.notify.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shutdown_reaches_subscribers() {
        let coordinator = ShutdownCoordinator::new();
        let notifier = coordinator.subscribe();

        let handle = tokio::spawn(async move {
            notifier.wait().await;
            true
        });

        // let the task reach its wait point before notifying
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        coordinator.shutdown();

        let result = tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .expect("subscriber not notified")
            .unwrap();
        assert!(result);
    }
}
