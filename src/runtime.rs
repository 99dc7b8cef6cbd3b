//! Graceful shutdown coordination for the HTTP server
use std::future::Future;
use tokio::signal;
use tokio::sync::watch;

/// Shutdown signal shared by the server and whoever may stop it
/// (Ctrl+C, tests, an embedding application)
#[derive(Clone)]
pub struct ServerRuntime {
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ServerRuntime {
    pub fn new() -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Receiver that flips to `true` once shutdown starts
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    /// Trigger a programmatic shutdown
    pub fn trigger_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    /// Future for axum's `with_graceful_shutdown()`: completes on Ctrl+C
    /// (when `ctrl_c` is set) or on `trigger_shutdown`
    pub fn create_shutdown_future(&self, ctrl_c: bool) -> impl Future<Output = ()> + Send + 'static {
        let mut shutdown_rx = self.shutdown_rx.clone();

        async move {
            let programmatic = async {
                while !*shutdown_rx.borrow() {
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
            };
            if ctrl_c {
                tokio::select! {
                    _ = signal::ctrl_c() => {
                        log::info!("Shutdown signal (Ctrl+C) received...");
                    }
                    _ = programmatic => {
                        log::info!("Shutdown requested...");
                    }
                }
            } else {
                programmatic.await;
            }
        }
    }
}

impl Default for ServerRuntime {
    fn default() -> Self {
        Self::new()
    }
}
