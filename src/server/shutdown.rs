//! Coordinated shutdown.
//!
//! One controller triggers, any number of cloned signals observe. The
//! bootstrap listens for SIGTERM/SIGINT and fans the signal out to the
//! health server and the watch streams.

use tokio::sync::watch;
use tracing::info;

/// Receiver half; clone one per interested component
#[derive(Clone)]
pub struct ShutdownSignal {
    receiver: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// Resolve once shutdown is triggered (or the controller is dropped)
    pub async fn wait(&mut self) {
        while !*self.receiver.borrow() {
            if self.receiver.changed().await.is_err() {
                break;
            }
        }
    }

    pub fn is_shutdown(&self) -> bool {
        *self.receiver.borrow()
    }
}

/// Sender half, held by the bootstrap
pub struct ShutdownController {
    sender: watch::Sender<bool>,
}

impl ShutdownController {
    pub fn shutdown(&self) {
        let _ = self.sender.send(true);
        info!("Shutdown signal sent");
    }
}

pub fn shutdown_channel() -> (ShutdownController, ShutdownSignal) {
    let (sender, receiver) = watch::channel(false);
    (ShutdownController { sender }, ShutdownSignal { receiver })
}

/// Block until SIGTERM or SIGINT arrives; returns the signal name
#[cfg(unix)]
pub async fn wait_for_signal() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())
        .unwrap_or_else(|e| panic!("cannot register SIGTERM handler: {}", e));
    let mut sigint = signal(SignalKind::interrupt())
        .unwrap_or_else(|e| panic!("cannot register SIGINT handler: {}", e));

    tokio::select! {
        _ = sigterm.recv() => {
            info!("Received SIGTERM");
            "SIGTERM"
        }
        _ = sigint.recv() => {
            info!("Received SIGINT");
            "SIGINT"
        }
    }
}

/// Ctrl+C fallback for non-unix platforms
#[cfg(not(unix))]
pub async fn wait_for_signal() -> &'static str {
    if let Err(e) = tokio::signal::ctrl_c().await {
        panic!("cannot wait for Ctrl+C: {}", e);
    }
    info!("Received Ctrl+C");
    "CTRL_C"
}
