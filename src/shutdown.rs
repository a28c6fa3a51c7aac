//! Cooperative shutdown for the supervisor.
//!
//! One cluster monitor loop runs per process, so coordination stays small:
//! a broadcast channel carries the stop signal and an atomic records that
//! it fired, for code that polls between steps rather than awaiting.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;

/// Hands out stop receivers and fires the stop signal exactly once.
#[derive(Clone)]
pub struct ShutdownCoordinator {
    tx: broadcast::Sender<()>,
    triggered: Arc<AtomicBool>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1);
        Self {
            tx,
            triggered: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A receiver that resolves when [`shutdown`](Self::shutdown) fires.
    /// Take one per loop that must stop.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx.subscribe()
    }

    /// Non-blocking check for loops that only look between steps.
    pub fn is_shutting_down(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    /// Fire the stop signal. Later calls are no-ops.
    pub fn shutdown(&self) {
        if !self.triggered.swap(true, Ordering::SeqCst) {
            info!("Shutdown requested");
            let _ = self.tx.send(());
        }
    }

    /// Block until the stop signal fires. Returns immediately when it
    /// already has.
    pub async fn wait_for_shutdown(&self) {
        let mut rx = self.subscribe();
        if self.is_shutting_down() {
            return;
        }
        // Lagged or closed both mean the signal fired.
        let _ = rx.recv().await;
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// Wait for an OS termination signal, then trigger the coordinator.
/// Meant to run as its own task next to the monitor loop.
#[cfg(unix)]
pub async fn listen_for_signals(coordinator: ShutdownCoordinator) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("Failed to install SIGINT handler");

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM"),
        _ = sigint.recv() => info!("Received SIGINT"),
    }

    coordinator.shutdown();
}

#[cfg(not(unix))]
pub async fn listen_for_signals(coordinator: ShutdownCoordinator) {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    info!("Received Ctrl+C");
    coordinator.shutdown();
}
