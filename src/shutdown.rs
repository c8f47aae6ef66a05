//! Graceful Shutdown Handler
//!
//! One shutdown request per process, fanned out to every loop holding a
//! [`ShutdownToken`]. The agent walks the phases below so the command
//! filter is removed from the node before the process exits.

use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Shutdown signal types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// Normal graceful shutdown (SIGTERM, SIGINT)
    Graceful,
    /// Urgent shutdown (SIGQUIT); the in-flight command is dropped
    Urgent,
    /// Coordinator dropped without a request
    Emergency,
}

impl std::fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownSignal::Graceful => write!(f, "graceful"),
            ShutdownSignal::Urgent => write!(f, "urgent"),
            ShutdownSignal::Emergency => write!(f, "emergency"),
        }
    }
}

/// Shutdown phase tracking
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPhase {
    /// Not shutting down
    Running,
    /// No new commands are started; the in-flight one may finish
    StoppingIntake,
    /// Removing the command filter from the node
    Unsubscribing,
    /// Shutdown complete
    Complete,
}

impl std::fmt::Display for ShutdownPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownPhase::Running => write!(f, "running"),
            ShutdownPhase::StoppingIntake => write!(f, "stopping_intake"),
            ShutdownPhase::Unsubscribing => write!(f, "unsubscribing"),
            ShutdownPhase::Complete => write!(f, "complete"),
        }
    }
}

/// Graceful shutdown coordinator
pub struct GracefulShutdown {
    signal_tx: watch::Sender<Option<ShutdownSignal>>,
    phase_tx: watch::Sender<ShutdownPhase>,
}

impl GracefulShutdown {
    pub fn new() -> Self {
        let (signal_tx, _) = watch::channel(None);
        let (phase_tx, _) = watch::channel(ShutdownPhase::Running);
        Self {
            signal_tx,
            phase_tx,
        }
    }

    /// Create with default configuration
    pub fn with_defaults() -> Self {
        Self::new()
    }

    /// Check if shutdown has been requested
    pub fn is_shutdown_requested(&self) -> bool {
        self.signal_tx.borrow().is_some()
    }

    /// Get current shutdown phase
    pub fn current_phase(&self) -> ShutdownPhase {
        *self.phase_tx.borrow()
    }

    /// Get a receiver for phase changes
    pub fn phase_receiver(&self) -> watch::Receiver<ShutdownPhase> {
        self.phase_tx.subscribe()
    }

    /// Request shutdown with specified signal type
    pub fn request_shutdown(&self, signal: ShutdownSignal) {
        let first = self.signal_tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(signal);
            true
        });

        if first {
            info!("Shutdown requested: {}", signal);
        } else {
            warn!("Shutdown already requested, ignoring duplicate signal: {}", signal);
        }
    }

    pub fn set_phase(&self, phase: ShutdownPhase) {
        self.phase_tx.send_replace(phase);
        info!("Shutdown phase: {}", phase);
    }

    /// Create a token that can be used to check shutdown status
    pub fn token(&self) -> ShutdownToken {
        ShutdownToken {
            signal_rx: self.signal_tx.subscribe(),
        }
    }
}

impl Default for GracefulShutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Token for checking shutdown status in async tasks
#[derive(Clone)]
pub struct ShutdownToken {
    signal_rx: watch::Receiver<Option<ShutdownSignal>>,
}

impl ShutdownToken {
    pub fn is_shutdown_requested(&self) -> bool {
        self.signal_rx.borrow().is_some()
    }

    /// Wait for shutdown signal; returns at once if already requested
    pub async fn wait_for_shutdown(&mut self) -> ShutdownSignal {
        loop {
            if let Some(signal) = *self.signal_rx.borrow_and_update() {
                return signal;
            }
            if self.signal_rx.changed().await.is_err() {
                // Coordinator gone
                return ShutdownSignal::Emergency;
            }
        }
    }
}

/// Helper to install OS signal handlers
pub fn install_signal_handlers(shutdown: Arc<GracefulShutdown>) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        for (kind, name, level) in [
            (SignalKind::terminate(), "SIGTERM", ShutdownSignal::Graceful),
            (SignalKind::interrupt(), "SIGINT", ShutdownSignal::Graceful),
            (SignalKind::quit(), "SIGQUIT", ShutdownSignal::Urgent),
        ] {
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                match signal(kind) {
                    Ok(mut stream) => {
                        stream.recv().await;
                        info!("Received {}", name);
                        shutdown.request_shutdown(level);
                    }
                    Err(e) => error!("Failed to install {} handler: {}", name, e),
                }
            });
        }
    }

    #[cfg(not(unix))]
    {
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Received Ctrl+C");
                    shutdown.request_shutdown(ShutdownSignal::Graceful);
                }
                Err(e) => error!("Failed to install Ctrl+C handler: {}", e),
            }
        });
    }
}
