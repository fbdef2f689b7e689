//! Graceful Shutdown Handling
//!
//! Turns SIGTERM/SIGINT into a broadcast that stops the accept loop, then
//! closes the sessions still running and waits for them to finish.

use std::time::{Duration, Instant};
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::tunnel::SessionRegistry;

/// Shutdown coordinator that manages graceful shutdown process
pub struct ShutdownCoordinator {
    /// Broadcast sender for shutdown signal
    shutdown_tx: broadcast::Sender<()>,
    /// How long to wait for sessions to close
    timeout: Duration,
}

impl ShutdownCoordinator {
    /// Create a new shutdown coordinator
    pub fn new(timeout: Duration) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            shutdown_tx,
            timeout,
        }
    }

    /// Get a shutdown receiver for components to listen for shutdown signals
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Broadcast the shutdown signal without waiting for an OS signal
    pub fn trigger(&self) {
        if let Err(e) = self.shutdown_tx.send(()) {
            debug!("No shutdown listeners left: {}", e);
        }
    }

    /// Wait for SIGTERM/SIGINT (Ctrl+C on Windows), then broadcast shutdown
    pub async fn listen_for_signals(&self) -> std::io::Result<()> {
        info!("Starting shutdown signal listener");

        #[cfg(unix)]
        {
            let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
            let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;

            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, initiating graceful shutdown");
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT, initiating graceful shutdown");
                }
            }
        }

        #[cfg(windows)]
        {
            signal::ctrl_c().await?;
            info!("Received Ctrl+C, initiating graceful shutdown");
        }

        self.trigger();
        Ok(())
    }

    /// Close every live session and wait for the registry to drain.
    ///
    /// Returns `true` if all sessions finished within the timeout.
    pub async fn drain(&self, registry: &SessionRegistry) -> bool {
        let start_time = Instant::now();
        let active = registry.active_count();

        if active == 0 {
            info!("No active sessions, shutdown complete");
            return true;
        }

        info!(
            "Closing {} active sessions (timeout: {:?})",
            active, self.timeout
        );
        registry.close_all();

        let drained = registry.wait_idle(self.timeout).await;
        let elapsed = start_time.elapsed();

        if drained {
            info!("All sessions closed gracefully in {:?}", elapsed);
        } else {
            warn!(
                "Shutdown timeout reached after {:?} with {} sessions still active",
                elapsed,
                registry.active_count()
            );
        }

        drained
    }
}
