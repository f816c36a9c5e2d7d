//! Graceful Shutdown Handling
//!
//! A shared shutdown signal for the accept loops, an in-flight counter for the
//! per-item tasks they spawn, and the SIGTERM/SIGINT listener used by the
//! binary.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::signal;
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};

use crate::Result;

/// Level-triggered shutdown signal; late subscribers still observe it
#[derive(Debug, Clone)]
pub struct ShutdownCoordinator {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Fire the signal. Idempotent.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
        }
    }

    /// Wait for SIGTERM or SIGINT
    pub async fn listen_for_signals() -> Result<()> {
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

        #[cfg(not(unix))]
        {
            signal::ctrl_c().await?;
            info!("Received Ctrl+C, initiating graceful shutdown");
        }

        Ok(())
    }
}

/// Receiving side of [`ShutdownCoordinator`]
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// Resolve once shutdown has been triggered (immediately if it already was)
    pub async fn recv(&mut self) {
        // a dropped sender counts as shutdown
        let _ = self.rx.wait_for(|triggered| *triggered).await;
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }
}

/// Counts spawned per-item tasks so shutdown can wait for quiescence
#[derive(Debug, Default)]
pub struct InFlight {
    count: AtomicUsize,
    idle: Notify,
}

impl InFlight {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register one unit of work; it ends when the guard drops
    pub fn enter(self: &Arc<Self>) -> InFlightGuard {
        self.count.fetch_add(1, Ordering::SeqCst);
        InFlightGuard {
            tracker: Arc::clone(self),
        }
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// Wait until no work is in flight or `timeout` elapses. Returns whether
    /// the tracker drained.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + timeout;
        info!(
            "Waiting for {} in-flight tasks to finish (timeout: {:?})",
            self.count(),
            timeout
        );

        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            // register before checking so a concurrent drop is not missed
            notified.as_mut().enable();

            let remaining = self.count();
            if remaining == 0 {
                debug!("All tasks finished in {:?}", started.elapsed());
                return true;
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                warn!(
                    "Shutdown timeout reached after {:?} with {} tasks still in flight",
                    started.elapsed(),
                    self.count()
                );
                return false;
            }
        }
    }
}

/// Marks one in-flight task
#[derive(Debug)]
pub struct InFlightGuard {
    tracker: Arc<InFlight>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.tracker.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.tracker.idle.notify_waiters();
        }
    }
}
