//! Cooperative shutdown signalling.
//!
//! A [`ShutdownTrigger`] flips a `watch` flag once; every [`ShutdownSignal`]
//! clone observes it. All pacing sleeps in the extractor go through
//! [`ShutdownSignal::pause`], which is what makes cancellation observable at
//! every suspension point.

use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

/// Outcome of a cancellable pause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pause {
    Elapsed,
    Cancelled,
}

impl Pause {
    #[must_use]
    pub const fn is_cancelled(self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Sending half; fires at most once.
#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

/// Receiving half, cheap to clone.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

/// Create a connected trigger/signal pair.
#[must_use]
pub fn channel() -> (ShutdownTrigger, ShutdownSignal) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx }, ShutdownSignal { rx })
}

impl ShutdownTrigger {
    /// Request shutdown. Idempotent.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }
}

impl ShutdownSignal {
    /// A signal that never fires.
    #[must_use]
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        // The receiver keeps the last value after the sender is dropped.
        drop(tx);
        Self { rx }
    }

    /// Whether shutdown has been requested.
    #[must_use]
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once shutdown is requested. Pends forever if the trigger is
    /// dropped without firing.
    pub async fn triggered(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|stop| *stop).await.is_err() {
            std::future::pending::<()>().await;
        }
    }

    /// Sleep for `duration` unless shutdown is requested first.
    pub async fn pause(&self, duration: Duration) -> Pause {
        if self.is_triggered() {
            return Pause::Cancelled;
        }
        if duration.is_zero() {
            return Pause::Elapsed;
        }
        tokio::select! {
            () = tokio::time::sleep(duration) => Pause::Elapsed,
            () = self.triggered() => Pause::Cancelled,
        }
    }
}

/// Fire `trigger` on SIGINT or SIGTERM.
pub fn listen_for_os_signals(trigger: ShutdownTrigger) {
    tokio::spawn(async move {
        wait_for_os_signal().await;
        info!("Shutdown signal received, finishing current step");
        trigger.trigger();
    });
}

#[cfg(unix)]
async fn wait_for_os_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            warn!("Could not install SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_os_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
