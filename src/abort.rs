use std::sync::atomic::{AtomicBool, Ordering};

use strum::Display;
use tokio::sync::watch;
use tracing::error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum AbortReason {
    UnrecoverableError,
    LostCoverage,
}

/// Process-wide abort handle. Aborting trips the shutdown channel so the
/// main loop can exit non-zero; a controlled restart beats silently losing
/// coverage of arbitrary tasks.
pub struct SystemAbort {
    aborted: AtomicBool,
    shutdown_tx: watch::Sender<()>,
}

impl SystemAbort {
    pub fn new(shutdown_tx: watch::Sender<()>) -> Self {
        Self {
            aborted: AtomicBool::new(false),
            shutdown_tx,
        }
    }

    pub fn abort(&self, reason: AbortReason, cause: &anyhow::Error) {
        if self.aborted.swap(true, Ordering::SeqCst) {
            return;
        }
        error!(reason = %reason, "Aborting process: {cause:#}");
        let _ = self.shutdown_tx.send(());
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }
}
