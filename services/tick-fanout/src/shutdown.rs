//! Shared cancellation signal and shutdown accounting

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// One cancellation signal shared by every shard worker and the health
/// monitor. Cloning yields another handle to the same signal.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    tx: std::sync::Arc<watch::Sender<bool>>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            tx: std::sync::Arc::new(tx),
        }
    }

    /// A receiver that observes cancellation; usable from threads
    /// (`borrow`) and tasks (`changed`).
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Flip the signal. Idempotent.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Accounting for a completed shutdown.
///
/// Every tick admitted before shutdown is either in `processed` or in
/// `unprocessed`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownReport {
    pub processed: u64,
    pub unprocessed: u64,
    pub failed_shards: Vec<usize>,
    /// At least one shard did not drain within the shutdown timeout.
    pub timed_out: bool,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.unprocessed == 0 && self.failed_shards.is_empty() && !self.timed_out
    }
}
