//! Observable per-store health state
//!
//! Each store owns a `HealthHandle` and publishes a `KeyHealth` snapshot
//! through a watch channel. Callers subscribe to the receiver side to react
//! to count changes, in-flight generation and background failures; nothing
//! here is persisted.

use serde::Serialize;
use tokio::sync::watch;

/// Point-in-time health summary of one key store
#[derive(Debug, Clone, Default, Serialize)]
pub struct KeyHealth {
    /// Number of live records the store currently holds
    pub count: usize,
    /// Whether a generation or rotation is in flight
    pub busy: bool,
    /// Last error observed, cleared on the next successful operation
    pub last_error: Option<String>,
    /// Unix timestamp (seconds) of the last check or generation
    pub last_checked: Option<i64>,
}

/// Mutation side of a store's health state
pub struct HealthHandle {
    tx: watch::Sender<KeyHealth>,
}

impl HealthHandle {
    /// Create a handle plus the receiver callers subscribe to
    pub fn new() -> (Self, watch::Receiver<KeyHealth>) {
        let (tx, rx) = watch::channel(KeyHealth::default());
        (Self { tx }, rx)
    }

    /// Subscribe a new observer
    pub fn subscribe(&self) -> watch::Receiver<KeyHealth> {
        self.tx.subscribe()
    }

    /// Record the current live-record count and touch the check timestamp
    pub fn set_count(&self, count: usize) {
        self.tx.send_modify(|h| {
            h.count = count;
            h.last_checked = Some(chrono::Utc::now().timestamp());
        });
    }

    /// Mark a generation/rotation as started or finished
    pub fn set_busy(&self, busy: bool) {
        self.tx.send_modify(|h| h.busy = busy);
    }

    /// Record a failure for observers
    pub fn record_error(&self, error: impl ToString) {
        self.tx.send_modify(|h| h.last_error = Some(error.to_string()));
    }

    /// Clear the error field after a successful operation
    pub fn clear_error(&self) {
        self.tx.send_modify(|h| h.last_error = None);
    }

    /// Current snapshot
    pub fn snapshot(&self) -> KeyHealth {
        self.tx.borrow().clone()
    }
}
