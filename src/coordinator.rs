//! Request/response correlation.
//!
//! The coordinator owns the pending-call table: each outgoing request gets
//! a strictly increasing correlation id and a oneshot result slot. Exactly
//! one resolution is ever delivered per call: the slot is removed from the
//! table before it is resolved, so a real response followed by the request's
//! own late timeout (or vice versa) resolves once and drops the other.
//!
//! Connection closure fails every outstanding slot by dropping it, which
//! wakes each waiting caller with a closed-channel error rather than
//! leaving it suspended forever.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde_json::Value;
use tokio::sync::oneshot;

/// Pending-call table plus the correlation id allocator.
#[derive(Debug, Default)]
pub struct Coordinator {
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, oneshot::Sender<Value>>>,
}

impl Coordinator {
    /// Create an empty coordinator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next correlation id (strictly increasing, starting at 1).
    pub fn next_msgid(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Register a pending call and return the slot its response will land in.
    pub fn register(&self, msgid: u64) -> oneshot::Receiver<Value> {
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("pending lock poisoned")
            .insert(msgid, tx);
        rx
    }

    /// Resolve a pending call with its response payload.
    ///
    /// Returns `false` when no call is waiting under that id; a late
    /// synthetic timeout racing a real response, or a response for a call
    /// already failed by connection closure.
    pub fn resolve(&self, msgid: u64, data: Value) -> bool {
        let slot = self
            .pending
            .lock()
            .expect("pending lock poisoned")
            .remove(&msgid);
        match slot {
            // A dropped receiver just means the caller gave up waiting.
            Some(tx) => {
                let _ = tx.send(data);
                true
            }
            None => false,
        }
    }

    /// Drop every outstanding slot, waking all waiting callers with failure.
    pub fn fail_all(&self) {
        let mut pending = self.pending.lock().expect("pending lock poisoned");
        let count = pending.len();
        pending.clear();
        if count > 0 {
            log::debug!("Failed {count} pending call(s) on connection loss");
        }
    }

    /// Number of calls currently awaiting resolution.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.pending.lock().expect("pending lock poisoned").len()
    }
}
