//! Shared server context: the pending-subscription registry.
//!
//! The command plane records subscriptions here when the named subscriber
//! is not connected; the subscriber takes them the moment its handshake
//! completes.  Only the registration is latched — frames published in the
//! meantime are not buffered.

use std::sync::Mutex;

/// A subscription recorded for a subscriber that has not connected yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSubscription {
    pub name: String,
    pub patterns: Vec<String>,
    pub timeout_ms: u64,
}

/// Process-scoped registry of pending subscriptions.
///
/// Lock order where both are taken: subscriber registry first, then this.
#[derive(Debug, Default)]
pub struct ServerContext {
    pending: Mutex<Vec<PendingSubscription>>,
}

impl ServerContext {
    pub fn new() -> Self {
        ServerContext::default()
    }

    pub fn add_pending(&self, sub: PendingSubscription) {
        self.pending.lock().expect("pending lock poisoned").push(sub);
    }

    /// Remove and return every pending subscription recorded for `name`.
    pub fn take_pending(&self, name: &str) -> Vec<PendingSubscription> {
        let mut pending = self.pending.lock().expect("pending lock poisoned");
        let mut taken = Vec::new();
        let mut i = 0;
        while i < pending.len() {
            if pending[i].name == name {
                taken.push(pending.remove(i));
            } else {
                i += 1;
            }
        }
        taken
    }

    #[cfg(test)]
    pub fn pending_len(&self) -> usize {
        self.pending.lock().expect("pending lock poisoned").len()
    }
}
