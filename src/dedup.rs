//! Bounded FIFO dedup window.
//!
//! At-least-once delivery from the transport means a reconnect or a
//! history-sync replay can hand the pipeline a message it already emitted.
//! This window remembers the last `CAPACITY` message keys it has seen and
//! evicts the oldest once full, so memory use stays flat for long-lived
//! sessions.

use std::collections::VecDeque;
use std::collections::HashSet;

/// Number of message keys retained before the oldest is evicted.
pub const CAPACITY: usize = 5000;

/// A bounded FIFO set of `remoteJid:messageId` keys.
pub struct DedupWindow {
    order: VecDeque<String>,
    seen: HashSet<String>,
}

impl DedupWindow {
    /// Build an empty window at the default capacity.
    #[must_use]
    pub fn new() -> Self {
        Self {
            order: VecDeque::with_capacity(CAPACITY),
            seen: HashSet::with_capacity(CAPACITY),
        }
    }

    /// Build the canonical dedup key for a message.
    #[must_use]
    pub fn key(remote_jid: &str, message_id: &str) -> String {
        format!("{remote_jid}:{message_id}")
    }

    /// Insert `key` if absent. Returns `true` if this is the first time the
    /// key has been seen (the caller should process the message), `false`
    /// if it is a duplicate (the caller should drop it).
    pub fn insert(&mut self, key: String) -> bool {
        if self.seen.contains(&key) {
            return false;
        }
        if self.order.len() >= CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.seen.insert(key.clone());
        self.order.push_back(key);
        true
    }

    /// Number of keys currently tracked.
    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Whether the window holds no keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

impl Default for DedupWindow {
    fn default() -> Self {
        Self::new()
    }
}
