//! Broadcast of cache lifecycle events to downstream observers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Default channel capacity for the broadcast channel.
const DEFAULT_BROADCAST_CAPACITY: usize = 64;

/// Something that happened to the cache
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum CacheEvent {
    /// Every entry was removed
    #[serde(rename_all = "camelCase")]
    Purged {
        /// Number of files deleted
        entries_removed: usize,
        /// When the local deletion finished
        at: DateTime<Utc>,
    },
}

/// Fan-out of [`CacheEvent`]s.
///
/// Sending never blocks and never fails from the caller's point of view:
/// events emitted with no subscribers are dropped.
#[derive(Debug, Clone)]
pub struct CacheEvents {
    tx: broadcast::Sender<CacheEvent>,
}

impl CacheEvents {
    /// Create a new event bus.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BROADCAST_CAPACITY)
    }

    /// Create a new event bus with a specific broadcast capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to events sent after this call.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.tx.subscribe()
    }

    /// Get the number of active subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Emit an event to current subscribers.
    pub fn emit(&self, event: CacheEvent) {
        let delivered = self.tx.send(event).unwrap_or(0);
        tracing::debug!(delivered, "Emitted cache event");
    }
}

impl Default for CacheEvents {
    fn default() -> Self {
        Self::new()
    }
}
