//! Change notifications for accepted display-name updates.
//!
//! Broadcast-based so any number of consumers (chat, greeter, statistics)
//! can follow updates without polling. Publishing never waits: slow
//! subscribers lag and skip events instead of stalling the writer.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;

use crate::domain::models::{AvatarId, NameRecord};

/// Emitted every time the store accepts a new display name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayNameChanged {
    /// Monotonically increasing per bus.
    pub sequence: u64,
    pub avatar_id: AvatarId,
    /// The previous valid display name, if there was one.
    pub previous: Option<String>,
    pub current: String,
    pub record: NameRecord,
    pub timestamp: DateTime<Utc>,
}

/// Fan-out of [`DisplayNameChanged`] events.
pub struct NameChangeBus {
    sender: broadcast::Sender<DisplayNameChanged>,
    sequence: AtomicU64,
}

impl NameChangeBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            sequence: AtomicU64::new(0),
        }
    }

    /// Publish a change. Returns the assigned sequence number.
    pub fn publish(&self, record: &NameRecord, previous: Option<String>) -> u64 {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        let event = DisplayNameChanged {
            sequence,
            avatar_id: record.avatar_id,
            previous,
            current: record.display_name.clone(),
            record: record.clone(),
            timestamp: Utc::now(),
        };

        // No subscribers is fine.
        let _ = self.sender.send(event);
        sequence
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DisplayNameChanged> {
        self.sender.subscribe()
    }

    /// Number of events published so far.
    pub fn published(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for NameChangeBus {
    fn default() -> Self {
        Self::new(1_024)
    }
}
