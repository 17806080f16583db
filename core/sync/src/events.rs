//! Status channel shared by the engine, the coordinator and any UI.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use tokio::sync::broadcast;
use tracing::trace;

/// Default number of events buffered per subscriber.
pub const DEFAULT_CAPACITY: usize = 64;

/// Kind of a status event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Online,
    Offline,
    Syncing,
    Idle,
    Complete,
    Error,
    Caching,
    Cached,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Online => "online",
            EventStatus::Offline => "offline",
            EventStatus::Syncing => "syncing",
            EventStatus::Idle => "idle",
            EventStatus::Complete => "complete",
            EventStatus::Error => "error",
            EventStatus::Caching => "caching",
            EventStatus::Cached => "cached",
        }
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A status notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncEvent {
    pub status: EventStatus,
    /// Human-readable message.
    pub message: String,
    /// Optional structured detail, e.g. `{"synced": 2, "failed": 1}`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl SyncEvent {
    pub fn new(status: EventStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Typed publish/subscribe bus for [`SyncEvent`]s.
///
/// Publishing never blocks and never fails; events published while nobody
/// listens are dropped. A subscriber that falls behind by more than the
/// capacity loses the oldest events.
#[derive(Debug, Clone)]
pub struct StatusBus {
    tx: broadcast::Sender<SyncEvent>,
}

impl StatusBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Register a new independent subscriber.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.tx.subscribe()
    }

    /// Publish an event to every current subscriber.
    ///
    /// # Returns
    /// Number of subscribers that received the event.
    pub fn publish(&self, event: SyncEvent) -> usize {
        trace!("Status event: {} - {}", event.status, event.message);
        self.tx.send(event).unwrap_or(0)
    }

    /// Shorthand for publishing an event without data.
    pub fn notify(&self, status: EventStatus, message: impl Into<String>) -> usize {
        self.publish(SyncEvent::new(status, message))
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for StatusBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
