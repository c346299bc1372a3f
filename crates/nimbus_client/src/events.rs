//! Per-entity change notifications.

use tokio::sync::broadcast;

/// Capacity of each entity's event channel. Slow subscribers see
/// `RecvError::Lagged` rather than blocking the entity.
pub const EVENT_BUFFER: usize = 64;

/// Receiver returned by [`Entity::subscribe`](crate::Entity::subscribe).
pub type EntityEvents = broadcast::Receiver<EntityEvent>;

/// Something that happened to an entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityEvent {
    /// A key was mutated locally.
    Changed {
        /// The mutated key.
        key: String,
    },
    /// Local changes were reverted.
    Reverted,
    /// A save completed.
    Saved,
    /// A save failed; its operations are pending again.
    SaveFailed {
        /// Error message.
        message: String,
    },
    /// Server state was merged in by a fetch.
    Fetched,
    /// The entity was destroyed.
    Destroyed,
}

/// Broadcast side of an entity's event channel.
#[derive(Debug, Clone)]
pub(crate) struct EventSink {
    tx: broadcast::Sender<EntityEvent>,
}

impl EventSink {
    pub(crate) fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUFFER);
        Self { tx }
    }

    pub(crate) fn subscribe(&self) -> EntityEvents {
        self.tx.subscribe()
    }

    /// Emission is best-effort; having no subscribers is not an error.
    pub(crate) fn emit(&self, event: EntityEvent) {
        let _ = self.tx.send(event);
    }
}
