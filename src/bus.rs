//! Session-scoped event bus.
//!
//! Each session owns one bus and hands clones of it to whatever needs to
//! publish or observe session events. Nothing here is process-global: two
//! sessions in one process never see each other's events.

use tokio::sync::broadcast;

use crate::model::UserIdentity;
use crate::net::JoinRejection;
use crate::net::events::SaveOutcome;

const BUS_CAPACITY: usize = 256;

/// Things that happened inside a session.
#[derive(Clone, Debug, PartialEq)]
pub enum SessionEvent {
    /// Store contents changed; carries the new revision.
    StateChanged { revision: u64 },
    /// A full snapshot from the server replaced local state.
    SnapshotReplaced { revision: u64 },
    RosterChanged { users: Vec<UserIdentity> },
    JoinRejected(JoinRejection),
    /// The pending queue overflowed; the oldest frame with this event name
    /// was dropped.
    QueueOverflow { dropped_event: String },
    /// An inbound payload failed to merge and was ignored.
    MergeFailed { event: String, error: String },
    Saved(SaveOutcome),
    /// Edge selection changed locally (never sent to peers).
    EdgeSelectionChanged { selected: Vec<String> },
}

#[derive(Clone, Debug)]
pub struct EventBus {
    tx: broadcast::Sender<SessionEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    /// Publish to current subscribers. Having none is not an error.
    pub fn publish(&self, event: SessionEvent) {
        let _ = self.tx.send(event);
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish(SessionEvent::StateChanged { revision: 3 });
        assert_eq!(rx.recv().await.ok(), Some(SessionEvent::StateChanged { revision: 3 }));
    }

    #[test]
    fn publishing_without_subscribers_is_fine() {
        EventBus::new().publish(SessionEvent::StateChanged { revision: 1 });
    }

    #[tokio::test]
    async fn separate_buses_are_isolated() {
        let a = EventBus::new();
        let b = EventBus::new();
        let mut rx_b = b.subscribe();

        a.publish(SessionEvent::StateChanged { revision: 1 });
        assert!(rx_b.try_recv().is_err());
    }
}
