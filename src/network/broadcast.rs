//! State Broadcaster
//!
//! Holds the latest snapshot in a `watch` channel. Every local client task
//! subscribes and forwards each new snapshot as a `state` message; clients
//! that cannot keep up only ever see the newest one.

use std::sync::Arc;
use tokio::sync::watch;

use crate::network::protocol::StateSnapshot;

/// Push channel for state snapshots.
pub struct StateBroadcaster {
    tx: watch::Sender<Arc<StateSnapshot>>,
}

impl StateBroadcaster {
    /// Create a broadcaster holding `initial`.
    pub fn new(initial: StateSnapshot) -> Self {
        let (tx, _) = watch::channel(Arc::new(initial));
        Self { tx }
    }

    /// Replace the current snapshot and wake every subscriber.
    pub fn publish(&self, snapshot: StateSnapshot) {
        self.tx.send_replace(Arc::new(snapshot));
    }

    /// Subscribe; the receiver starts at the current snapshot.
    pub fn subscribe(&self) -> watch::Receiver<Arc<StateSnapshot>> {
        self.tx.subscribe()
    }

    /// Most recently published snapshot.
    pub fn latest(&self) -> Arc<StateSnapshot> {
        self.tx.borrow().clone()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::session::{GameSession, SessionConfig};
    use crate::game::state::{GamePhase, PlayerId};

    fn snapshot(at: i64) -> StateSnapshot {
        let session = GameSession::new(PlayerId::from_parts("127.0.0.1", 5000), SessionConfig::default(), 0);
        StateSnapshot::capture(&session, at)
    }

    #[tokio::test]
    async fn test_subscribers_see_latest() {
        let broadcaster = StateBroadcaster::new(snapshot(1));
        let mut rx = broadcaster.subscribe();
        assert_eq!(broadcaster.subscriber_count(), 1);
        assert_eq!(rx.borrow().server_time_ms, 1);

        broadcaster.publish(snapshot(2));
        broadcaster.publish(snapshot(3));

        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().server_time_ms, 3);
        assert_eq!(broadcaster.latest().phase, GamePhase::Lobby);
    }

    #[test]
    fn test_publish_without_subscribers() {
        let broadcaster = StateBroadcaster::new(snapshot(1));
        broadcaster.publish(snapshot(5));
        assert_eq!(broadcaster.latest().server_time_ms, 5);
        assert_eq!(broadcaster.subscriber_count(), 0);
    }
}
