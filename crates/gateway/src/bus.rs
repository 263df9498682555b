//! C2 Event Bus — a typed pub/sub fan-out over [`aoc_domain::event::EventKind`].
//!
//! Every mutation made by the C1 repositories, the run executor, the
//! scheduler, trigger ingest and the workflow engine publishes here instead
//! of writing directly to a connection. The C3 realtime hub is just one
//! subscriber among possibly several (tests subscribe directly too).
//!
//! Fan-out is provided by `tokio::sync::broadcast`: each subscriber gets its
//! own queue, so a slow or dead subscriber can never block, slow down, or
//! fail a publish for anyone else — broadcast's per-receiver lag counter is
//! our "per-subscriber error isolation".

use aoc_domain::event::EventKind;
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 4096;

pub struct EventBus {
    sender: broadcast::Sender<EventKind>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _rx) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Register a new subscriber. Each call gets an independent queue.
    pub fn subscribe(&self) -> broadcast::Receiver<EventKind> {
        self.sender.subscribe()
    }

    /// Publish an event to every current subscriber.
    ///
    /// `send` only errors when there are zero receivers, which is not a
    /// publish failure for a best-effort bus — callers never see it.
    pub fn publish(&self, event: EventKind) {
        let _ = self.sender.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn published_event_reaches_all_subscribers() {
        let bus = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        let agent_id = Uuid::new_v4();

        bus.publish(EventKind::AgentDeleted { agent_id });

        let ra = a.recv().await.unwrap();
        let rb = b.recv().await.unwrap();
        assert_eq!(ra.name(), "AGENT_DELETED");
        assert_eq!(rb.name(), "AGENT_DELETED");
    }

    #[test]
    fn publish_with_no_subscribers_does_not_panic() {
        let bus = EventBus::new();
        bus.publish(EventKind::AgentDeleted { agent_id: Uuid::new_v4() });
    }

    #[tokio::test]
    async fn a_lagging_subscriber_does_not_affect_others() {
        let bus = EventBus::new();
        let mut lagging = bus.subscribe();
        let mut fresh = bus.subscribe();

        for _ in 0..(CHANNEL_CAPACITY + 10) {
            bus.publish(EventKind::AgentDeleted { agent_id: Uuid::new_v4() });
        }

        // `lagging` missed messages and gets a `Lagged` error on next recv,
        // but that's local to its own queue.
        assert!(matches!(lagging.recv().await, Err(broadcast::error::RecvError::Lagged(_))));
        assert!(fresh.recv().await.is_ok());
    }
}
