//! C3 Topic Router / Realtime Hub — fans bus events out to WebSocket and SSE
//! connections subscribed to matching topics, and frames the wire protocol
//! (`Envelope { v, type, topic, req_id, ts, data }`).
//!
//! Connections don't see the bus directly; they register here, declare the
//! topics they care about, and get an `mpsc::Sender<Envelope>` to drain on
//! their own write loop. A single background task owns the bus subscription
//! and does the topic -> connections lookup.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use aoc_domain::event::{topic_of, Envelope, EventKind};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::bus::EventBus;

const CONNECTION_QUEUE_CAPACITY: usize = 256;

/// Maps an [`EventKind`] to the wire-level `type` string used in its
/// outbound [`Envelope`].
fn outbound_type(event: &EventKind) -> &'static str {
    match event {
        EventKind::AgentCreated { .. } => "agent_created",
        EventKind::AgentUpdated { .. } => "agent_updated",
        EventKind::AgentDeleted { .. } => "agent_deleted",
        EventKind::ThreadCreated { .. } => "thread_created",
        EventKind::ThreadUpdated { .. } => "thread_updated",
        EventKind::ThreadMessageCreated { .. } => "thread_message_created",
        EventKind::StreamStart { .. } => "stream_start",
        EventKind::StreamChunk { .. } => "stream_chunk",
        EventKind::AssistantId { .. } => "assistant_id",
        EventKind::StreamEnd { .. } => "stream_end",
        EventKind::RunCreated { .. } => "run_created",
        EventKind::RunUpdated { .. } => "run_update",
        EventKind::UserUpdated { .. } => "user_update",
        EventKind::TriggerFired { .. } => "trigger_fired",
        EventKind::NodeState { .. } => "node_state",
        EventKind::NodeLog { .. } => "node_log",
        EventKind::ExecutionFinished { .. } => "execution_finished",
    }
}

struct ConnectionHandle {
    tx: mpsc::Sender<Envelope>,
    topics: HashSet<String>,
}

#[derive(Default)]
struct HubState {
    connections: HashMap<Uuid, ConnectionHandle>,
    topics: HashMap<String, HashSet<Uuid>>,
}

/// Shared realtime fan-out state. Cheap to clone (wraps an `Arc`).
#[derive(Clone)]
pub struct Hub {
    state: Arc<RwLock<HubState>>,
}

impl Hub {
    /// Build a hub and spawn its bus-draining background task.
    pub fn spawn(bus: Arc<EventBus>) -> Self {
        let hub = Hub {
            state: Arc::new(RwLock::new(HubState::default())),
        };
        let mut rx = bus.subscribe();
        let worker_state = hub.state.clone();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => Hub::route(&worker_state, &event),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "realtime hub lagged behind event bus");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        hub
    }

    fn route(state: &RwLock<HubState>, event: &EventKind) {
        let Some(topic) = topic_of(event) else { return };
        let Some(envelope) = Envelope::from_event(event, outbound_type(event)) else { return };

        let guard = state.read();
        let Some(subscriber_ids) = guard.topics.get(&topic) else { return };
        for id in subscriber_ids {
            if let Some(conn) = guard.connections.get(id) {
                // `try_send`: a connection whose queue is full is a dead or
                // frozen peer, not something worth blocking the router for.
                let _ = conn.tx.try_send(envelope.clone());
            }
        }
    }

    /// Register a new connection (WS or SSE) and get back its id plus the
    /// receiving half of its outbound queue.
    pub fn register(&self) -> (Uuid, mpsc::Receiver<Envelope>) {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(CONNECTION_QUEUE_CAPACITY);
        self.state.write().connections.insert(
            id,
            ConnectionHandle { tx, topics: HashSet::new() },
        );
        (id, rx)
    }

    pub fn subscribe(&self, connection_id: Uuid, topic: &str) {
        let mut guard = self.state.write();
        guard.topics.entry(topic.to_string()).or_default().insert(connection_id);
        if let Some(conn) = guard.connections.get_mut(&connection_id) {
            conn.topics.insert(topic.to_string());
        }
    }

    pub fn unsubscribe(&self, connection_id: Uuid, topic: &str) {
        let mut guard = self.state.write();
        if let Some(ids) = guard.topics.get_mut(topic) {
            ids.remove(&connection_id);
            if ids.is_empty() {
                guard.topics.remove(topic);
            }
        }
        if let Some(conn) = guard.connections.get_mut(&connection_id) {
            conn.topics.remove(topic);
        }
    }

    /// Drop a connection and every topic subscription it held.
    pub fn unregister(&self, connection_id: Uuid) {
        let mut guard = self.state.write();
        if let Some(conn) = guard.connections.remove(&connection_id) {
            for topic in conn.topics {
                if let Some(ids) = guard.topics.get_mut(&topic) {
                    ids.remove(&connection_id);
                    if ids.is_empty() {
                        guard.topics.remove(&topic);
                    }
                }
            }
        }
    }

    pub fn connection_count(&self) -> usize {
        self.state.read().connections.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn subscriber_receives_only_its_topic() {
        let bus = Arc::new(EventBus::new());
        let hub = Hub::spawn(bus.clone());

        let agent_id = Uuid::new_v4();
        let other_agent_id = Uuid::new_v4();
        let (conn_id, mut rx) = hub.register();
        hub.subscribe(conn_id, &format!("agent:{agent_id}"));

        bus.publish(EventKind::AgentDeleted { agent_id: other_agent_id });
        bus.publish(EventKind::AgentDeleted { agent_id });

        let envelope = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(envelope.topic, format!("agent:{agent_id}"));
        assert_eq!(envelope.kind, "agent_deleted");

        // the other-agent event was never delivered; queue should be empty now
        assert!(tokio::time::timeout(Duration::from_millis(50), rx.recv()).await.is_err());
    }

    #[tokio::test]
    async fn unregister_stops_delivery() {
        let bus = Arc::new(EventBus::new());
        let hub = Hub::spawn(bus.clone());
        let agent_id = Uuid::new_v4();
        let (conn_id, mut rx) = hub.register();
        hub.subscribe(conn_id, &format!("agent:{agent_id}"));
        hub.unregister(conn_id);

        bus.publish(EventKind::AgentDeleted { agent_id });
        assert!(tokio::time::timeout(Duration::from_millis(50), rx.recv()).await.is_err());
        assert_eq!(hub.connection_count(), 0);
    }
}
