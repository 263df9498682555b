//! The `/ws` realtime surface: one socket per connection, backed by
//! the C3 [`Hub`](crate::hub::Hub)'s per-connection queue. Inbound
//! frames are small JSON commands; outbound frames are
//! [`Envelope`]s the hub already built from bus events, forwarded as-is.

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use aoc_domain::entities::Message;
use aoc_domain::Error;

use crate::state::AppState;
use crate::task_runner::TaskTrigger;

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum InboundMessage {
    Subscribe {
        topics: Vec<String>,
        #[serde(default)]
        message_id: Option<String>,
    },
    Unsubscribe {
        topics: Vec<String>,
        #[serde(default)]
        message_id: Option<String>,
    },
    Ping {
        #[serde(default)]
        ts: Option<i64>,
    },
    SendMessage {
        thread_id: Uuid,
        content: String,
        #[serde(default)]
        metadata: Option<Value>,
    },
    /// Legacy synonym for `subscribe`, accepted inbound only — never
    /// emitted on the outbound side.
    #[serde(rename = "agent_state")]
    AgentStateLegacy {
        topics: Vec<String>,
        #[serde(default)]
        message_id: Option<String>,
    },
}

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Server-initiated liveness ping period ("heartbeat every ≤30 s"). A
/// write failure on this tick is the active half of pruning —
/// the lazy half is any other write failing in the loop below.
const HEARTBEAT_INTERVAL: std::time::Duration = std::time::Duration::from_secs(25);

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let (conn_id, mut hub_rx) = state.hub.register();
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.tick().await; // first tick fires immediately; skip it

    loop {
        tokio::select! {
            inbound = receiver.next() => {
                match inbound {
                    Some(Ok(WsMessage::Text(text))) => {
                        if let Err(e) = handle_inbound(&state, conn_id, &text, &mut sender).await {
                            let payload = json!({ "type": "error", "error": e.to_string() }).to_string();
                            if sender.send(WsMessage::Text(payload)).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
            envelope = hub_rx.recv() => {
                match envelope {
                    Some(envelope) => {
                        let Ok(frame) = serde_json::to_string(&envelope) else { continue };
                        if sender.send(WsMessage::Text(frame)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            _ = heartbeat.tick() => {
                if sender.send(WsMessage::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    state.hub.unregister(conn_id);
}

async fn handle_inbound(
    state: &AppState,
    conn_id: Uuid,
    text: &str,
    sender: &mut SplitSink<WebSocket, WsMessage>,
) -> Result<(), Error> {
    let msg: InboundMessage =
        serde_json::from_str(text).map_err(|e| Error::InvalidArgument(format!("malformed message: {e}")))?;

    match msg {
        InboundMessage::Subscribe { topics, .. } | InboundMessage::AgentStateLegacy { topics, .. } => {
            for topic in topics {
                state.hub.subscribe(conn_id, &topic);
            }
        }
        InboundMessage::Unsubscribe { topics, .. } => {
            for topic in topics {
                state.hub.unsubscribe(conn_id, &topic);
            }
        }
        InboundMessage::Ping { ts } => {
            let _ = sender.send(WsMessage::Text(json!({ "type": "pong", "ts": ts }).to_string())).await;
        }
        InboundMessage::SendMessage { thread_id, content, .. } => {
            let thread = state.threads.get_thread(thread_id)?;
            let message = Message::user(thread.id, content);
            state.threads.append_messages(thread.id, vec![message])?;

            let task_runner = state.task_runner.clone();
            let agent_id = thread.agent_id;
            tokio::spawn(async move {
                if let Err(e) =
                    task_runner.execute_agent_task(agent_id, TaskTrigger::Chat { thread_id }).await
                {
                    tracing::warn!(error = %e, %thread_id, "ws send_message dispatch failed");
                }
            });
        }
    }

    Ok(())
}
