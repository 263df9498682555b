//! The closed sum type of every event that flows through the Event Bus
//! (C2) and gets routed to WS/SSE subscribers by the Topic Router (C3).
//!
//! `topic_of` is a pure, total function: every variant maps to exactly
//! one topic string. There is currently no admin-only event kind in
//! this set, so the `None` case is unreachable today but kept in the
//! signature so a future admin-only kind doesn't require changing
//! every caller.

use crate::entities::{Agent, Message, NodeStatus, RunStatus, RunTrigger, Thread, WorkflowStatus};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamChunkType {
    AssistantToken,
    AssistantMessage,
    ToolOutput,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    AgentCreated {
        agent_id: Uuid,
        agent: Agent,
    },
    AgentUpdated {
        agent_id: Uuid,
        agent: Agent,
    },
    AgentDeleted {
        agent_id: Uuid,
    },
    ThreadCreated {
        thread_id: Uuid,
        agent_id: Uuid,
        thread: Thread,
    },
    ThreadUpdated {
        thread_id: Uuid,
        agent_id: Uuid,
        thread: Thread,
    },
    ThreadMessageCreated {
        thread_id: Uuid,
        message: Message,
    },
    StreamStart {
        thread_id: Uuid,
    },
    StreamChunk {
        thread_id: Uuid,
        chunk_type: StreamChunkType,
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        tool_name: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        tool_call_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        message_id: Option<Uuid>,
    },
    AssistantId {
        thread_id: Uuid,
        message_id: Uuid,
    },
    StreamEnd {
        thread_id: Uuid,
    },
    RunCreated {
        run_id: Uuid,
        agent_id: Uuid,
        thread_id: Uuid,
        trigger: RunTrigger,
    },
    RunUpdated {
        run_id: Uuid,
        agent_id: Uuid,
        thread_id: Uuid,
        status: RunStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        summary: Option<String>,
    },
    UserUpdated {
        user_id: Uuid,
    },
    TriggerFired {
        trigger_id: Uuid,
        agent_id: Uuid,
        payload: Value,
    },
    NodeState {
        execution_id: Uuid,
        node_id: String,
        status: NodeStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        output: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    NodeLog {
        execution_id: Uuid,
        node_id: String,
        text: String,
    },
    ExecutionFinished {
        execution_id: Uuid,
        status: WorkflowStatus,
        duration_ms: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl EventKind {
    /// Short machine name, used in `tracing` fields and test assertions
    /// without matching on the full payload.
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::AgentCreated { .. } => "AGENT_CREATED",
            EventKind::AgentUpdated { .. } => "AGENT_UPDATED",
            EventKind::AgentDeleted { .. } => "AGENT_DELETED",
            EventKind::ThreadCreated { .. } => "THREAD_CREATED",
            EventKind::ThreadUpdated { .. } => "THREAD_UPDATED",
            EventKind::ThreadMessageCreated { .. } => "THREAD_MESSAGE_CREATED",
            EventKind::StreamStart { .. } => "STREAM_START",
            EventKind::StreamChunk { .. } => "STREAM_CHUNK",
            EventKind::AssistantId { .. } => "ASSISTANT_ID",
            EventKind::StreamEnd { .. } => "STREAM_END",
            EventKind::RunCreated { .. } => "RUN_CREATED",
            EventKind::RunUpdated { .. } => "RUN_UPDATED",
            EventKind::UserUpdated { .. } => "USER_UPDATED",
            EventKind::TriggerFired { .. } => "TRIGGER_FIRED",
            EventKind::NodeState { .. } => "NODE_STATE",
            EventKind::NodeLog { .. } => "NODE_LOG",
            EventKind::ExecutionFinished { .. } => "EXECUTION_FINISHED",
        }
    }
}

/// Pure, total topic derivation. `agent:{id}`, `thread:{id}`,
/// `user:{id}`, `workflow_execution:{id}` are the only topic families;
/// `None` is reserved for a future admin-only event kind.
pub fn topic_of(event: &EventKind) -> Option<String> {
    let topic = match event {
        EventKind::AgentCreated { agent_id, .. }
        | EventKind::AgentUpdated { agent_id, .. }
        | EventKind::AgentDeleted { agent_id } => format!("agent:{agent_id}"),

        EventKind::RunCreated { agent_id, .. } | EventKind::RunUpdated { agent_id, .. } => {
            format!("agent:{agent_id}")
        }

        EventKind::TriggerFired { agent_id, .. } => format!("agent:{agent_id}"),

        EventKind::ThreadCreated { thread_id, .. }
        | EventKind::ThreadUpdated { thread_id, .. }
        | EventKind::ThreadMessageCreated { thread_id, .. }
        | EventKind::StreamStart { thread_id }
        | EventKind::StreamChunk { thread_id, .. }
        | EventKind::AssistantId { thread_id, .. }
        | EventKind::StreamEnd { thread_id } => format!("thread:{thread_id}"),

        EventKind::UserUpdated { user_id } => format!("user:{user_id}"),

        EventKind::NodeState { execution_id, .. }
        | EventKind::NodeLog { execution_id, .. }
        | EventKind::ExecutionFinished { execution_id, .. } => {
            format!("workflow_execution:{execution_id}")
        }
    };
    Some(topic)
}

/// The wire envelope carried over WebSocket and SSE.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub v: u32,
    #[serde(rename = "type")]
    pub kind: String,
    pub topic: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub req_id: Option<String>,
    pub ts: i64,
    pub data: Value,
}

impl Envelope {
    /// Build an envelope from a bus event, deriving its topic and
    /// wire `type` from the outbound-type mapping.
    pub fn from_event(event: &EventKind, outbound_type: &str) -> Option<Self> {
        let topic = topic_of(event)?;
        let data = serde_json::to_value(event).ok()?;
        Some(Envelope {
            v: 1,
            kind: outbound_type.to_string(),
            topic,
            req_id: None,
            ts: crate::trace::now_ms(),
            data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{Agent, AgentStatus};
    use serde_json::json;
    use std::collections::HashSet;

    fn sample_agent() -> Agent {
        let now = chrono::Utc::now();
        Agent {
            id: Uuid::new_v4(),
            owner_id: Uuid::new_v4(),
            name: "a".into(),
            system_instructions: String::new(),
            task_instructions: String::new(),
            model: "gpt-4o".into(),
            temperature: 0.7,
            schedule: None,
            status: AgentStatus::Idle,
            last_run_at: None,
            next_run_at: None,
            last_error: None,
            config: Value::Null,
            allowed_tools: HashSet::new(),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn run_updated_topic_is_agent() {
        let agent_id = Uuid::new_v4();
        let ev = EventKind::RunUpdated {
            run_id: Uuid::new_v4(),
            agent_id,
            thread_id: Uuid::new_v4(),
            status: RunStatus::Success,
            error: None,
            summary: None,
        };
        assert_eq!(topic_of(&ev), Some(format!("agent:{agent_id}")));
    }

    #[test]
    fn stream_chunk_topic_is_thread() {
        let thread_id = Uuid::new_v4();
        let ev = EventKind::StreamChunk {
            thread_id,
            chunk_type: StreamChunkType::AssistantToken,
            content: "hi".into(),
            tool_name: None,
            tool_call_id: None,
            message_id: None,
        };
        assert_eq!(topic_of(&ev), Some(format!("thread:{thread_id}")));
    }

    #[test]
    fn node_state_topic_is_workflow_execution() {
        let execution_id = Uuid::new_v4();
        let ev = EventKind::NodeState {
            execution_id,
            node_id: "n1".into(),
            status: NodeStatus::Running,
            output: None,
            error: None,
        };
        assert_eq!(
            topic_of(&ev),
            Some(format!("workflow_execution:{execution_id}"))
        );
    }

    #[test]
    fn user_updated_topic_is_user() {
        let user_id = Uuid::new_v4();
        let ev = EventKind::UserUpdated { user_id };
        assert_eq!(topic_of(&ev), Some(format!("user:{user_id}")));
    }

    #[test]
    fn topic_of_is_total_for_every_variant() {
        let agent_id = Uuid::new_v4();
        let thread_id = Uuid::new_v4();
        let variants = vec![
            EventKind::AgentCreated { agent_id, agent: sample_agent() },
            EventKind::AgentDeleted { agent_id },
            EventKind::ThreadCreated { thread_id, agent_id, thread: dummy_thread(thread_id, agent_id) },
            EventKind::StreamStart { thread_id },
            EventKind::StreamEnd { thread_id },
            EventKind::TriggerFired { trigger_id: Uuid::new_v4(), agent_id, payload: json!({}) },
        ];
        for v in variants {
            assert!(topic_of(&v).is_some(), "{} must derive a topic", v.name());
        }
    }

    fn dummy_thread(id: Uuid, agent_id: Uuid) -> Thread {
        let now = chrono::Utc::now();
        Thread {
            id,
            agent_id,
            title: "t".into(),
            thread_type: crate::entities::ThreadType::Chat,
            agent_state: Value::Null,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn envelope_roundtrips_through_json() {
        let ev = EventKind::AssistantId {
            thread_id: Uuid::new_v4(),
            message_id: Uuid::new_v4(),
        };
        let envelope = Envelope::from_event(&ev, "assistant_id").unwrap();
        let json = serde_json::to_string(&envelope).unwrap();
        let back: Envelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back.topic, envelope.topic);
        assert_eq!(back.kind, "assistant_id");
        assert_eq!(back.v, 1);
    }

    #[test]
    fn event_name_matches_screaming_snake_case() {
        let ev = EventKind::StreamEnd {
            thread_id: Uuid::new_v4(),
        };
        assert_eq!(ev.name(), "STREAM_END");
    }
}
