//! Core domain entities: the durable data model shared by every
//! repository in the gateway (agents, threads, messages, runs,
//! triggers, workflows, canvas layouts).
//!
//! These are plain serde structs. Invariant enforcement (monotone Run
//! status, single system message per thread, cascade deletes, ...)
//! lives in the repository layer that owns mutation, not here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use uuid::Uuid;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// User
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    User,
    Admin,
    SuperAdmin,
}

/// The reserved system identity that owns system-initiated runs
/// (scheduled/webhook/email triggers with no human dispatcher).
pub const SYSTEM_USER_EMAIL: &str = "jarvis@system.local";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub display_name: String,
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub prefs: Value,
    pub role: UserRole,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    pub fn new(email: impl Into<String>, display_name: impl Into<String>, role: UserRole) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            email: email.into(),
            display_name: display_name.into(),
            avatar_url: None,
            prefs: Value::Object(Default::default()),
            role,
            created_at: now,
            updated_at: now,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Agent
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Running,
    Error,
    Scheduled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub name: String,
    pub system_instructions: String,
    pub task_instructions: String,
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// 5-field cron expression. `None` means unscheduled.
    pub schedule: Option<String>,
    pub status: AgentStatus,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    #[serde(default)]
    pub config: Value,
    #[serde(default)]
    pub allowed_tools: HashSet<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_temperature() -> f32 {
    0.7
}

impl Agent {
    /// `scheduled` is a label derived from the presence of a (parseable)
    /// cron expression, not a status the repository stores independently.
    pub fn is_scheduled(&self) -> bool {
        self.schedule.is_some()
    }

    /// Effective display status: `scheduled` overrides `idle` when a
    /// cron expression is present and the agent isn't mid-run or errored.
    pub fn effective_status(&self) -> AgentStatus {
        match self.status {
            AgentStatus::Idle if self.is_scheduled() => AgentStatus::Scheduled,
            other => other,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Thread
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadType {
    Chat,
    Manual,
    Scheduled,
    Webhook,
    Email,
    Workflow,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thread {
    pub id: Uuid,
    pub agent_id: Uuid,
    pub title: String,
    pub thread_type: ThreadType,
    #[serde(default)]
    pub agent_state: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Message
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    UserMessage,
    AssistantMessage,
    /// Transient: never persisted, used only on the wire for token deltas.
    AssistantToken,
    ToolOutput,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub thread_id: Uuid,
    pub role: MessageRole,
    pub content: String,
    pub message_type: MessageType,
    pub tool_name: Option<String>,
    pub tool_call_id: Option<String>,
    #[serde(default)]
    pub tool_calls: Option<Value>,
    pub parent_id: Option<Uuid>,
    pub processed: bool,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn system(thread_id: Uuid, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            thread_id,
            role: MessageRole::System,
            content: content.into(),
            message_type: MessageType::AssistantMessage,
            tool_name: None,
            tool_call_id: None,
            tool_calls: None,
            parent_id: None,
            processed: true,
            created_at: Utc::now(),
        }
    }

    pub fn user(thread_id: Uuid, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            thread_id,
            role: MessageRole::User,
            content: content.into(),
            message_type: MessageType::UserMessage,
            tool_name: None,
            tool_call_id: None,
            tool_calls: None,
            parent_id: None,
            processed: false,
            created_at: Utc::now(),
        }
    }

    pub fn assistant(thread_id: Uuid, content: impl Into<String>, tool_calls: Option<Value>) -> Self {
        Self {
            id: Uuid::new_v4(),
            thread_id,
            role: MessageRole::Assistant,
            content: content.into(),
            message_type: MessageType::AssistantMessage,
            tool_name: None,
            tool_call_id: None,
            tool_calls,
            parent_id: None,
            processed: false,
            created_at: Utc::now(),
        }
    }

    pub fn tool_output(
        thread_id: Uuid,
        parent_id: Uuid,
        tool_name: impl Into<String>,
        tool_call_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            thread_id,
            role: MessageRole::Tool,
            content: content.into(),
            message_type: MessageType::ToolOutput,
            tool_name: Some(tool_name.into()),
            tool_call_id: Some(tool_call_id.into()),
            tool_calls: None,
            parent_id: Some(parent_id),
            processed: false,
            created_at: Utc::now(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Run
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Success,
    Failed,
}

impl RunStatus {
    /// Monotone transition check: queued→running, running→success,
    /// running→failed are the only legal moves.
    pub fn can_transition_to(self, next: RunStatus) -> bool {
        matches!(
            (self, next),
            (RunStatus::Queued, RunStatus::Running)
                | (RunStatus::Running, RunStatus::Success)
                | (RunStatus::Running, RunStatus::Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Success | RunStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunTrigger {
    Manual,
    Schedule,
    Api,
    Webhook,
    Email,
    Workflow,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: Uuid,
    pub agent_id: Uuid,
    pub thread_id: Uuid,
    pub trigger: RunTrigger,
    pub status: RunStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub error: Option<String>,
    pub summary: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Runs carry their error/summary strings truncated to this length,
/// counted in Unicode scalar values (not bytes).
pub const RUN_TEXT_TRUNCATE_CHARS: usize = 500;

/// Truncate `s` to at most `max_chars` Unicode scalar values, never
/// splitting a multi-byte codepoint.
pub fn truncate_chars(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}

impl Run {
    pub fn new(agent_id: Uuid, thread_id: Uuid, trigger: RunTrigger) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            agent_id,
            thread_id,
            trigger,
            status: RunStatus::Queued,
            started_at: None,
            finished_at: None,
            duration_ms: None,
            error: None,
            summary: None,
            created_at: now,
            updated_at: now,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Trigger
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Webhook,
    Email,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trigger {
    pub id: Uuid,
    pub agent_id: Uuid,
    #[serde(rename = "type")]
    pub kind: TriggerType,
    /// CSPRNG-generated, unique across all triggers. Webhook HMAC key.
    pub secret: String,
    #[serde(default)]
    pub config: Value,
    pub last_message_key: Option<String>,
    pub history_id: Option<String>,
    pub watch_expiry: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Workflow
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub name: String,
    pub graph: WorkflowGraph,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Workflow {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowGraph {
    pub nodes: Vec<WorkflowNode>,
    pub edges: Vec<WorkflowEdge>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowNodeType {
    Trigger,
    Tool,
    Agent,
    Condition,
    Action,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowNode {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: WorkflowNodeType,
    #[serde(default)]
    pub config: Value,
    /// Default true: a failure in this node fails the whole execution.
    #[serde(default = "default_true")]
    pub fail_workflow: bool,
    #[serde(default)]
    pub max_retries: u32,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowEdge {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Queued,
    Running,
    Success,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub owner_id: Uuid,
    pub status: WorkflowStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub log: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Idle,
    Queued,
    Running,
    Success,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeExecutionState {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub node_id: String,
    pub status: NodeStatus,
    #[serde(default)]
    pub output: Option<Value>,
    pub error: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// CanvasLayout
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanvasLayout {
    pub id: Uuid,
    pub user_id: Uuid,
    pub workspace: String,
    #[serde(default)]
    pub positions: Value,
    #[serde(default)]
    pub viewport: Value,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ApiPrincipal
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Resolved identity behind a validated bearer token. Not a stored
/// entity in its own right — the concrete mechanism C10 uses to
/// populate `owner_id` on mutating requests, since OAuth/JWT issuance
/// is out of scope for this core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiPrincipal {
    pub user_id: Uuid,
    pub role: UserRole,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_status_legal_transitions() {
        assert!(RunStatus::Queued.can_transition_to(RunStatus::Running));
        assert!(RunStatus::Running.can_transition_to(RunStatus::Success));
        assert!(RunStatus::Running.can_transition_to(RunStatus::Failed));
    }

    #[test]
    fn run_status_illegal_transitions() {
        assert!(!RunStatus::Queued.can_transition_to(RunStatus::Success));
        assert!(!RunStatus::Success.can_transition_to(RunStatus::Running));
        assert!(!RunStatus::Failed.can_transition_to(RunStatus::Running));
        assert!(!RunStatus::Running.can_transition_to(RunStatus::Queued));
    }

    #[test]
    fn run_status_terminal() {
        assert!(RunStatus::Success.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(!RunStatus::Queued.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
    }

    #[test]
    fn truncate_chars_is_unicode_safe() {
        let s = "h\u{00e9}llo world"; // héllo world, contains a multi-byte char
        let truncated = truncate_chars(s, 3);
        assert_eq!(truncated.chars().count(), 3);
        assert_eq!(truncated, "h\u{00e9}l");
    }

    #[test]
    fn truncate_chars_shorter_than_limit_is_unchanged() {
        let s = "short";
        assert_eq!(truncate_chars(s, 500), "short");
    }

    #[test]
    fn agent_effective_status_scheduled_label() {
        let agent = Agent {
            id: Uuid::new_v4(),
            owner_id: Uuid::new_v4(),
            name: "a".into(),
            system_instructions: String::new(),
            task_instructions: String::new(),
            model: "gpt-4o".into(),
            temperature: 0.7,
            schedule: Some("*/5 * * * *".into()),
            status: AgentStatus::Idle,
            last_run_at: None,
            next_run_at: None,
            last_error: None,
            config: Value::Null,
            allowed_tools: HashSet::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert_eq!(agent.effective_status(), AgentStatus::Scheduled);
    }

    #[test]
    fn agent_effective_status_running_overrides_scheduled_label() {
        let mut agent = Agent {
            id: Uuid::new_v4(),
            owner_id: Uuid::new_v4(),
            name: "a".into(),
            system_instructions: String::new(),
            task_instructions: String::new(),
            model: "gpt-4o".into(),
            temperature: 0.7,
            schedule: Some("*/5 * * * *".into()),
            status: AgentStatus::Running,
            last_run_at: None,
            next_run_at: None,
            last_error: None,
            config: Value::Null,
            allowed_tools: HashSet::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert_eq!(agent.effective_status(), AgentStatus::Running);
        agent.status = AgentStatus::Error;
        assert_eq!(agent.effective_status(), AgentStatus::Error);
    }

    #[test]
    fn workflow_soft_delete() {
        let mut wf = Workflow {
            id: Uuid::new_v4(),
            owner_id: Uuid::new_v4(),
            name: "w".into(),
            graph: WorkflowGraph {
                nodes: vec![],
                edges: vec![],
            },
            created_at: Utc::now(),
            updated_at: Utc::now(),
            deleted_at: None,
        };
        assert!(!wf.is_deleted());
        wf.deleted_at = Some(Utc::now());
        assert!(wf.is_deleted());
    }
}
