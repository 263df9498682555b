use std::sync::Arc;

use aoc_domain::config::Config;
use aoc_mcp_client::McpManager;
use aoc_providers::ProviderRegistry;
use aoc_sessions::ThreadStore;
use aoc_tools::ProcessManager;

use crate::bus::EventBus;
use crate::cancel::CancelMap;
use crate::hub::Hub;
use crate::locks::AgentLockMap;
use crate::repos::{AgentRepo, CanvasRepo, RunRepo, TriggerRepo, UserRepo, WorkflowExecutionRepo, WorkflowRepo};
use crate::scheduler::Scheduler;
use crate::task_runner::TaskRunner;
use crate::tools::ToolRegistry;
use crate::triggers::gmail::GmailIngest;
use crate::triggers::{TriggerDispatcher, WebhookIngest};
use crate::workflow_engine::WorkflowEngine;

/// Shared application state passed to every API handler.
///
/// Fields are grouped by concern:
/// - **Core services** — config, LLM providers, tools
/// - **Repositories (C1)** — one per entity
/// - **Runtime (C2/C5/C6/C7/C8/C9)** — bus, hub, executor, task runner,
///   scheduler, trigger ingest, workflow engine
/// - **Security** — token hashes computed once at startup
#[derive(Clone)]
pub struct AppState {
    // ── Core services ─────────────────────────────────────────────────
    pub config: Arc<Config>,
    pub llm: Arc<ProviderRegistry>,
    pub processes: Arc<ProcessManager>,
    pub mcp: Arc<McpManager>,
    pub tools: Arc<ToolRegistry>,

    // ── Repositories (C1) ────────────────────────────────────────────
    pub agents: Arc<AgentRepo>,
    pub runs: Arc<RunRepo>,
    pub triggers: Arc<TriggerRepo>,
    pub users: Arc<UserRepo>,
    pub canvas: Arc<CanvasRepo>,
    pub workflows: Arc<WorkflowRepo>,
    pub executions: Arc<WorkflowExecutionRepo>,
    pub threads: Arc<ThreadStore>,

    // ── Event bus & realtime hub (C2/C3) ────────────────────────────
    pub bus: Arc<EventBus>,
    pub hub: Hub,

    // ── Concurrency control ──────────────────────────────────────────
    pub locks: Arc<AgentLockMap>,
    pub cancels: Arc<CancelMap>,

    // ── Runtime (C5-C9) ──────────────────────────────────────────────
    pub task_runner: Arc<TaskRunner>,
    pub scheduler: Arc<Scheduler>,
    pub workflow_engine: Arc<WorkflowEngine>,
    pub webhook_ingest: Arc<WebhookIngest>,
    pub trigger_dispatcher: Arc<TriggerDispatcher>,
    pub gmail_ingest: Option<Arc<GmailIngest>>,

    // ── Security (startup-computed) ───────────────────────────────────
    /// SHA-256 hash of the API bearer token. `None` = dev mode.
    pub api_token_hash: Option<Vec<u8>>,
    /// SHA-256 hash of the admin bearer token. `None` = dev mode.
    pub admin_token_hash: Option<Vec<u8>>,
    /// HMAC key used to sign/verify Jarvis session JWTs.
    pub jarvis_jwt_secret: Arc<Vec<u8>>,
    /// Device secret Jarvis clients must present to `/api/jarvis/auth`.
    pub jarvis_device_secret: Option<Arc<String>>,
    pub jarvis_session_ttl_sec: i64,
}
