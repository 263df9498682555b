//! C4 Tool Registry — the set of tools an agent turn may call, gated by
//! `Agent.allowed_tools`.
//!
//! Three sources are merged: a handful of built-ins (`exec`, `process`,
//! `get_current_time`), and every tool discovered from configured MCP
//! servers (namespaced `{server_id}.{tool_name}` to avoid collisions).
//! Same build-then-filter-then-dispatch shape a tool registry commonly
//! takes, with no skill/memory/agent-delegation/node-router pieces —
//! those tie to dropped features — replaced by MCP dispatch.

use std::sync::Arc;
use std::time::Duration;

use regex::RegexSet;
use serde_json::{json, Value};

use aoc_domain::tool::ToolDefinition;
use aoc_mcp_client::McpManager;
use aoc_tools::exec::{self, ExecRequest};
use aoc_tools::process::{self, ProcessAction, ProcessRequest};
use aoc_tools::ProcessManager;

/// Per-call timeout for tool dispatch.
pub const TOOL_CALL_TIMEOUT: Duration = Duration::from_secs(30);

pub struct ToolRegistry {
    processes: Arc<ProcessManager>,
    mcp: Arc<McpManager>,
    denied_commands: RegexSet,
}

impl ToolRegistry {
    pub fn new(processes: Arc<ProcessManager>, mcp: Arc<McpManager>, denied_commands: RegexSet) -> Self {
        Self { processes, mcp, denied_commands }
    }

    fn builtin_definitions() -> Vec<ToolDefinition> {
        vec![
            ToolDefinition {
                name: "get_current_time".into(),
                description: "Get the current UTC date and time.".into(),
                parameters: json!({"type": "object", "properties": {}}),
            },
            ToolDefinition {
                name: "exec".into(),
                description: "Run a shell command, in the foreground or backgrounded if it runs long.".into(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "command": {"type": "string"},
                        "background": {"type": "boolean"},
                        "workdir": {"type": "string"},
                    },
                    "required": ["command"],
                }),
            },
            ToolDefinition {
                name: "process".into(),
                description: "Manage a previously started background process session (poll/log/write/kill/list).".into(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "action": {"type": "string", "enum": ["list", "poll", "log", "write", "kill", "clear", "remove"]},
                        "session_id": {"type": "string"},
                    },
                    "required": ["action"],
                }),
            },
        ]
    }

    fn mcp_definitions(&self) -> Vec<ToolDefinition> {
        self.mcp
            .list_tools()
            .into_iter()
            .map(|(server_id, def)| ToolDefinition {
                name: format!("{server_id}.{}", def.name),
                description: def.description.clone(),
                parameters: def.input_schema.clone(),
            })
            .collect()
    }

    /// Tool definitions visible to a turn, filtered by the agent's
    /// `allowed_tools` set. An empty set means "no restriction" — matching
    /// `ToolPolicy`'s empty/`["*"]` convention in the config layer.
    pub fn definitions_for_agent(&self, allowed_tools: &std::collections::HashSet<String>) -> Vec<ToolDefinition> {
        let all = Self::builtin_definitions().into_iter().chain(self.mcp_definitions());
        if allowed_tools.is_empty() {
            return all.collect();
        }
        all.filter(|t| allowed_tools.contains(&t.name)).collect()
    }

    /// Dispatch one tool call. Returns `(content, is_error)`; a failure is
    /// surfaced as tool content rather than propagated, so one bad call
    /// never aborts the turn.
    pub async fn invoke(&self, tool_name: &str, arguments: Value) -> (String, bool) {
        match tokio::time::timeout(TOOL_CALL_TIMEOUT, self.invoke_inner(tool_name, arguments)).await {
            Ok(result) => result,
            Err(_) => (format!("tool '{tool_name}' timed out after {:?}", TOOL_CALL_TIMEOUT), true),
        }
    }

    async fn invoke_inner(&self, tool_name: &str, arguments: Value) -> (String, bool) {
        match tool_name {
            "get_current_time" => {
                (chrono::Utc::now().to_rfc3339(), false)
            }
            "exec" => {
                let req: ExecRequest = match serde_json::from_value(arguments) {
                    Ok(r) => r,
                    Err(e) => return (format!("invalid exec arguments: {e}"), true),
                };
                if self.denied_commands.is_match(&req.command) {
                    return ("command blocked by security policy".to_string(), true);
                }
                let resp = exec::exec(&self.processes, req).await;
                (serde_json::to_string(&resp).unwrap_or_default(), false)
            }
            "process" => {
                let req: ProcessRequest = match serde_json::from_value(arguments) {
                    Ok(r) => r,
                    Err(e) => return (format!("invalid process arguments: {e}"), true),
                };
                let is_error_action = matches!(req.action, ProcessAction::Kill | ProcessAction::Remove) && req.session_id.is_none();
                if is_error_action {
                    return ("session_id is required for this action".to_string(), true);
                }
                let resp = process::handle_process(&self.processes, req).await;
                (serde_json::to_string(&resp).unwrap_or_default(), !resp.success)
            }
            other => self.dispatch_mcp(other, arguments).await,
        }
    }

    async fn dispatch_mcp(&self, tool_name: &str, arguments: Value) -> (String, bool) {
        let Some((server_id, bare_name)) = tool_name.split_once('.') else {
            return (format!("unknown tool: {tool_name}"), true);
        };
        match self.mcp.call_tool(server_id, bare_name, arguments).await {
            Ok(result) => {
                let text = result
                    .content
                    .iter()
                    .map(|c| c.text.as_str())
                    .collect::<Vec<_>>()
                    .join("\n");
                (text, result.is_error)
            }
            Err(e) => (e.to_string(), true),
        }
    }
}
