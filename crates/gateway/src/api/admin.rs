//! `/v1/health`, `/v1/metrics`, `/v1/openapi.json`, `/v1/admin/info` —
//! operator-facing endpoints that sit alongside the C1–C9 contracts
//! without belonging to any of them.

use async_trait::async_trait;
use axum::extract::{FromRequestParts, State};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::state::AppState;

/// Axum extractor that enforces the admin bearer token (`config.admin.token_env`).
/// Dev mode (no token configured) allows all requests through.
pub struct AdminGuard;

#[async_trait]
impl FromRequestParts<AppState> for AdminGuard {
    type Rejection = (StatusCode, Json<serde_json::Value>);

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let expected_hash = match &state.admin_token_hash {
            Some(h) => h,
            None => return Ok(AdminGuard),
        };

        let provided = parts
            .headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .unwrap_or("");

        let provided_hash = Sha256::digest(provided.as_bytes());
        if !bool::from(provided_hash.ct_eq(expected_hash.as_slice())) {
            return Err((
                StatusCode::UNAUTHORIZED,
                Json(serde_json::json!({ "error": "invalid admin token" })),
            ));
        }
        Ok(AdminGuard)
    }
}

/// `GET /v1/health` — lightweight health probe (public, no auth).
pub async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// `GET /v1/openapi.json` — a hand-maintained OpenAPI description of the
/// subset of the surface this core owns (public, no auth).
pub async fn openapi_spec() -> impl IntoResponse {
    use axum::http::header;

    let spec = serde_json::json!({
        "openapi": "3.0.3",
        "info": {
            "title": "Agent Orchestration Core API",
            "version": env!("CARGO_PKG_VERSION"),
            "description": "Agent run orchestration: agents, threads, runs, triggers, and workflows, realtime over WS/SSE."
        },
        "servers": [{ "url": "/", "description": "Current host" }],
        "security": [{ "BearerAuth": [] }],
        "components": {
            "securitySchemes": {
                "BearerAuth": { "type": "http", "scheme": "bearer", "description": "API bearer token" }
            },
            "schemas": {
                "Error": { "type": "object", "properties": { "error": { "type": "string" } } }
            }
        },
        "paths": {
            "/v1/health": {
                "get": { "summary": "Health probe", "tags": ["Admin"], "security": [], "responses": { "200": { "description": "ok" } } }
            },
            "/api/agents/{id}/task": {
                "post": { "summary": "Dispatch a manual task run", "tags": ["Agents"], "responses": { "200": { "description": "{run_id, thread_id} — fires and returns, observe progress over WS/SSE" } } }
            },
            "/api/agents/{id}/runs": {
                "get": { "summary": "Paginated run history", "tags": ["Agents"], "responses": { "200": { "description": "Array of Run" } } }
            },
            "/api/agents/{id}/runs/{run_id}/cancel": {
                "post": { "summary": "Cancel an in-flight run", "tags": ["Agents"], "responses": { "200": { "description": "{cancelled: bool}" }, "404": { "description": "unknown run" } } }
            },
            "/api/threads/{id}/messages": {
                "get": { "summary": "Ordered messages since an optional cursor", "tags": ["Threads"], "responses": { "200": { "description": "Array of Message" } } },
                "post": { "summary": "Append a user message and trigger the executor", "tags": ["Threads"], "responses": { "200": { "description": "{message, run_id, thread_id} — fires and returns" } } }
            },
            "/api/triggers/{id}/events": {
                "post": { "summary": "Webhook ingest (HMAC)", "tags": ["Triggers"], "responses": { "202": { "description": "accepted" }, "401": { "description": "bad signature" } } }
            },
            "/api/email/webhook/google": {
                "post": { "summary": "Gmail push ingest", "tags": ["Triggers"], "responses": { "202": { "description": "accepted" } } }
            },
            "/api/jarvis/auth": {
                "post": { "summary": "Device secret exchange", "tags": ["Jarvis"], "responses": { "200": { "description": "session" } } }
            },
            "/api/jarvis/agents": {
                "get": { "summary": "Agents visible to the device identity", "tags": ["Jarvis"], "responses": { "200": { "description": "Array of Agent" } } }
            },
            "/api/jarvis/dispatch": {
                "post": { "summary": "Dispatch a task as the device identity", "tags": ["Jarvis"], "responses": { "200": { "description": "{run_id, thread_id} — fires and returns" } } }
            },
            "/api/jarvis/events": {
                "get": { "summary": "SSE event stream", "tags": ["Jarvis"], "responses": { "200": { "description": "text/event-stream" } } }
            },
            "/api/workflows/{id}/execute": {
                "post": { "summary": "Start a workflow execution", "tags": ["Workflows"], "responses": { "200": { "description": "{execution_id} — fires and returns, observe progress over WS/SSE" } } }
            },
            "/v1/metrics": {
                "get": { "summary": "Runtime metrics", "tags": ["Admin"], "responses": { "200": { "description": "metrics object" } } }
            },
            "/v1/admin/info": {
                "get": { "summary": "System info (admin-only)", "tags": ["Admin"], "responses": { "200": { "description": "info" }, "401": { "description": "unauthorized" } } }
            }
        },
        "tags": [
            { "name": "Agents", "description": "Agent CRUD, task dispatch, run history" },
            { "name": "Threads", "description": "Thread/message read and append" },
            { "name": "Triggers", "description": "Webhook/email ingest" },
            { "name": "Workflows", "description": "DAG workflow CRUD and execution" },
            { "name": "Jarvis", "description": "Voice-assistant device surface" },
            { "name": "Admin", "description": "Operational endpoints" }
        ]
    });

    ([(header::CONTENT_TYPE, "application/json")], Json(spec))
}

/// `GET /v1/metrics` — coarse runtime counters (protected by the regular
/// API token, no admin guard — `/v1/metrics` sits inside the
/// authenticated surface but not the admin-only one).
pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let agents = state.agents.list_all();
    let running = agents
        .iter()
        .filter(|a| matches!(a.status, aoc_domain::entities::AgentStatus::Running))
        .count();
    let scheduled = agents.iter().filter(|a| a.schedule.is_some()).count();
    let errored = agents
        .iter()
        .filter(|a| matches!(a.status, aoc_domain::entities::AgentStatus::Error))
        .count();

    Json(serde_json::json!({
        "agents": {
            "total": agents.len(),
            "running": running,
            "scheduled": scheduled,
            "errored": errored,
        },
        "triggers": { "total": state.triggers.list_all().len() },
        "providers": state.llm.len(),
        "mcp_tools": state.mcp.tool_count(),
    }))
}

/// `GET /v1/admin/info` — admin-only process/config snapshot.
pub async fn system_info(_guard: AdminGuard, State(state): State<AppState>) -> impl IntoResponse {
    let init_errors: Vec<_> = state
        .llm
        .init_errors()
        .iter()
        .map(|e| serde_json::json!({ "provider_id": e.provider_id, "kind": e.kind, "error": e.error }))
        .collect();

    Json(serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "server": {
            "host": state.config.server.host,
            "port": state.config.server.port,
        },
        "admin_token_set": state.admin_token_hash.is_some(),
        "api_token_set": state.api_token_hash.is_some(),
        "provider_count": state.llm.len(),
        "provider_init_errors": init_errors,
        "agent_count": state.agents.list_all().len(),
        "scheduler_tick_interval_sec": state.config.scheduler.tick_interval_sec,
    }))
}
