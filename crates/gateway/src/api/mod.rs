//! Route assembly for the gateway's REST/WS/SSE boundary (C10).

pub mod admin;
pub mod agents;
pub mod auth;
pub mod canvas;
pub mod error;
pub mod jarvis;
pub mod threads;
pub mod triggers;
pub mod workflows;
pub mod ws;

use axum::middleware;
use axum::routing::{delete, get, post, put};
use axum::Router;

use crate::state::AppState;

/// Build the full API router.
///
/// Routes split into **public** (no auth: health/openapi/jarvis device
/// auth/webhook ingest — these authenticate themselves a different way)
/// and **protected** (gated behind the `AOC_API_TOKEN` bearer-token
/// middleware, the ambient API auth layer).
pub fn router(state: AppState) -> Router<AppState> {
    let public = Router::new()
        .route("/v1/health", get(admin::health))
        .route("/v1/openapi.json", get(admin::openapi_spec))
        // Realtime
        .route("/ws", get(ws::ws_handler))
        // Jarvis device auth + SSE (self-authenticating)
        .route("/api/jarvis/auth", post(jarvis::auth))
        .route("/api/jarvis/agents", get(jarvis::list_agents))
        .route("/api/jarvis/dispatch", post(jarvis::dispatch))
        .route("/api/jarvis/events", get(jarvis::events_sse))
        // Trigger ingest (HMAC / provider-JWT self-authenticating, §4.8)
        .route("/api/triggers/:id/events", post(triggers::ingest_webhook))
        .route("/api/email/webhook/google", post(triggers::ingest_gmail));

    let protected = Router::new()
        // Agents (§6)
        .route("/api/agents", get(agents::list).post(agents::create))
        .route("/api/agents/:id", get(agents::get).put(agents::update).delete(agents::delete))
        .route("/api/agents/:id/task", post(agents::dispatch_task))
        .route("/api/agents/:id/runs", get(agents::list_runs))
        .route("/api/agents/:id/runs/:run_id/cancel", post(agents::cancel_run))
        // Threads (§6)
        .route("/api/threads/:id", get(threads::get))
        .route("/api/threads/:id/messages", get(threads::list_messages).post(threads::post_message))
        // Canvas layout (ambient, §3/§4.1)
        .route("/api/canvas/:workspace", get(canvas::get).put(canvas::put))
        // Triggers (ambient CRUD around the public ingest endpoints)
        .route("/api/triggers", get(triggers::list).post(triggers::create))
        .route("/api/triggers/:id", get(triggers::get).delete(triggers::delete))
        // Workflows (§4.9/§6)
        .route("/api/workflows", get(workflows::list).post(workflows::create))
        .route("/api/workflows/:id", get(workflows::get).put(workflows::update).delete(workflows::delete))
        .route("/api/workflows/:id/execute", post(workflows::execute))
        .route("/api/workflow-executions/:execution_id", get(workflows::get_execution))
        .route("/api/workflow-executions/:execution_id/nodes", get(workflows::node_states))
        // Operator surface
        .route("/v1/metrics", get(admin::metrics))
        .route("/v1/admin/info", get(admin::system_info))
        // Apply API auth middleware to all protected routes.
        .route_layer(middleware::from_fn_with_state(state, auth::require_api_token));

    public.merge(protected).layer(tower_http::trace::TraceLayer::new_for_http())
}
