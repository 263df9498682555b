//! `/api/threads` — the `messages` operations plus ambient thread CRUD.

use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use aoc_domain::entities::{Message, Thread};

use crate::api::error::ApiResult;
use crate::state::AppState;
use crate::task_runner::TaskTrigger;

#[derive(Deserialize)]
pub struct PostMessageRequest {
    pub content: String,
}

#[derive(Deserialize, Default)]
pub struct ListMessagesQuery {
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

pub async fn get(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Json<Thread>> {
    Ok(Json(state.threads.get_thread(id)?))
}

/// `GET /api/threads/{id}/messages`
pub async fn list_messages(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(q): Query<ListMessagesQuery>,
) -> ApiResult<Json<Vec<Message>>> {
    Ok(Json(state.threads.list_messages(id, q.since, q.limit)?))
}

/// `POST /api/threads/{id}/messages` — append the caller's message and
/// dispatch the owning agent, returning as soon as the `Run` exists (same
/// fire-and-return contract as `POST /api/agents/{id}/task`). A
/// contended lock still leaves the appended message in place; the
/// caller sees it reflected in the response rather than losing it.
pub async fn post_message(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<PostMessageRequest>,
) -> ApiResult<Json<Value>> {
    let thread = state.threads.get_thread(id)?;

    let message = Message::user(thread.id, req.content);
    state.threads.append_messages(thread.id, vec![message.clone()])?;

    let outcome = state
        .task_runner
        .clone()
        .dispatch(thread.agent_id, TaskTrigger::Chat { thread_id: thread.id });

    match outcome {
        Ok(outcome) => Ok(Json(json!({
            "message": message,
            "run_id": outcome.run_id,
            "thread_id": outcome.thread_id,
        }))),
        Err(e) if matches!(e, aoc_domain::Error::Conflict(_)) => {
            Ok(Json(json!({ "message": message, "run_id": null, "error": e.to_string() })))
        }
        Err(e) => Err(e.into()),
    }
}
