//! `/api/canvas/{workspace}` — atomic get-or-create / upsert for the
//! per-user canvas layout entity. All canvas requests resolve to the
//! Jarvis system user for now: the core has no separate multi-user
//! session concept on the REST surface outside of Jarvis device auth
//! (multi-tenant isolation beyond per-user ownership checks is out of
//! scope).

use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;
use serde_json::Value;

use aoc_domain::entities::CanvasLayout;

use crate::api::error::ApiResult;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct SaveCanvasRequest {
    #[serde(default)]
    pub positions: Value,
    #[serde(default)]
    pub viewport: Value,
}

/// `GET /api/canvas/{workspace}`
pub async fn get(State(state): State<AppState>, Path(workspace): Path<String>) -> ApiResult<Json<CanvasLayout>> {
    let owner_id = state.users.system_user().id;
    Ok(Json(state.canvas.get_or_create(owner_id, &workspace)))
}

/// `PUT /api/canvas/{workspace}` — atomic upsert; repeating the same
/// positions/viewport is a no-op in observable state.
pub async fn put(
    State(state): State<AppState>,
    Path(workspace): Path<String>,
    Json(req): Json<SaveCanvasRequest>,
) -> ApiResult<Json<CanvasLayout>> {
    let owner_id = state.users.system_user().id;
    Ok(Json(state.canvas.save(owner_id, &workspace, req.positions, req.viewport)?))
}
