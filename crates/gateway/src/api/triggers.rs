//! `/api/triggers` — ambient CRUD plus the webhook/email ingest
//! endpoints.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use aoc_domain::entities::{Trigger, TriggerType};

use crate::api::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Deserialize)]
pub struct CreateTriggerRequest {
    pub agent_id: Uuid,
    #[serde(rename = "type")]
    pub kind: TriggerType,
    #[serde(default)]
    pub config: Value,
}

/// 244 bits of `uuid::Uuid::new_v4` entropy, hex-encoded — the webhook
/// HMAC key and the value Gmail push dedup compares `last_message_key`
/// against.
fn generate_secret() -> String {
    format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple())
}

pub async fn list(State(state): State<AppState>) -> Json<Vec<Trigger>> {
    Json(state.triggers.list_all())
}

pub async fn create(
    State(state): State<AppState>,
    Json(req): Json<CreateTriggerRequest>,
) -> ApiResult<Json<Trigger>> {
    state.agents.get(req.agent_id)?;
    let trigger = Trigger {
        id: Uuid::new_v4(),
        agent_id: req.agent_id,
        kind: req.kind,
        secret: generate_secret(),
        config: req.config,
        last_message_key: None,
        history_id: None,
        watch_expiry: None,
        created_at: chrono::Utc::now(),
    };
    Ok(Json(state.triggers.create(trigger)?))
}

pub async fn get(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Json<Trigger>> {
    Ok(Json(state.triggers.get(id)?))
}

pub async fn delete(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Json<Value>> {
    state.triggers.delete(id)?;
    Ok(Json(json!({ "deleted": true })))
}

/// `POST /api/triggers/{id}/events` — generic webhook ingest.
/// HMAC-SHA256 over the raw body, keyed by the trigger's `secret`,
/// presented in `X-Signature` as `sha256=<hex>`.
pub async fn ingest_webhook(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let signature = headers
        .get("x-signature")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    state.webhook_ingest.handle_webhook(id, signature, &body)?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "accepted": true }))))
}

/// `POST /api/email/webhook/google` — Gmail Pub/Sub push ingest. 503s
/// when Gmail ingest isn't configured.
pub async fn ingest_gmail(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let gmail = state
        .gmail_ingest
        .as_ref()
        .ok_or_else(|| ApiError::from(aoc_domain::Error::Unavailable("Gmail push ingest is not configured".into())))?;
    let authorization = headers.get("authorization").and_then(|v| v.to_str().ok());
    gmail.handle_push(authorization, &body).await?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "accepted": true }))))
}
