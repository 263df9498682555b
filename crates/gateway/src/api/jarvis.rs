//! `/api/jarvis/*` — the voice-interface surface.
//!
//! Device-secret auth is a single trusted front door (there is no
//! multi-tenant OAuth in this core), so every session it issues resolves
//! to the reserved system user (`aoc_domain::entities::SYSTEM_USER_EMAIL`).
//! Sessions are a signed JWT, carried either as an HttpOnly cookie (browser
//! clients) or a bearer/`?token=` query param (voice-device clients, and
//! SSE — browsers can't set a header on an `EventSource` request).

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::{HeaderMap, HeaderValue};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures_util::Stream;
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use serde_json::json;
use subtle::ConstantTimeEq;
use uuid::Uuid;

use aoc_domain::entities::{Agent, ApiPrincipal, RunTrigger, ThreadType, UserRole};
use aoc_domain::Error;

use crate::api::error::{ApiError, ApiResult};
use crate::state::AppState;
use crate::task_runner::TaskTrigger;

const SESSION_COOKIE: &str = "aoc_jarvis_session";

#[derive(Serialize, Deserialize)]
struct Claims {
    sub: Uuid,
    exp: i64,
}

#[derive(Deserialize)]
pub struct AuthRequest {
    pub device_secret: String,
}

#[derive(Deserialize)]
pub struct DispatchRequest {
    pub agent_id: Uuid,
    #[serde(default)]
    pub task_override: Option<String>,
}

#[derive(Deserialize, Default)]
pub struct TokenQuery {
    pub token: Option<String>,
}

/// `POST /api/jarvis/auth` — exchange the shared device secret for a
/// session. 503 when no device secret is configured.
pub async fn auth(State(state): State<AppState>, Json(req): Json<AuthRequest>) -> ApiResult<Response> {
    let expected = state
        .jarvis_device_secret
        .as_ref()
        .ok_or_else(|| ApiError::from(Error::Unavailable("Jarvis device auth is not configured".into())))?;

    if !bool::from(req.device_secret.as_bytes().ct_eq(expected.as_bytes())) {
        return Err(ApiError::from(Error::Unauthorized("invalid device secret".into())));
    }

    let user = state.users.system_user();
    let exp = chrono::Utc::now().timestamp() + state.jarvis_session_ttl_sec;
    let claims = Claims { sub: user.id, exp };
    let token = jsonwebtoken::encode(&Header::default(), &claims, &EncodingKey::from_secret(&state.jarvis_jwt_secret))
        .map_err(|e| ApiError::from(Error::Other(e.to_string())))?;

    let cookie = format!(
        "{SESSION_COOKIE}={token}; Path=/; HttpOnly; SameSite=Lax; Max-Age={}",
        state.jarvis_session_ttl_sec
    );

    let mut response = Json(json!({ "token": token, "user_id": user.id, "expires_at": exp })).into_response();
    response
        .headers_mut()
        .insert(axum::http::header::SET_COOKIE, HeaderValue::from_str(&cookie).expect("cookie value is ASCII"));
    Ok(response)
}

/// `GET /api/jarvis/agents`
pub async fn list_agents(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(q): Query<TokenQuery>,
) -> ApiResult<Json<Vec<Agent>>> {
    let principal = resolve_principal(&state, &headers, q.token.as_deref())?;
    Ok(Json(state.agents.list_for_owner(principal.user_id)))
}

/// `POST /api/jarvis/dispatch` — `{agent_id, task_override?} -> {run_id,
/// thread_id}`, same fire-and-return contract as
/// `POST /api/agents/{id}/task`.
pub async fn dispatch(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<DispatchRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    resolve_principal(&state, &headers, None)?;

    let trigger = TaskTrigger::New {
        thread_type: ThreadType::Manual,
        trigger: RunTrigger::Api,
        task_override: req.task_override,
    };
    let outcome = state.task_runner.clone().dispatch(req.agent_id, trigger)?;
    Ok(Json(json!({ "run_id": outcome.run_id, "thread_id": outcome.thread_id })))
}

/// `GET /api/jarvis/events` (SSE) — session cookie or `?token=` (the
/// latter allowed since `EventSource` can't set headers). Streams
/// every event for every agent the session's principal
/// owns, framed the same way the WS hub frames `Envelope`s.
pub async fn events_sse(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(q): Query<TokenQuery>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let principal = resolve_principal(&state, &headers, q.token.as_deref())?;

    let (conn_id, mut rx) = state.hub.register();
    state.hub.subscribe(conn_id, &format!("user:{}", principal.user_id));
    for agent in state.agents.list_for_owner(principal.user_id) {
        state.hub.subscribe(conn_id, &format!("agent:{}", agent.id));
    }

    let hub = state.hub.clone();
    let stream = async_stream::stream! {
        let _guard = UnregisterOnDrop { hub: hub.clone(), conn_id };
        yield Ok(Event::default().event("connected").data(json!({ "type": "connected" }).to_string()));
        loop {
            tokio::select! {
                envelope = rx.recv() => {
                    match envelope {
                        Some(envelope) => yield Ok(Event::default().event(envelope.kind.clone()).data(envelope.data.to_string())),
                        None => break,
                    }
                }
                _ = tokio::time::sleep(Duration::from_secs(25)) => {
                    yield Ok(Event::default().comment(""));
                }
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

struct UnregisterOnDrop {
    hub: crate::hub::Hub,
    conn_id: Uuid,
}

impl Drop for UnregisterOnDrop {
    fn drop(&mut self) {
        self.hub.unregister(self.conn_id);
    }
}

fn resolve_principal(state: &AppState, headers: &HeaderMap, token_query: Option<&str>) -> ApiResult<ApiPrincipal> {
    let token = bearer_token(headers)
        .or_else(|| cookie_token(headers))
        .or(token_query)
        .ok_or_else(|| ApiError::from(Error::Unauthorized("missing Jarvis session".into())))?;

    let validation = Validation::default();
    let data = jsonwebtoken::decode::<Claims>(
        token,
        &DecodingKey::from_secret(&state.jarvis_jwt_secret),
        &validation,
    )
    .map_err(|e| ApiError::from(Error::Unauthorized(format!("invalid Jarvis session: {e}"))))?;

    Ok(ApiPrincipal { user_id: data.claims.sub, role: UserRole::SuperAdmin })
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers.get(axum::http::header::AUTHORIZATION)?.to_str().ok()?.strip_prefix("Bearer ")
}

fn cookie_token(headers: &HeaderMap) -> Option<&str> {
    let raw = headers.get(axum::http::header::COOKIE)?.to_str().ok()?;
    raw.split(';').find_map(|kv| {
        let (k, v) = kv.trim().split_once('=')?;
        (k == SESSION_COOKIE).then_some(v)
    })
}
