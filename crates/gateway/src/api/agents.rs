//! `/api/agents` — CRUD plus the `task`/`runs` operations.

use std::collections::HashSet;

use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use aoc_domain::entities::{Agent, AgentStatus, RunTrigger, ThreadType};

use crate::api::error::{ApiError, ApiResult};
use crate::state::AppState;
use crate::task_runner::TaskTrigger;

#[derive(Deserialize)]
pub struct CreateAgentRequest {
    pub name: String,
    #[serde(default)]
    pub system_instructions: String,
    #[serde(default)]
    pub task_instructions: String,
    pub model: String,
    pub temperature: Option<f32>,
    pub schedule: Option<String>,
    #[serde(default)]
    pub config: Value,
    #[serde(default)]
    pub allowed_tools: HashSet<String>,
}

#[derive(Deserialize, Default)]
pub struct UpdateAgentRequest {
    pub name: Option<String>,
    pub system_instructions: Option<String>,
    pub task_instructions: Option<String>,
    pub model: Option<String>,
    pub temperature: Option<f32>,
    /// `Some(None)` clears the schedule, `None` leaves it untouched,
    /// `Some(Some(expr))` sets a new one. Callers send `"schedule": null`
    /// to clear, omit the field to leave alone, or a string to set.
    #[serde(default, deserialize_with = "deserialize_double_option")]
    pub schedule: Option<Option<String>>,
    pub config: Option<Value>,
    pub allowed_tools: Option<HashSet<String>>,
}

fn deserialize_double_option<'de, D>(deserializer: D) -> Result<Option<Option<String>>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Some(Option::deserialize(deserializer)?))
}

#[derive(Deserialize, Default)]
pub struct DispatchTaskRequest {
    #[serde(default)]
    pub task_override: Option<String>,
}

#[derive(Deserialize, Default)]
pub struct ListRunsQuery {
    pub limit: Option<usize>,
}

pub async fn list(State(state): State<AppState>) -> Json<Vec<Agent>> {
    Json(state.agents.list_all())
}

pub async fn create(
    State(state): State<AppState>,
    Json(req): Json<CreateAgentRequest>,
) -> ApiResult<Json<Agent>> {
    if let Some(cron) = &req.schedule {
        crate::scheduler::validate_cron(cron).map_err(ApiError::from)?;
    }

    let now = Utc::now();
    let owner_id = state.users.system_user().id;
    let agent = Agent {
        id: Uuid::new_v4(),
        owner_id,
        name: req.name,
        system_instructions: req.system_instructions,
        task_instructions: req.task_instructions,
        model: req.model,
        temperature: req.temperature.unwrap_or(0.7),
        schedule: None,
        status: AgentStatus::Idle,
        last_run_at: None,
        next_run_at: None,
        last_error: None,
        config: req.config,
        allowed_tools: req.allowed_tools,
        created_at: now,
        updated_at: now,
    };
    let agent = state.agents.create(agent)?;

    let agent = if let Some(cron) = req.schedule {
        state.scheduler.schedule_agent(agent.id, &cron)?
    } else {
        agent
    };

    Ok(Json(agent))
}

pub async fn get(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Json<Agent>> {
    Ok(Json(state.agents.get(id)?))
}

pub async fn update(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateAgentRequest>,
) -> ApiResult<Json<Agent>> {
    if let Some(Some(cron)) = &req.schedule {
        crate::scheduler::validate_cron(cron).map_err(ApiError::from)?;
    }

    state.agents.update(id, |a| {
        if let Some(name) = req.name.clone() {
            a.name = name;
        }
        if let Some(v) = req.system_instructions.clone() {
            a.system_instructions = v;
        }
        if let Some(v) = req.task_instructions.clone() {
            a.task_instructions = v;
        }
        if let Some(v) = req.model.clone() {
            a.model = v;
        }
        if let Some(v) = req.temperature {
            a.temperature = v;
        }
        if let Some(v) = req.config.clone() {
            a.config = v;
        }
        if let Some(v) = req.allowed_tools.clone() {
            a.allowed_tools = v;
        }
    })?;

    let agent = match req.schedule {
        Some(Some(cron)) => state.scheduler.schedule_agent(id, &cron)?,
        Some(None) => state.scheduler.unschedule_agent(id)?,
        None => state.agents.get(id)?,
    };

    Ok(Json(agent))
}

/// Deletes the agent and cascades to every Thread/Message, Run, and
/// Trigger it owns ("deleting A cascades B").
pub async fn delete(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Json<Value>> {
    state.agents.delete(id)?;
    state.threads.delete_threads_for_agent(id)?;
    state.runs.delete_for_agent(id)?;
    state.triggers.delete_for_agent(id)?;
    Ok(Json(json!({ "deleted": true })))
}

/// `POST /api/agents/{id}/task` — dispatch the agent's task instructions
/// (or an override) and return `{run_id, thread_id}` as soon as the `Run`
/// exists, without waiting for the turn to finish. A
/// contended lock surfaces as `Busy` synchronously; progress after that is
/// only observable via `run_update`/`thread_*` events on the WS/SSE surface.
pub async fn dispatch_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<DispatchTaskRequest>,
) -> ApiResult<Json<Value>> {
    let trigger = TaskTrigger::New {
        thread_type: ThreadType::Manual,
        trigger: RunTrigger::Api,
        task_override: req.task_override,
    };
    let outcome = state.task_runner.clone().dispatch(id, trigger)?;
    Ok(Json(json!({ "run_id": outcome.run_id, "thread_id": outcome.thread_id })))
}

/// `GET /api/agents/{id}/runs`
pub async fn list_runs(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(q): Query<ListRunsQuery>,
) -> ApiResult<Json<Vec<aoc_domain::entities::Run>>> {
    // Ensure the agent exists so a bad id 404s instead of silently
    // returning an empty list.
    state.agents.get(id)?;
    Ok(Json(state.runs.list_for_agent(id, q.limit)))
}

/// `POST /api/agents/{id}/runs/{run_id}/cancel` — the external
/// `cancel(run_id)` signal, surfaced over the wire. 404s on an unknown run
/// (or one belonging to another agent); a run that has already finished
/// simply reports `cancelled: false` since the executor has nothing left
/// to observe the flag.
pub async fn cancel_run(
    State(state): State<AppState>,
    Path((id, run_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<Json<Value>> {
    let run = state.runs.get(run_id)?;
    if run.agent_id != id {
        return Err(aoc_domain::Error::NotFound(format!("run {run_id} not found")).into());
    }
    let cancelled = state.task_runner.cancel(run_id);
    Ok(Json(json!({ "cancelled": cancelled })))
}
