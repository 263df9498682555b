//! `/api/workflows` — ambient CRUD plus the `execute` operation.

use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use aoc_domain::entities::{Workflow, WorkflowExecution, WorkflowGraph};

use crate::api::error::ApiResult;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct CreateWorkflowRequest {
    pub name: String,
    pub graph: WorkflowGraph,
}

#[derive(Deserialize, Default)]
pub struct UpdateWorkflowRequest {
    pub name: Option<String>,
    pub graph: Option<WorkflowGraph>,
}

#[derive(Deserialize, Default)]
pub struct ExecuteWorkflowRequest {
    #[serde(default)]
    pub input: Value,
}

pub async fn list(State(state): State<AppState>) -> Json<Vec<Workflow>> {
    let owner_id = state.users.system_user().id;
    Json(state.workflows.list_for_owner(owner_id))
}

pub async fn create(
    State(state): State<AppState>,
    Json(req): Json<CreateWorkflowRequest>,
) -> ApiResult<Json<Workflow>> {
    crate::workflow_engine::validate_acyclic(&req.graph)?;

    let now = chrono::Utc::now();
    let workflow = Workflow {
        id: Uuid::new_v4(),
        owner_id: state.users.system_user().id,
        name: req.name,
        graph: req.graph,
        created_at: now,
        updated_at: now,
        deleted_at: None,
    };
    Ok(Json(state.workflows.create(workflow)?))
}

pub async fn get(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Json<Workflow>> {
    Ok(Json(state.workflows.get(id)?))
}

pub async fn update(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateWorkflowRequest>,
) -> ApiResult<Json<Workflow>> {
    if let Some(graph) = &req.graph {
        crate::workflow_engine::validate_acyclic(graph)?;
    }
    let workflow = state.workflows.update(id, |w| {
        if let Some(name) = req.name.clone() {
            w.name = name;
        }
        if let Some(graph) = req.graph.clone() {
            w.graph = graph;
        }
    })?;
    Ok(Json(workflow))
}

pub async fn delete(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Json<Value>> {
    state.workflows.soft_delete(id)?;
    Ok(Json(json!({ "deleted": true })))
}

/// `POST /api/workflows/{id}/execute` — fires the DAG and returns
/// `{execution_id}` immediately; the run itself is observed over
/// WS/SSE as `node_state`/`node_log`/`execution_finished`.
pub async fn execute(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<ExecuteWorkflowRequest>,
) -> ApiResult<Json<Value>> {
    let owner_id = state.users.system_user().id;
    let execution = state.workflow_engine.clone().dispatch(id, owner_id, req.input)?;
    Ok(Json(json!({ "execution_id": execution.id })))
}

/// `GET /api/workflow-executions/{execution_id}`
pub async fn get_execution(
    State(state): State<AppState>,
    Path(execution_id): Path<Uuid>,
) -> ApiResult<Json<WorkflowExecution>> {
    Ok(Json(state.executions.get_execution(execution_id)?))
}

/// `GET /api/workflow-executions/{execution_id}/nodes`
pub async fn node_states(
    State(state): State<AppState>,
    Path(execution_id): Path<Uuid>,
) -> Json<Vec<aoc_domain::entities::NodeExecutionState>> {
    Json(state.executions.node_states_for_execution(execution_id))
}
