use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use uuid::Uuid;

use aoc_domain::entities::{NodeExecutionState, NodeStatus, Workflow, WorkflowExecution, WorkflowStatus};
use aoc_domain::error::{Error, Result};
use aoc_domain::event::EventKind;

use crate::bus::EventBus;
use super::{append_jsonl, jsonl_path, load_snapshot, replay_jsonl, save_snapshot, snapshot_path};

/// Workflow definitions: low-volume, snapshot-backed like `AgentRepo`.
/// Deletion is soft (`deleted_at`) per the entity's `is_deleted()` helper.
pub struct WorkflowRepo {
    path: PathBuf,
    workflows: RwLock<HashMap<Uuid, Workflow>>,
}

impl WorkflowRepo {
    pub fn load(data_dir: &Path) -> Result<Self> {
        let path = snapshot_path(data_dir, "workflows");
        let workflows = load_snapshot(&path)?;
        Ok(Self { path, workflows: RwLock::new(workflows) })
    }

    fn persist(&self) -> Result<()> {
        save_snapshot(&self.path, &self.workflows.read())
    }

    pub fn create(&self, workflow: Workflow) -> Result<Workflow> {
        crate::workflow_engine::validate_acyclic(&workflow.graph)?;
        {
            self.workflows.write().insert(workflow.id, workflow.clone());
        }
        self.persist()?;
        Ok(workflow)
    }

    pub fn get(&self, id: Uuid) -> Result<Workflow> {
        self.workflows
            .read()
            .get(&id)
            .filter(|w| !w.is_deleted())
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("workflow {id} not found")))
    }

    pub fn list_for_owner(&self, owner_id: Uuid) -> Vec<Workflow> {
        self.workflows
            .read()
            .values()
            .filter(|w| w.owner_id == owner_id && !w.is_deleted())
            .cloned()
            .collect()
    }

    pub fn update(&self, id: Uuid, f: impl FnOnce(&mut Workflow)) -> Result<Workflow> {
        let updated = {
            let mut guard = self.workflows.write();
            let existing = guard
                .get(&id)
                .filter(|w| !w.is_deleted())
                .ok_or_else(|| Error::NotFound(format!("workflow {id} not found")))?;
            let mut candidate = existing.clone();
            f(&mut candidate);
            crate::workflow_engine::validate_acyclic(&candidate.graph)?;
            candidate.updated_at = Utc::now();
            guard.insert(id, candidate.clone());
            candidate
        };
        self.persist()?;
        Ok(updated)
    }

    pub fn soft_delete(&self, id: Uuid) -> Result<()> {
        {
            let mut guard = self.workflows.write();
            let workflow = guard
                .get_mut(&id)
                .ok_or_else(|| Error::NotFound(format!("workflow {id} not found")))?;
            workflow.deleted_at = Some(Utc::now());
        }
        self.persist()
    }
}

/// Workflow execution history: append-only JSONL, replayed at startup.
pub struct WorkflowExecutionRepo {
    executions_path: PathBuf,
    nodes_path: PathBuf,
    executions: RwLock<HashMap<Uuid, WorkflowExecution>>,
    nodes: RwLock<HashMap<Uuid, NodeExecutionState>>,
    bus: Arc<EventBus>,
}

impl WorkflowExecutionRepo {
    pub fn load(data_dir: &Path, bus: Arc<EventBus>) -> Result<Self> {
        let executions_path = jsonl_path(data_dir, "workflow_executions");
        let nodes_path = jsonl_path(data_dir, "node_execution_states");
        let executions = replay_jsonl(&executions_path, |e: &WorkflowExecution| e.id)?;
        let nodes = replay_jsonl(&nodes_path, |n: &NodeExecutionState| n.id)?;
        Ok(Self {
            executions_path,
            nodes_path,
            executions: RwLock::new(executions),
            nodes: RwLock::new(nodes),
            bus,
        })
    }

    pub fn create_execution(&self, execution: WorkflowExecution) -> Result<WorkflowExecution> {
        append_jsonl(&self.executions_path, &execution)?;
        self.executions.write().insert(execution.id, execution.clone());
        Ok(execution)
    }

    pub fn get_execution(&self, id: Uuid) -> Result<WorkflowExecution> {
        self.executions
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("workflow execution {id} not found")))
    }

    pub fn finish_execution(
        &self,
        id: Uuid,
        status: WorkflowStatus,
        error: Option<String>,
    ) -> Result<WorkflowExecution> {
        let updated = {
            let mut guard = self.executions.write();
            let execution = guard
                .get_mut(&id)
                .ok_or_else(|| Error::NotFound(format!("workflow execution {id} not found")))?;
            execution.status = status;
            execution.finished_at = Some(Utc::now());
            execution.error = error.clone();
            execution.clone()
        };
        append_jsonl(&self.executions_path, &updated)?;

        let duration_ms = updated
            .finished_at
            .zip(Some(updated.started_at))
            .map(|(end, start)| (end - start).num_milliseconds().max(0) as u64)
            .unwrap_or(0);
        self.bus.publish(EventKind::ExecutionFinished {
            execution_id: id,
            status,
            duration_ms,
            error,
        });
        Ok(updated)
    }

    pub fn append_log(&self, id: Uuid, line: &str) -> Result<()> {
        let updated = {
            let mut guard = self.executions.write();
            let execution = guard
                .get_mut(&id)
                .ok_or_else(|| Error::NotFound(format!("workflow execution {id} not found")))?;
            let log = execution.log.get_or_insert_with(String::new);
            if !log.is_empty() {
                log.push('\n');
            }
            log.push_str(line);
            execution.clone()
        };
        append_jsonl(&self.executions_path, &updated)
    }

    pub fn upsert_node_state(&self, node: NodeExecutionState) -> Result<NodeExecutionState> {
        append_jsonl(&self.nodes_path, &node)?;
        self.nodes.write().insert(node.id, node.clone());
        self.bus.publish(EventKind::NodeState {
            execution_id: node.execution_id,
            node_id: node.node_id.clone(),
            status: node.status,
            output: node.output.clone(),
            error: node.error.clone(),
        });
        Ok(node)
    }

    pub fn emit_node_log(&self, execution_id: Uuid, node_id: &str, text: &str) {
        self.bus.publish(EventKind::NodeLog {
            execution_id,
            node_id: node_id.to_string(),
            text: text.to_string(),
        });
    }

    pub fn node_states_for_execution(&self, execution_id: Uuid) -> Vec<NodeExecutionState> {
        self.nodes
            .read()
            .values()
            .filter(|n| n.execution_id == execution_id)
            .cloned()
            .collect()
    }
}

/// Build a fresh `NodeExecutionState` row in the given status.
pub fn new_node_state(execution_id: Uuid, node_id: &str, status: NodeStatus) -> NodeExecutionState {
    NodeExecutionState {
        id: Uuid::new_v4(),
        execution_id,
        node_id: node_id.to_string(),
        status,
        output: None,
        error: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aoc_domain::entities::{WorkflowEdge, WorkflowGraph, WorkflowNode, WorkflowNodeType};
    use tempfile::tempdir;

    fn sample_workflow(owner_id: Uuid) -> Workflow {
        let now = Utc::now();
        Workflow {
            id: Uuid::new_v4(),
            owner_id,
            name: "pipeline".into(),
            graph: WorkflowGraph {
                nodes: vec![WorkflowNode {
                    id: "n1".into(),
                    kind: WorkflowNodeType::Action,
                    config: serde_json::Value::Null,
                    fail_workflow: true,
                    max_retries: 0,
                }],
                edges: vec![],
            },
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    #[test]
    fn soft_deleted_workflows_are_hidden() {
        let dir = tempdir().unwrap();
        let repo = WorkflowRepo::load(dir.path()).unwrap();
        let owner = Uuid::new_v4();
        let workflow = repo.create(sample_workflow(owner)).unwrap();

        repo.soft_delete(workflow.id).unwrap();
        assert!(repo.get(workflow.id).is_err());
        assert!(repo.list_for_owner(owner).is_empty());
    }

    #[test]
    fn execution_log_replays_after_reload() {
        let dir = tempdir().unwrap();
        let owner = Uuid::new_v4();
        let execution_id;
        {
            let bus = Arc::new(EventBus::new());
            let repo = WorkflowExecutionRepo::load(dir.path(), bus).unwrap();
            let execution = WorkflowExecution {
                id: Uuid::new_v4(),
                workflow_id: Uuid::new_v4(),
                owner_id: owner,
                status: WorkflowStatus::Running,
                started_at: Utc::now(),
                finished_at: None,
                error: None,
                log: None,
            };
            execution_id = execution.id;
            repo.create_execution(execution).unwrap();
            repo.finish_execution(execution_id, WorkflowStatus::Success, None).unwrap();
        }
        let bus = Arc::new(EventBus::new());
        let reloaded = WorkflowExecutionRepo::load(dir.path(), bus).unwrap();
        let execution = reloaded.get_execution(execution_id).unwrap();
        assert_eq!(execution.status, WorkflowStatus::Success);
    }
}
