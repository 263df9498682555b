use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use uuid::Uuid;

use aoc_domain::entities::{Run, RunStatus};
use aoc_domain::error::{Error, Result};
use aoc_domain::event::EventKind;

use crate::bus::EventBus;
use super::{append_jsonl, jsonl_path, replay_jsonl};

/// Run history: append-only JSONL, one line per create/transition, replayed
/// into a full in-memory map at startup.
pub struct RunRepo {
    path: PathBuf,
    runs: RwLock<HashMap<Uuid, Run>>,
    bus: Arc<EventBus>,
}

impl RunRepo {
    pub fn load(data_dir: &Path, bus: Arc<EventBus>) -> Result<Self> {
        let path = jsonl_path(data_dir, "runs");
        let runs = replay_jsonl(&path, |r: &Run| r.id)?;
        Ok(Self { path, runs: RwLock::new(runs), bus })
    }

    pub fn create(&self, run: Run) -> Result<Run> {
        append_jsonl(&self.path, &run)?;
        self.runs.write().insert(run.id, run.clone());
        self.bus.publish(EventKind::RunCreated {
            run_id: run.id,
            agent_id: run.agent_id,
            thread_id: run.thread_id,
            trigger: run.trigger,
        });
        Ok(run)
    }

    pub fn get(&self, id: Uuid) -> Result<Run> {
        self.runs.read().get(&id).cloned().ok_or_else(|| Error::NotFound(format!("run {id} not found")))
    }

    pub fn list_for_agent(&self, agent_id: Uuid, limit: Option<usize>) -> Vec<Run> {
        let mut runs: Vec<Run> = self
            .runs
            .read()
            .values()
            .filter(|r| r.agent_id == agent_id)
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = limit {
            runs.truncate(limit);
        }
        runs
    }

    /// Transition a run's status, enforcing the legal-transition graph
    /// (`RunStatus::can_transition_to`) and publishing `RUN_UPDATED`.
    pub fn transition(
        &self,
        id: Uuid,
        to: RunStatus,
        f: impl FnOnce(&mut Run),
    ) -> Result<Run> {
        let updated = {
            let mut guard = self.runs.write();
            let run = guard.get_mut(&id).ok_or_else(|| Error::NotFound(format!("run {id} not found")))?;
            if !run.status.can_transition_to(to) {
                return Err(Error::Conflict(format!(
                    "illegal run transition {:?} -> {:?}",
                    run.status, to
                )));
            }
            run.status = to;
            if to == RunStatus::Running {
                run.started_at = Some(Utc::now());
            }
            if to.is_terminal() {
                let now = Utc::now();
                run.finished_at = Some(now);
                if let Some(started_at) = run.started_at {
                    run.duration_ms = Some((now - started_at).num_milliseconds().max(0) as u64);
                }
            }
            f(run);
            run.updated_at = Utc::now();
            run.clone()
        };
        append_jsonl(&self.path, &updated)?;
        self.bus.publish(EventKind::RunUpdated {
            run_id: id,
            agent_id: updated.agent_id,
            thread_id: updated.thread_id,
            status: updated.status,
            error: updated.error.clone(),
            summary: updated.summary.clone(),
        });
        Ok(updated)
    }

    /// Cascade delete: drop every run belonging to `agent_id` from the
    /// in-memory index and rewrite the JSONL history without them (base
    /// spec §3's "deleting A cascades B" for Agent → Run).
    pub fn delete_for_agent(&self, agent_id: Uuid) -> Result<()> {
        let remaining: Vec<Run> = {
            let mut guard = self.runs.write();
            guard.retain(|_, r| r.agent_id != agent_id);
            guard.values().cloned().collect()
        };
        super::rewrite_jsonl(&self.path, &remaining)
    }
}
