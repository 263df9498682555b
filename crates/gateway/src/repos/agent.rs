use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use uuid::Uuid;

use aoc_domain::entities::{Agent, AgentStatus};
use aoc_domain::error::{Error, Result};
use aoc_domain::event::EventKind;

use crate::bus::EventBus;
use super::{load_snapshot, save_snapshot, snapshot_path};

pub struct AgentRepo {
    path: PathBuf,
    agents: RwLock<HashMap<Uuid, Agent>>,
    bus: Arc<EventBus>,
}

impl AgentRepo {
    pub fn load(data_dir: &Path, bus: Arc<EventBus>) -> Result<Self> {
        let path = snapshot_path(data_dir, "agents");
        let agents = load_snapshot(&path)?;
        Ok(Self { path, agents: RwLock::new(agents), bus })
    }

    fn persist(&self) -> Result<()> {
        save_snapshot(&self.path, &self.agents.read())
    }

    pub fn create(&self, agent: Agent) -> Result<Agent> {
        {
            let mut guard = self.agents.write();
            guard.insert(agent.id, agent.clone());
        }
        self.persist()?;
        self.bus.publish(EventKind::AgentCreated { agent_id: agent.id, agent: agent.clone() });
        Ok(agent)
    }

    pub fn get(&self, id: Uuid) -> Result<Agent> {
        self.agents
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("agent {id} not found")))
    }

    pub fn list_for_owner(&self, owner_id: Uuid) -> Vec<Agent> {
        self.agents
            .read()
            .values()
            .filter(|a| a.owner_id == owner_id)
            .cloned()
            .collect()
    }

    pub fn list_all(&self) -> Vec<Agent> {
        self.agents.read().values().cloned().collect()
    }

    /// List every agent that is due to run right now: has a schedule,
    /// an already-computed `next_run_at`, and is not currently `Running`.
    pub fn due_for_schedule(&self, now: chrono::DateTime<Utc>) -> Vec<Agent> {
        self.agents
            .read()
            .values()
            .filter(|a| a.status != AgentStatus::Running)
            .filter(|a| a.schedule.is_some())
            .filter(|a| a.next_run_at.map(|t| t <= now).unwrap_or(false))
            .cloned()
            .collect()
    }

    pub fn update(&self, id: Uuid, f: impl FnOnce(&mut Agent)) -> Result<Agent> {
        let updated = {
            let mut guard = self.agents.write();
            let agent = guard
                .get_mut(&id)
                .ok_or_else(|| Error::NotFound(format!("agent {id} not found")))?;
            f(agent);
            agent.updated_at = Utc::now();
            agent.clone()
        };
        self.persist()?;
        self.bus.publish(EventKind::AgentUpdated { agent_id: id, agent: updated.clone() });
        Ok(updated)
    }

    pub fn delete(&self, id: Uuid) -> Result<()> {
        {
            let mut guard = self.agents.write();
            guard.remove(&id).ok_or_else(|| Error::NotFound(format!("agent {id} not found")))?;
        }
        self.persist()?;
        self.bus.publish(EventKind::AgentDeleted { agent_id: id });
        Ok(())
    }
}
