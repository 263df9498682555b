use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use uuid::Uuid;

use aoc_domain::entities::Trigger;
use aoc_domain::error::{Error, Result};

use crate::bus::EventBus;
use super::{load_snapshot, save_snapshot, snapshot_path};

/// No dedicated bus events exist for Trigger CRUD in the base event set
/// (only `TRIGGER_FIRED`, owned by the ingest pipeline, is wired through
/// the bus) — the repo still takes `EventBus` so a future admin topic can
/// be added without changing every call site.
pub struct TriggerRepo {
    path: PathBuf,
    triggers: RwLock<HashMap<Uuid, Trigger>>,
    #[allow(dead_code)]
    bus: Arc<EventBus>,
}

impl TriggerRepo {
    pub fn load(data_dir: &Path, bus: Arc<EventBus>) -> Result<Self> {
        let path = snapshot_path(data_dir, "triggers");
        let triggers = load_snapshot(&path)?;
        Ok(Self { path, triggers: RwLock::new(triggers), bus })
    }

    fn persist(&self) -> Result<()> {
        save_snapshot(&self.path, &self.triggers.read())
    }

    pub fn create(&self, trigger: Trigger) -> Result<Trigger> {
        {
            self.triggers.write().insert(trigger.id, trigger.clone());
        }
        self.persist()?;
        Ok(trigger)
    }

    pub fn get(&self, id: Uuid) -> Result<Trigger> {
        self.triggers
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("trigger {id} not found")))
    }

    pub fn list_for_agent(&self, agent_id: Uuid) -> Vec<Trigger> {
        self.triggers
            .read()
            .values()
            .filter(|t| t.agent_id == agent_id)
            .cloned()
            .collect()
    }

    pub fn list_all(&self) -> Vec<Trigger> {
        self.triggers.read().values().cloned().collect()
    }

    /// Triggers whose Gmail watch needs renewing: `watch_expiry` is set
    /// and within the configured renewal window of `now`.
    pub fn due_for_watch_renewal(
        &self,
        now: chrono::DateTime<chrono::Utc>,
        renewal_window: chrono::Duration,
    ) -> Vec<Trigger> {
        self.triggers
            .read()
            .values()
            .filter(|t| t.watch_expiry.map(|exp| exp - now <= renewal_window).unwrap_or(false))
            .cloned()
            .collect()
    }

    pub fn update(&self, id: Uuid, f: impl FnOnce(&mut Trigger)) -> Result<Trigger> {
        let updated = {
            let mut guard = self.triggers.write();
            let trigger = guard
                .get_mut(&id)
                .ok_or_else(|| Error::NotFound(format!("trigger {id} not found")))?;
            f(trigger);
            trigger.clone()
        };
        self.persist()?;
        Ok(updated)
    }

    pub fn delete(&self, id: Uuid) -> Result<()> {
        {
            let mut guard = self.triggers.write();
            guard.remove(&id).ok_or_else(|| Error::NotFound(format!("trigger {id} not found")))?;
        }
        self.persist()
    }

    pub fn delete_for_agent(&self, agent_id: Uuid) -> Result<()> {
        {
            let mut guard = self.triggers.write();
            guard.retain(|_, t| t.agent_id != agent_id);
        }
        self.persist()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aoc_domain::entities::TriggerType;
    use serde_json::Value;
    use tempfile::tempdir;

    fn sample(agent_id: Uuid) -> Trigger {
        Trigger {
            id: Uuid::new_v4(),
            agent_id,
            kind: TriggerType::Webhook,
            secret: "s3cr3t".into(),
            config: Value::Null,
            last_message_key: None,
            history_id: None,
            watch_expiry: None,
            created_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn create_list_delete() {
        let dir = tempdir().unwrap();
        let bus = Arc::new(EventBus::new());
        let repo = TriggerRepo::load(dir.path(), bus).unwrap();
        let agent_id = Uuid::new_v4();
        let trigger = repo.create(sample(agent_id)).unwrap();

        assert_eq!(repo.list_for_agent(agent_id).len(), 1);
        repo.delete(trigger.id).unwrap();
        assert!(repo.get(trigger.id).is_err());
    }

    #[test]
    fn due_for_watch_renewal_respects_window() {
        let dir = tempdir().unwrap();
        let bus = Arc::new(EventBus::new());
        let repo = TriggerRepo::load(dir.path(), bus).unwrap();
        let agent_id = Uuid::new_v4();

        let mut soon = sample(agent_id);
        soon.watch_expiry = Some(chrono::Utc::now() + chrono::Duration::hours(1));
        let soon = repo.create(soon).unwrap();

        let mut later = sample(agent_id);
        later.watch_expiry = Some(chrono::Utc::now() + chrono::Duration::days(3));
        repo.create(later).unwrap();

        let due = repo.due_for_watch_renewal(chrono::Utc::now(), chrono::Duration::hours(24));
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, soon.id);
    }
}
