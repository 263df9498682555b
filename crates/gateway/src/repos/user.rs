use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use uuid::Uuid;

use aoc_domain::entities::{User, UserRole, SYSTEM_USER_EMAIL};
use aoc_domain::error::{Error, Result};
use aoc_domain::event::EventKind;

use crate::bus::EventBus;
use super::{load_snapshot, save_snapshot, snapshot_path};

pub struct UserRepo {
    path: PathBuf,
    users: RwLock<HashMap<Uuid, User>>,
    bus: Arc<EventBus>,
}

impl UserRepo {
    pub fn load(data_dir: &Path, bus: Arc<EventBus>) -> Result<Self> {
        let path = snapshot_path(data_dir, "users");
        let mut users = load_snapshot(&path)?;
        if !users.values().any(|u| u.email == SYSTEM_USER_EMAIL) {
            let system_user = User::new(SYSTEM_USER_EMAIL.to_string(), "Jarvis".to_string(), UserRole::SuperAdmin);
            users.insert(system_user.id, system_user);
        }
        let repo = Self { path, users: RwLock::new(users), bus };
        repo.persist()?;
        Ok(repo)
    }

    fn persist(&self) -> Result<()> {
        save_snapshot(&self.path, &self.users.read())
    }

    pub fn create(&self, user: User) -> Result<User> {
        {
            self.users.write().insert(user.id, user.clone());
        }
        self.persist()?;
        Ok(user)
    }

    pub fn get(&self, id: Uuid) -> Result<User> {
        self.users.read().get(&id).cloned().ok_or_else(|| Error::NotFound(format!("user {id} not found")))
    }

    pub fn get_by_email(&self, email: &str) -> Option<User> {
        self.users.read().values().find(|u| u.email == email).cloned()
    }

    pub fn system_user(&self) -> User {
        self.get_by_email(SYSTEM_USER_EMAIL).expect("system user seeded at startup")
    }

    pub fn update(&self, id: Uuid, f: impl FnOnce(&mut User)) -> Result<User> {
        let updated = {
            let mut guard = self.users.write();
            let user = guard.get_mut(&id).ok_or_else(|| Error::NotFound(format!("user {id} not found")))?;
            f(user);
            user.updated_at = Utc::now();
            user.clone()
        };
        self.persist()?;
        self.bus.publish(EventKind::UserUpdated { user_id: id });
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn system_user_is_seeded_on_first_load() {
        let dir = tempdir().unwrap();
        let bus = Arc::new(EventBus::new());
        let repo = UserRepo::load(dir.path(), bus).unwrap();
        let system = repo.system_user();
        assert_eq!(system.email, SYSTEM_USER_EMAIL);
    }

    #[test]
    fn system_user_is_not_duplicated_on_reload() {
        let dir = tempdir().unwrap();
        {
            let bus = Arc::new(EventBus::new());
            UserRepo::load(dir.path(), bus).unwrap();
        }
        let bus = Arc::new(EventBus::new());
        let repo = UserRepo::load(dir.path(), bus).unwrap();
        let count = repo.users.read().values().filter(|u| u.email == SYSTEM_USER_EMAIL).count();
        assert_eq!(count, 1);
    }

    #[test]
    fn update_publishes_user_updated() {
        let dir = tempdir().unwrap();
        let bus = Arc::new(EventBus::new());
        let repo = UserRepo::load(dir.path(), bus.clone()).unwrap();
        let mut rx = bus.subscribe();
        let user = repo.create(User::new("a@b.com".into(), "A".into(), UserRole::User)).unwrap();
        repo.update(user.id, |u| u.display_name = "B".into()).unwrap();
        let event = rx.try_recv();
        assert!(matches!(event, Ok(EventKind::UserUpdated { .. })));
    }
}
