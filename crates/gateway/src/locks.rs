//! Per-agent run lock — enforces "at most one concurrent run per agent"
//! (S0) with immediate failure on contention rather than queueing
//! behind a blocking acquire.
//!
//! Falling back to a *blocking* `acquire_owned()` when a non-blocking
//! `try_acquire_owned()` fails would silently serialize concurrent
//! task-runner invocations instead of rejecting them — the second
//! caller must see `Busy` immediately. This map only ever tries.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use uuid::Uuid;

#[derive(Default)]
pub struct AgentLockMap {
    semaphores: Mutex<HashMap<Uuid, Arc<Semaphore>>>,
}

/// Held for the lifetime of a single run. Dropping it releases the lock.
pub struct AgentLockGuard(#[allow(dead_code)] OwnedSemaphorePermit);

impl AgentLockMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to acquire the lock for `agent_id`. Returns `None` immediately
    /// if another run already holds it — never blocks.
    pub fn try_acquire(&self, agent_id: Uuid) -> Option<AgentLockGuard> {
        let semaphore = self
            .semaphores
            .lock()
            .entry(agent_id)
            .or_insert_with(|| Arc::new(Semaphore::new(1)))
            .clone();
        semaphore.try_acquire_owned().ok().map(AgentLockGuard)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_fails_while_first_is_held() {
        let map = AgentLockMap::new();
        let agent_id = Uuid::new_v4();
        let first = map.try_acquire(agent_id);
        assert!(first.is_some());
        let second = map.try_acquire(agent_id);
        assert!(second.is_none(), "contended lock must fail immediately, not block");
    }

    #[test]
    fn lock_is_released_on_drop() {
        let map = AgentLockMap::new();
        let agent_id = Uuid::new_v4();
        {
            let _guard = map.try_acquire(agent_id).unwrap();
            assert!(map.try_acquire(agent_id).is_none());
        }
        assert!(map.try_acquire(agent_id).is_some());
    }

    #[test]
    fn different_agents_do_not_contend() {
        let map = AgentLockMap::new();
        let a = map.try_acquire(Uuid::new_v4());
        let b = map.try_acquire(Uuid::new_v4());
        assert!(a.is_some());
        assert!(b.is_some());
    }
}
