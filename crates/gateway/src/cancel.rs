//! Per-run cancellation tokens, keyed by run id.
//!
//! Minus a cancel-group cascade: there is no child-turn delegation
//! concept here, so cancellation is always a single parent-less token
//! per run.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use uuid::Uuid;

#[derive(Clone)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self { cancelled: Arc::new(AtomicBool::new(false)) }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Default)]
pub struct CancelMap {
    tokens: Mutex<HashMap<Uuid, CancelToken>>,
}

impl CancelMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, run_id: Uuid) -> CancelToken {
        let token = CancelToken::new();
        self.tokens.lock().insert(run_id, token.clone());
        token
    }

    pub fn cancel(&self, run_id: Uuid) -> bool {
        if let Some(token) = self.tokens.lock().get(&run_id) {
            token.cancel();
            true
        } else {
            false
        }
    }

    pub fn remove(&self, run_id: Uuid) {
        self.tokens.lock().remove(&run_id);
    }

    pub fn is_running(&self, run_id: Uuid) -> bool {
        self.tokens.lock().contains_key(&run_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_cancel_remove_lifecycle() {
        let map = CancelMap::new();
        let run_id = Uuid::new_v4();
        let token = map.register(run_id);
        assert!(!token.is_cancelled());
        assert!(map.cancel(run_id));
        assert!(token.is_cancelled());
        map.remove(run_id);
        assert!(!map.is_running(run_id));
    }

    #[test]
    fn cancel_unknown_run_returns_false() {
        let map = CancelMap::new();
        assert!(!map.cancel(Uuid::new_v4()));
    }
}
