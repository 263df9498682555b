use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde_json::Value;
use uuid::Uuid;

use aoc_domain::entities::CanvasLayout;
use aoc_domain::error::Result;

use super::{load_snapshot, save_snapshot, snapshot_path};

/// Canvas layouts are keyed by `(user_id, workspace)` rather than by a
/// standalone lookup id, so callers always get-or-create rather than
/// separately create-then-get.
pub struct CanvasRepo {
    path: PathBuf,
    layouts: RwLock<HashMap<Uuid, CanvasLayout>>,
}

impl CanvasRepo {
    pub fn load(data_dir: &Path) -> Result<Self> {
        let path = snapshot_path(data_dir, "canvas_layouts");
        let layouts = load_snapshot(&path)?;
        Ok(Self { path, layouts: RwLock::new(layouts) })
    }

    fn persist(&self) -> Result<()> {
        save_snapshot(&self.path, &self.layouts.read())
    }

    pub fn get_or_create(&self, user_id: Uuid, workspace: &str) -> CanvasLayout {
        {
            let guard = self.layouts.read();
            if let Some(existing) = guard
                .values()
                .find(|l| l.user_id == user_id && l.workspace == workspace)
            {
                return existing.clone();
            }
        }
        let layout = CanvasLayout {
            id: Uuid::new_v4(),
            user_id,
            workspace: workspace.to_string(),
            positions: Value::Object(Default::default()),
            viewport: Value::Object(Default::default()),
        };
        self.layouts.write().insert(layout.id, layout.clone());
        let _ = self.persist();
        layout
    }

    pub fn save(&self, user_id: Uuid, workspace: &str, positions: Value, viewport: Value) -> Result<CanvasLayout> {
        let layout_id = self.get_or_create(user_id, workspace).id;
        let updated = {
            let mut guard = self.layouts.write();
            let layout = guard.get_mut(&layout_id).expect("just created above");
            layout.positions = positions;
            layout.viewport = viewport;
            layout.clone()
        };
        self.persist()?;
        Ok(updated)
    }
}
