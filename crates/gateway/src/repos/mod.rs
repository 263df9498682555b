//! C1 repositories — one store per owned entity that isn't already covered
//! by `aoc_sessions::ThreadStore` (Thread/Message).
//!
//! Every store here follows one of two shapes:
//!
//! - low-volume, long-lived definitions (Agent, Trigger, Workflow, User,
//!   CanvasLayout) keep a full in-memory `HashMap` guarded by a
//!   `parking_lot::RwLock` and persist a JSON snapshot on every write.
//! - high-volume history (Run, WorkflowExecution, NodeExecutionState) uses
//!   the same in-memory map but durability is an append-only JSONL log
//!   replayed at startup. We keep full retention in memory rather than a
//!   bounded ring; that's recorded as a deliberate simplification in
//!   DESIGN.md.
//!
//! All mutating methods publish through the shared [`crate::bus::EventBus`]
//! instead of keeping a private broadcast channel per store.

pub mod agent;
pub mod canvas;
pub mod run;
pub mod trigger;
pub mod user;
pub mod workflow;

pub use agent::AgentRepo;
pub use canvas::CanvasRepo;
pub use run::RunRepo;
pub use trigger::TriggerRepo;
pub use user::UserRepo;
pub use workflow::{new_node_state, WorkflowExecutionRepo, WorkflowRepo};

use std::collections::HashMap;
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use serde::{de::DeserializeOwned, Serialize};
use uuid::Uuid;

use aoc_domain::error::{Error, Result};

/// Read a JSON snapshot file into a map, treating a missing file as empty.
pub(crate) fn load_snapshot<T: DeserializeOwned>(path: &Path) -> Result<HashMap<Uuid, T>> {
    match fs::read(path) {
        Ok(bytes) => serde_json::from_slice(&bytes).map_err(Error::Json),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
        Err(e) => Err(Error::Io(e)),
    }
}

/// Atomically overwrite a JSON snapshot file (write to a temp file, then
/// rename, so a crash mid-write never corrupts the previous snapshot).
pub(crate) fn save_snapshot<T: Serialize>(path: &Path, map: &HashMap<Uuid, T>) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(Error::Io)?;
    }
    let tmp_path = path.with_extension("json.tmp");
    let bytes = serde_json::to_vec_pretty(map).map_err(Error::Json)?;
    fs::write(&tmp_path, bytes).map_err(Error::Io)?;
    fs::rename(&tmp_path, path).map_err(Error::Io)?;
    Ok(())
}

/// Append one JSON-encoded record as a line to a log file, creating it
/// (and its parent directory) if needed.
pub(crate) fn append_jsonl<T: Serialize>(path: &Path, record: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(Error::Io)?;
    }
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(Error::Io)?;
    let line = serde_json::to_string(record).map_err(Error::Json)?;
    writeln!(file, "{line}").map_err(Error::Io)?;
    Ok(())
}

/// Replay a JSONL log into a map keyed by `key_of`, tolerating a missing
/// file. Later lines with the same key overwrite earlier ones, so this
/// also works for logs that record updates as new lines.
pub(crate) fn replay_jsonl<T: DeserializeOwned>(
    path: &Path,
    key_of: impl Fn(&T) -> Uuid,
) -> Result<HashMap<Uuid, T>> {
    let contents = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
        Err(e) => return Err(Error::Io(e)),
    };
    let mut map = HashMap::new();
    for line in contents.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let record: T = serde_json::from_str(line).map_err(Error::Json)?;
        map.insert(key_of(&record), record);
    }
    Ok(map)
}

/// Atomically rewrite a JSONL log with exactly the given records, used by
/// cascade deletes that need to drop lines rather than append one.
pub(crate) fn rewrite_jsonl<T: Serialize>(path: &Path, records: &[T]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(Error::Io)?;
    }
    let tmp_path = path.with_extension("jsonl.tmp");
    {
        let mut file = fs::File::create(&tmp_path).map_err(Error::Io)?;
        for record in records {
            let line = serde_json::to_string(record).map_err(Error::Json)?;
            writeln!(file, "{line}").map_err(Error::Io)?;
        }
    }
    fs::rename(&tmp_path, path).map_err(Error::Io)?;
    Ok(())
}

pub(crate) fn snapshot_path(data_dir: &Path, name: &str) -> PathBuf {
    data_dir.join(format!("{name}.json"))
}

pub(crate) fn jsonl_path(data_dir: &Path, name: &str) -> PathBuf {
    data_dir.join(format!("{name}.jsonl"))
}
