//! `ThreadStore`: the C1 repository for Threads and Messages.
//!
//! In-memory index (`parking_lot::RwLock<HashMap<Uuid, ThreadEntry>>`)
//! backed by one JSONL transcript file per thread plus a small metadata
//! JSON file, following this workspace's file-backed-store-with-index
//! idiom (no SQL engine). The critical section over the map never
//! crosses an `.await`; disk writes happen inside the guard since they
//! are just small local file appends.

use crate::transcript::TranscriptLog;
use aoc_domain::entities::{Agent, Message, Thread, ThreadType};
use aoc_domain::error::{Error, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

struct ThreadEntry {
    thread: Thread,
    messages: Vec<Message>,
}

pub struct ThreadStore {
    dir: PathBuf,
    threads: RwLock<HashMap<Uuid, ThreadEntry>>,
}

impl ThreadStore {
    /// Load every thread under `data_dir/threads` into memory.
    pub fn load(data_dir: &Path) -> Result<Self> {
        let dir = data_dir.join("threads");
        fs::create_dir_all(&dir)?;
        let mut threads = HashMap::new();

        if dir.exists() {
            for entry in fs::read_dir(&dir)? {
                let entry = entry?;
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                let raw = fs::read_to_string(&path)?;
                let thread: Thread = match serde_json::from_str(&raw) {
                    Ok(t) => t,
                    Err(e) => {
                        tracing::warn!(error = %e, path = %path.display(), "skipping unparseable thread metadata");
                        continue;
                    }
                };
                let messages = TranscriptLog::new(&dir, thread.id).load()?;
                threads.insert(thread.id, ThreadEntry { thread, messages });
            }
        }

        Ok(Self {
            dir,
            threads: RwLock::new(threads),
        })
    }

    fn meta_path(&self, thread_id: Uuid) -> PathBuf {
        self.dir.join(format!("{thread_id}.json"))
    }

    fn persist_meta(&self, thread: &Thread) -> Result<()> {
        let raw = serde_json::to_string_pretty(thread)?;
        fs::write(self.meta_path(thread.id), raw)?;
        Ok(())
    }

    /// Atomically create a thread and its captured system message.
    pub fn create_thread_with_system_message(
        &self,
        agent: &Agent,
        thread_type: ThreadType,
        title: impl Into<String>,
    ) -> Result<Thread> {
        let now = Utc::now();
        let thread = Thread {
            id: Uuid::new_v4(),
            agent_id: agent.id,
            title: title.into(),
            thread_type,
            agent_state: serde_json::Value::Object(Default::default()),
            created_at: now,
            updated_at: now,
        };
        let system_msg = Message::system(thread.id, &agent.system_instructions);

        self.persist_meta(&thread)?;
        let log = TranscriptLog::new(&self.dir, thread.id);
        log.append(&system_msg)?;

        let mut guard = self.threads.write();
        guard.insert(
            thread.id,
            ThreadEntry {
                thread: thread.clone(),
                messages: vec![system_msg],
            },
        );
        Ok(thread)
    }

    pub fn get_thread(&self, thread_id: Uuid) -> Result<Thread> {
        let guard = self.threads.read();
        guard
            .get(&thread_id)
            .map(|e| e.thread.clone())
            .ok_or_else(|| Error::NotFound(format!("thread {thread_id}")))
    }

    pub fn get_thread_for_agent(&self, thread_id: Uuid, agent_id: Uuid) -> Result<Thread> {
        let thread = self.get_thread(thread_id)?;
        if thread.agent_id != agent_id {
            return Err(Error::NotFound(format!("thread {thread_id}")));
        }
        Ok(thread)
    }

    pub fn update_thread(&self, thread: Thread) -> Result<Thread> {
        self.persist_meta(&thread)?;
        let mut guard = self.threads.write();
        let entry = guard
            .get_mut(&thread.id)
            .ok_or_else(|| Error::NotFound(format!("thread {}", thread.id)))?;
        entry.thread = thread.clone();
        Ok(thread)
    }

    /// Messages ordered by insertion (== id creation order), optionally
    /// filtered to those created after `since` and capped at `limit`.
    pub fn list_messages(
        &self,
        thread_id: Uuid,
        since: Option<DateTime<Utc>>,
        limit: Option<usize>,
    ) -> Result<Vec<Message>> {
        let guard = self.threads.read();
        let entry = guard
            .get(&thread_id)
            .ok_or_else(|| Error::NotFound(format!("thread {thread_id}")))?;
        let mut out: Vec<Message> = entry
            .messages
            .iter()
            .filter(|m| since.map(|s| m.created_at > s).unwrap_or(true))
            .cloned()
            .collect();
        if let Some(limit) = limit {
            out.truncate(limit);
        }
        Ok(out)
    }

    /// Bulk-append new messages to a thread; single flush, returns the
    /// inserted ids in order. Duplicate ids (already present) are
    /// skipped so a crash-and-retry of `run_thread` never double-inserts.
    pub fn append_messages(&self, thread_id: Uuid, msgs: Vec<Message>) -> Result<Vec<Uuid>> {
        let mut guard = self.threads.write();
        let entry = guard
            .get_mut(&thread_id)
            .ok_or_else(|| Error::NotFound(format!("thread {thread_id}")))?;

        let existing: std::collections::HashSet<Uuid> =
            entry.messages.iter().map(|m| m.id).collect();
        let log = TranscriptLog::new(&self.dir, thread_id);
        let mut inserted = Vec::with_capacity(msgs.len());
        for msg in msgs {
            if existing.contains(&msg.id) {
                continue;
            }
            log.append(&msg)?;
            inserted.push(msg.id);
            entry.messages.push(msg);
        }
        entry.thread.updated_at = Utc::now();
        Ok(inserted)
    }

    /// Flip `processed=true` for the given message ids (bulk, idempotent).
    pub fn mark_messages_processed(&self, thread_id: Uuid, ids: &[Uuid]) -> Result<()> {
        let mut guard = self.threads.write();
        let entry = guard
            .get_mut(&thread_id)
            .ok_or_else(|| Error::NotFound(format!("thread {thread_id}")))?;
        let id_set: std::collections::HashSet<Uuid> = ids.iter().copied().collect();
        let mut changed = false;
        for m in entry.messages.iter_mut() {
            if id_set.contains(&m.id) && !m.processed {
                m.processed = true;
                changed = true;
            }
        }
        if changed {
            let log = TranscriptLog::new(&self.dir, thread_id);
            log.rewrite(&entry.messages)?;
        }
        Ok(())
    }

    /// First assistant message appended after `since`, used by the Task
    /// Runner to compute a Run's summary (first *non-empty* content).
    pub fn first_assistant_message_after(
        &self,
        thread_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Option<Message>> {
        let guard = self.threads.read();
        let entry = guard
            .get(&thread_id)
            .ok_or_else(|| Error::NotFound(format!("thread {thread_id}")))?;
        Ok(entry
            .messages
            .iter()
            .find(|m| {
                m.created_at >= since
                    && m.role == aoc_domain::entities::MessageRole::Assistant
                    && !m.content.trim().is_empty()
            })
            .cloned())
    }

    pub fn thread_count(&self) -> usize {
        self.threads.read().len()
    }

    /// Cascade delete: every thread belonging to `agent_id`, along with
    /// its metadata file and message transcript — "deleting A cascades
    /// B" for Agent → Thread.
    pub fn delete_threads_for_agent(&self, agent_id: Uuid) -> Result<()> {
        let removed: Vec<Uuid> = {
            let mut guard = self.threads.write();
            let ids: Vec<Uuid> = guard
                .values()
                .filter(|e| e.thread.agent_id == agent_id)
                .map(|e| e.thread.id)
                .collect();
            for id in &ids {
                guard.remove(id);
            }
            ids
        };
        for id in removed {
            let meta = self.meta_path(id);
            if meta.exists() {
                fs::remove_file(&meta)?;
            }
            let transcript = self.dir.join(format!("{id}.messages.jsonl"));
            if transcript.exists() {
                fs::remove_file(&transcript)?;
            }
        }
        Ok(())
    }
}
