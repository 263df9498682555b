//! Append-only JSONL persistence for a single thread's messages.
//!
//! Messages are immutable once written (the only mutation the data model
//! allows is flipping `processed`, which is rewritten as a full-file
//! rewrite since volumes per thread are small). Thread metadata is kept
//! in a sibling `.meta.json` file.

use aoc_domain::entities::Message;
use aoc_domain::error::{Error, Result};
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;

pub struct TranscriptLog {
    path: PathBuf,
}

impl TranscriptLog {
    pub fn new(dir: &Path, thread_id: Uuid) -> Self {
        Self {
            path: dir.join(format!("{thread_id}.messages.jsonl")),
        }
    }

    pub fn append(&self, msg: &Message) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut f = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let line = serde_json::to_string(msg)?;
        writeln!(f, "{line}")?;
        Ok(())
    }

    pub fn load(&self) -> Result<Vec<Message>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let f = fs::File::open(&self.path)?;
        let reader = BufReader::new(f);
        let mut out = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Message>(&line) {
                Ok(m) => out.push(m),
                Err(e) => {
                    tracing::warn!(error = %e, thread_path = %self.path.display(), "skipping unparseable transcript line");
                }
            }
        }
        Ok(out)
    }

    /// Rewrite the full file, used when a message's `processed` flag flips.
    pub fn rewrite(&self, messages: &[Message]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp_path = self.path.with_extension("jsonl.tmp");
        {
            let mut f = fs::File::create(&tmp_path)?;
            for m in messages {
                let line = serde_json::to_string(m)?;
                writeln!(f, "{line}")?;
            }
        }
        fs::rename(&tmp_path, &self.path).map_err(|e| Error::Storage(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aoc_domain::entities::Message;

    #[test]
    fn append_then_load_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let thread_id = Uuid::new_v4();
        let log = TranscriptLog::new(dir.path(), thread_id);
        let m1 = Message::system(thread_id, "you are a bot");
        let m2 = Message::user(thread_id, "hello");
        log.append(&m1).unwrap();
        log.append(&m2).unwrap();

        let loaded = log.load().unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].id, m1.id);
        assert_eq!(loaded[1].id, m2.id);
    }

    #[test]
    fn load_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let log = TranscriptLog::new(dir.path(), Uuid::new_v4());
        assert!(log.load().unwrap().is_empty());
    }

    #[test]
    fn rewrite_replaces_contents() {
        let dir = tempfile::tempdir().unwrap();
        let thread_id = Uuid::new_v4();
        let log = TranscriptLog::new(dir.path(), thread_id);
        let m1 = Message::user(thread_id, "one");
        log.append(&m1).unwrap();

        let mut m1_processed = m1.clone();
        m1_processed.processed = true;
        log.rewrite(&[m1_processed.clone()]).unwrap();

        let loaded = log.load().unwrap();
        assert_eq!(loaded.len(), 1);
        assert!(loaded[0].processed);
    }

    #[test]
    fn skips_unparseable_lines_without_failing() {
        let dir = tempfile::tempdir().unwrap();
        let thread_id = Uuid::new_v4();
        let log = TranscriptLog::new(dir.path(), thread_id);
        let m1 = Message::user(thread_id, "ok");
        log.append(&m1).unwrap();
        {
            let mut f = fs::OpenOptions::new()
                .append(true)
                .open(dir.path().join(format!("{thread_id}.messages.jsonl")))
                .unwrap();
            writeln!(f, "not json").unwrap();
        }
        let loaded = log.load().unwrap();
        assert_eq!(loaded.len(), 1);
    }
}
