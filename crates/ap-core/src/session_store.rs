use std::path::PathBuf;

use chrono::{Duration, Utc};

use crate::state_store::{JsonFile, StoreError};
use crate::types::SessionRecord;

// ---------------------------------------------------------------------------
// SessionStore
// ---------------------------------------------------------------------------

/// File-system-backed session record persistence.
///
/// One JSON file per external task key under a configurable directory
/// (`<data_dir>/sessions/` by default). Each flush overwrites the whole
/// record.
#[derive(Debug, Clone)]
pub struct SessionStore {
    base_dir: PathBuf,
}

impl SessionStore {
    /// Create a store backed by `base_dir`, usually `Config::sessions_dir()`.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    fn ensure_dir(&self) -> Result<(), StoreError> {
        std::fs::create_dir_all(&self.base_dir)?;
        Ok(())
    }

    /// File for a given key. Bytes outside `[A-Za-z0-9-]` are written as
    /// `_XX` hex escapes, `_` included, so distinct keys never share a file
    /// and no key can escape the base directory.
    fn file_for(&self, issue_id: &str) -> JsonFile {
        JsonFile::new(self.base_dir.join(format!("{}.json", encode_key(issue_id))))
    }

    /// Persist a record, replacing any previous version.
    pub fn save(&self, record: &SessionRecord) -> Result<(), StoreError> {
        self.ensure_dir()?;
        self.file_for(&record.issue_id).save(record)
    }

    /// Load the record for a key. Returns `None` if not found, or if the file
    /// holds another key's record (a case-insensitive file system can map
    /// two keys onto one name).
    pub fn load(&self, issue_id: &str) -> Result<Option<SessionRecord>, StoreError> {
        let record: Option<SessionRecord> = self.file_for(issue_id).load()?;
        Ok(record.filter(|r| {
            let matches = r.issue_id == issue_id;
            if !matches {
                tracing::warn!(
                    issue_id,
                    stored = %r.issue_id,
                    "session record belongs to another key, ignoring"
                );
            }
            matches
        }))
    }

    /// List all saved records, most recently active first.
    pub fn list(&self) -> Result<Vec<SessionRecord>, StoreError> {
        let mut records: Vec<SessionRecord> =
            self.entries()?.into_iter().map(|(_, record)| record).collect();
        records.sort_by(|a, b| b.last_activity_at.cmp(&a.last_activity_at));
        Ok(records)
    }

    /// Delete records whose `last_activity_at` is older than `older_than`.
    /// Returns the number removed.
    pub fn cleanup_older_than(&self, older_than: Duration) -> Result<usize, StoreError> {
        let cutoff = Utc::now() - older_than;
        let mut removed = 0;
        for (file, record) in self.entries()? {
            if record.last_activity_at < cutoff && file.remove()? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Every readable record with the file it came from.
    fn entries(&self) -> Result<Vec<(JsonFile, SessionRecord)>, StoreError> {
        self.ensure_dir()?;
        let mut entries = Vec::new();
        for entry in std::fs::read_dir(&self.base_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let file = JsonFile::new(&path);
            match file.load::<SessionRecord>() {
                Ok(Some(record)) => entries.push((file, record)),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable session record");
                }
            }
        }
        Ok(entries)
    }
}

fn encode_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for b in key.bytes() {
        if b.is_ascii_alphanumeric() || b == b'-' {
            out.push(char::from(b));
        } else {
            out.push_str(&format!("_{b:02X}"));
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
