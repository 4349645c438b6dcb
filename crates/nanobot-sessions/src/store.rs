use std::path::{Path, PathBuf};

use dashmap::DashMap;
use serde_json::Value;
use tracing::{debug, warn};

use nanobot_core::paths::safe_filename;
use nanobot_core::types::ChatMessage;

use crate::error::Result;
use crate::types::{Session, SessionHeader};

/// Session persistence with an in-memory cache.
///
/// Saves rewrite the whole file through a temp-and-rename so the
/// one-header-per-file invariant holds across rotation and compaction.
pub struct SessionStore {
    dir: PathBuf,
    cache: DashMap<String, Session>,
}

impl SessionStore {
    pub fn new(dir: PathBuf) -> Self {
        let _ = std::fs::create_dir_all(&dir);
        Self {
            dir,
            cache: DashMap::new(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Return the cached session, load it from disk, or create a fresh one.
    pub fn get_or_create(&self, key: &str) -> Session {
        if let Some(session) = self.cache.get(key) {
            debug!(key, "session cache hit");
            return session.clone();
        }
        let session = match self.load(key) {
            Ok(Some(s)) => s,
            Ok(None) => Session::new(key),
            Err(e) => {
                warn!(key, error = %e, "session file unreadable, starting fresh");
                Session::new(key)
            }
        };
        self.cache.insert(key.to_string(), session.clone());
        session
    }

    /// Persist `session`, bumping `updated_at` and refreshing the cache.
    pub fn save(&self, session: &mut Session) -> Result<()> {
        session.updated_at = chrono::Utc::now().to_rfc3339();

        let mut lines = Vec::with_capacity(session.messages.len() + 1);
        lines.push(serde_json::to_value(SessionHeader::of(session))?);
        for msg in &session.messages {
            lines.push(serde_json::to_value(msg)?);
        }
        let body = lines
            .iter()
            .map(|v| serde_json::to_string(v).unwrap_or_default())
            .collect::<Vec<_>>()
            .join("\n")
            + "\n";

        let path = self.file_path(&session.key);
        let tmp = path.with_extension("jsonl.tmp");
        std::fs::write(&tmp, body)?;
        std::fs::rename(&tmp, &path)?;

        self.cache.insert(session.key.clone(), session.clone());
        Ok(())
    }

    /// Read a session file. Tolerates blank lines and a missing header.
    pub fn load(&self, key: &str) -> Result<Option<Session>> {
        let path = self.file_path(key);
        if !path.exists() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(&path)?;

        let mut session = Session::new(key);
        let mut messages: Vec<ChatMessage> = Vec::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let value: Value = match serde_json::from_str(line) {
                Ok(v) => v,
                Err(e) => {
                    warn!(key, error = %e, "skipping corrupt session line");
                    continue;
                }
            };
            if value.get("_type").and_then(Value::as_str) == Some("metadata") {
                if let Some(created) = value.get("created_at").and_then(Value::as_str) {
                    session.created_at = created.to_string();
                }
                if let Some(updated) = value.get("updated_at").and_then(Value::as_str) {
                    session.updated_at = updated.to_string();
                }
                if let Some(meta) = value.get("metadata").and_then(Value::as_object) {
                    session.metadata = meta.clone();
                }
                continue;
            }
            match serde_json::from_value::<ChatMessage>(value) {
                Ok(msg) => messages.push(msg),
                Err(e) => warn!(key, error = %e, "skipping unparseable message line"),
            }
        }
        session.messages = messages;
        Ok(Some(session))
    }

    /// Delete the session file and evict the cache entry.
    pub fn delete(&self, key: &str) -> bool {
        self.cache.remove(key);
        let path = self.file_path(key);
        if path.exists() {
            std::fs::remove_file(path).is_ok()
        } else {
            false
        }
    }

    /// All sessions as `(key, updated_at)`, newest first. Keys come from the
    /// metadata headers, falling back to the file stem.
    pub fn list(&self) -> Vec<(String, String)> {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            let mut key = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or_default()
                .to_string();
            let mut updated = String::new();
            if let Ok(text) = std::fs::read_to_string(&path) {
                if let Some(first) = text.lines().find(|l| !l.trim().is_empty()) {
                    if let Ok(header) = serde_json::from_str::<Value>(first) {
                        if header.get("_type").and_then(Value::as_str) == Some("metadata") {
                            if let Some(k) = header.get("key").and_then(Value::as_str) {
                                key = k.to_string();
                            }
                            if let Some(u) = header.get("updated_at").and_then(Value::as_str) {
                                updated = u.to_string();
                            }
                        }
                    }
                }
            }
            out.push((key, updated));
        }
        out.sort_by(|a, b| b.1.cmp(&a.1));
        out
    }

    pub fn file_path(&self, key: &str) -> PathBuf {
        let safe = safe_filename(&key.replace(':', "_"));
        self.dir.join(format!("{safe}.jsonl"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nanobot_core::types::Role;

    fn store() -> (tempfile::TempDir, SessionStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path().join("sessions"));
        (dir, store)
    }

    #[test]
    fn save_then_load_reconstructs_messages_and_header() {
        let (_dir, store) = store();
        let mut session = store.get_or_create("telegram:42");
        session.add_message(Role::User, "你好");
        session.add_message(Role::Assistant, "收到");
        store.save(&mut session).unwrap();

        // Fresh store, no cache: forces a disk read.
        let reloaded_store = SessionStore::new(store.dir().to_path_buf());
        let reloaded = reloaded_store.load("telegram:42").unwrap().unwrap();
        assert_eq!(reloaded.messages.len(), 2);
        assert_eq!(reloaded.messages[0].text(), Some("你好"));
        assert_eq!(reloaded.messages[1].text(), Some("收到"));
        assert_eq!(reloaded.created_at, session.created_at);
        assert!(reloaded.updated_at >= reloaded.created_at);
    }

    #[test]
    fn file_has_exactly_one_header_line() {
        let (_dir, store) = store();
        let mut session = store.get_or_create("cli:direct");
        session.add_message(Role::User, "one");
        store.save(&mut session).unwrap();
        session.add_message(Role::Assistant, "two");
        store.save(&mut session).unwrap();

        let text = std::fs::read_to_string(store.file_path("cli:direct")).unwrap();
        let headers = text
            .lines()
            .filter(|l| l.contains("\"_type\":\"metadata\""))
            .count();
        assert_eq!(headers, 1);
        assert_eq!(text.lines().count(), 3);
    }

    #[test]
    fn reader_tolerates_blank_and_corrupt_lines() {
        let (_dir, store) = store();
        let path = store.file_path("cli:messy");
        std::fs::write(
            &path,
            "\n{\"role\":\"user\",\"content\":\"kept\"}\nnot json at all\n\n",
        )
        .unwrap();
        let session = store.load("cli:messy").unwrap().unwrap();
        assert_eq!(session.messages.len(), 1);
        assert_eq!(session.messages[0].text(), Some("kept"));
    }

    #[test]
    fn delete_removes_file_and_cache() {
        let (_dir, store) = store();
        let mut session = store.get_or_create("cli:gone");
        session.add_message(Role::User, "x");
        store.save(&mut session).unwrap();
        assert!(store.delete("cli:gone"));
        assert!(store.load("cli:gone").unwrap().is_none());
        assert!(store.get_or_create("cli:gone").messages.is_empty());
    }

    #[test]
    fn list_orders_by_updated_at() {
        let (_dir, store) = store();
        let mut a = store.get_or_create("cli:a");
        store.save(&mut a).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let mut b = store.get_or_create("cli:b");
        store.save(&mut b).unwrap();

        let listed = store.list();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].0, "cli:b");
    }
}
