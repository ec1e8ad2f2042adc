//! Persisted index of session metadata.
//!
//! The in-memory index is guarded by a mutex and persisted atomically on
//! every mutation. Message bodies are never stored here - only metadata.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use companion_protocol::SessionRecord;
use tracing::{info, warn};

use crate::persist::{read_json_or_empty, write_json_atomic};

pub struct SessionStore {
    path: PathBuf,
    records: Mutex<HashMap<String, SessionRecord>>,
}

impl SessionStore {
    /// Load the store from disk; a missing or corrupt file starts empty.
    pub fn load(path: PathBuf) -> Self {
        let records: HashMap<String, SessionRecord> = read_json_or_empty::<Vec<SessionRecord>>(&path)
            .map(|list| list.into_iter().map(|r| (r.id.clone(), r)).collect())
            .unwrap_or_default();
        if !records.is_empty() {
            info!(
                component = "session_store",
                event = "store.loaded",
                sessions = records.len(),
                "Restored session index"
            );
        }
        Self {
            path,
            records: Mutex::new(records),
        }
    }

    pub fn get(&self, id: &str) -> Option<SessionRecord> {
        self.records.lock().expect("store lock poisoned").get(id).cloned()
    }

    pub fn list(&self) -> Vec<SessionRecord> {
        let mut records: Vec<SessionRecord> = self
            .records
            .lock()
            .expect("store lock poisoned")
            .values()
            .cloned()
            .collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        records
    }

    pub fn insert(&self, record: SessionRecord) {
        let mut guard = self.records.lock().expect("store lock poisoned");
        guard.insert(record.id.clone(), record);
        self.flush(&guard);
    }

    /// Apply a mutation to one record; no-op if the id is unknown.
    pub fn update<F: FnOnce(&mut SessionRecord)>(&self, id: &str, mutate: F) -> bool {
        let mut guard = self.records.lock().expect("store lock poisoned");
        let Some(record) = guard.get_mut(id) else {
            return false;
        };
        mutate(record);
        self.flush(&guard);
        true
    }

    pub fn set_archived(&self, id: &str, archived: bool) -> bool {
        self.update(id, |r| r.archived = archived)
    }

    pub fn remove(&self, id: &str) -> Option<SessionRecord> {
        let mut guard = self.records.lock().expect("store lock poisoned");
        let removed = guard.remove(id);
        if removed.is_some() {
            self.flush(&guard);
        }
        removed
    }

    fn flush(&self, records: &HashMap<String, SessionRecord>) {
        let mut list: Vec<&SessionRecord> = records.values().collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        if let Err(e) = write_json_atomic(&self.path, &list) {
            warn!(
                component = "session_store",
                event = "store.flush_failed",
                path = %self.path.display(),
                error = %e,
                "Failed to persist session index"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use companion_protocol::BackendKind;

    fn record(id: &str) -> SessionRecord {
        SessionRecord::new(id.to_string(), BackendKind::Claude, "/tmp/p".to_string())
    }

    #[test]
    fn insert_persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.json");

        let store = SessionStore::load(path.clone());
        store.insert(record("s1"));
        store.insert(record("s2"));
        store.set_archived("s2", true);

        let reloaded = SessionStore::load(path);
        assert_eq!(reloaded.list().len(), 2);
        assert!(reloaded.get("s2").unwrap().archived);
        assert!(!reloaded.get("s1").unwrap().archived);
    }

    #[test]
    fn update_unknown_id_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::load(dir.path().join("sessions.json"));
        assert!(!store.update("ghost", |r| r.archived = true));
    }

    #[test]
    fn remove_deletes_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.json");
        let store = SessionStore::load(path.clone());
        store.insert(record("s1"));
        assert!(store.remove("s1").is_some());
        assert!(store.remove("s1").is_none());

        let reloaded = SessionStore::load(path);
        assert!(reloaded.list().is_empty());
    }

    #[test]
    fn corrupt_index_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.json");
        std::fs::write(&path, b"[{broken").unwrap();
        let store = SessionStore::load(path);
        assert!(store.list().is_empty());
    }
}
