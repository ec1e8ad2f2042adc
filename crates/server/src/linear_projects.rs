//! Repo-root → Linear team mapping (`linear-projects.json`).
//!
//! Repo roots are normalized (no trailing slash) before use as keys.
//! An invalid file loads as empty.

use std::path::PathBuf;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::persist::{read_json_or_empty, write_json_atomic};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinearProjectMapping {
    pub repo_root: String,
    pub team_id: String,
    pub team_key: String,
    pub team_name: String,
    pub created_at: String,
    pub updated_at: String,
}

pub struct LinearProjectStore {
    path: PathBuf,
    mappings: Mutex<Vec<LinearProjectMapping>>,
}

fn normalize_root(root: &str) -> String {
    let trimmed = root.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

impl LinearProjectStore {
    pub fn load(path: PathBuf) -> Self {
        let mappings = read_json_or_empty::<Vec<LinearProjectMapping>>(&path).unwrap_or_default();
        Self {
            path,
            mappings: Mutex::new(mappings),
        }
    }

    pub fn get(&self, repo_root: &str) -> Option<LinearProjectMapping> {
        let key = normalize_root(repo_root);
        self.mappings
            .lock()
            .expect("linear lock poisoned")
            .iter()
            .find(|m| m.repo_root == key)
            .cloned()
    }

    pub fn list(&self) -> Vec<LinearProjectMapping> {
        self.mappings.lock().expect("linear lock poisoned").clone()
    }

    /// Insert or update the mapping for a repo root. `created_at` is
    /// preserved on update; `updated_at` always advances.
    pub fn upsert(&self, repo_root: &str, team_id: &str, team_key: &str, team_name: &str) {
        let key = normalize_root(repo_root);
        let now = companion_protocol::unix_now_z();
        let mut guard = self.mappings.lock().expect("linear lock poisoned");
        if let Some(existing) = guard.iter_mut().find(|m| m.repo_root == key) {
            existing.team_id = team_id.to_string();
            existing.team_key = team_key.to_string();
            existing.team_name = team_name.to_string();
            existing.updated_at = now;
        } else {
            guard.push(LinearProjectMapping {
                repo_root: key,
                team_id: team_id.to_string(),
                team_key: team_key.to_string(),
                team_name: team_name.to_string(),
                created_at: now.clone(),
                updated_at: now,
            });
        }
        let _ = write_json_atomic(&self.path, &*guard);
    }

    pub fn remove(&self, repo_root: &str) -> bool {
        let key = normalize_root(repo_root);
        let mut guard = self.mappings.lock().expect("linear lock poisoned");
        let before = guard.len();
        guard.retain(|m| m.repo_root != key);
        let removed = guard.len() != before;
        if removed {
            let _ = write_json_atomic(&self.path, &*guard);
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, LinearProjectStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = LinearProjectStore::load(dir.path().join("linear-projects.json"));
        (dir, store)
    }

    #[test]
    fn upsert_then_get_normalizes_trailing_slash() {
        let (_dir, store) = store();
        store.upsert("/home/u/proj/", "t1", "ENG", "Engineering");
        let mapping = store.get("/home/u/proj").unwrap();
        assert_eq!(mapping.team_id, "t1");
        assert_eq!(mapping.repo_root, "/home/u/proj");
        // Lookup with the trailing slash also hits
        assert!(store.get("/home/u/proj/").is_some());
    }

    #[test]
    fn update_preserves_created_at() {
        let (_dir, store) = store();
        store.upsert("/r", "t1", "ENG", "Engineering");
        let created = store.get("/r").unwrap().created_at;
        store.upsert("/r", "t2", "OPS", "Operations");
        let mapping = store.get("/r").unwrap();
        assert_eq!(mapping.created_at, created);
        assert_eq!(mapping.team_id, "t2");
        assert_eq!(store.list().len(), 1);
    }

    #[test]
    fn file_is_written_with_camel_case_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("linear-projects.json");
        let store = LinearProjectStore::load(path.clone());
        store.upsert("/r", "t1", "ENG", "Engineering");

        let raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        let entry = &raw.as_array().unwrap()[0];
        assert_eq!(entry["repoRoot"], "/r");
        assert_eq!(entry["teamId"], "t1");
        assert_eq!(entry["teamKey"], "ENG");
        assert!(entry["createdAt"].is_string());
        assert!(entry["updatedAt"].is_string());
    }

    #[test]
    fn invalid_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("linear-projects.json");
        std::fs::write(&path, b"not an array").unwrap();
        let store = LinearProjectStore::load(path);
        assert!(store.list().is_empty());
    }
}
