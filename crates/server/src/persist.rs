//! Atomic JSON state-file writes.
//!
//! Every persisted file under the data dir is written through
//! [`write_json_atomic`]: serialize to a temp sibling, fsync, rename.
//! Readers treat corrupt or missing files as empty.

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

/// Write `value` to `path` via temp-sibling + fsync + rename.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> std::io::Result<()> {
    let json = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    {
        let mut file = File::create(&tmp)?;
        file.write_all(&json)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)
}

/// Read a JSON state file. Missing or corrupt files yield `None` (with one
/// warning for the corrupt case).
pub fn read_json_or_empty<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let bytes = fs::read(path).ok()?;
    match serde_json::from_slice(&bytes) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(
                component = "persist",
                event = "persist.corrupt_state_file",
                path = %path.display(),
                error = %e,
                "State file is corrupt, treating as empty"
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let mut map = HashMap::new();
        map.insert("a".to_string(), 1u32);
        write_json_atomic(&path, &map).unwrap();
        let back: HashMap<String, u32> = read_json_or_empty(&path).unwrap();
        assert_eq!(back, map);
    }

    #[test]
    fn corrupt_file_reads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, b"{not json").unwrap();
        let back: Option<HashMap<String, u32>> = read_json_or_empty(&path);
        assert!(back.is_none());
    }

    #[test]
    fn missing_file_reads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let back: Option<Vec<String>> = read_json_or_empty(&dir.path().join("nope.json"));
        assert!(back.is_none());
    }

    #[test]
    fn no_tmp_sibling_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        write_json_atomic(&path, &vec![1, 2, 3]).unwrap();
        assert!(!path.with_extension("json.tmp").exists());
    }
}
