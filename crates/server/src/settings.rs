//! Flat user settings record (`settings.json`).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::persist::{read_json_or_empty, write_json_atomic};

/// A named session environment: container image, ports, mounts, init script.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnvProfile {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<u16>,
    /// `host:container` bind mounts
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub init_script: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anthropic_api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub openai_api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub linear_api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_container_image: Option<String>,
    /// Named environment profiles selectable at session creation
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub environments: HashMap<String, EnvProfile>,
    /// Unrecognized keys pass through untouched.
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

pub struct SettingsStore {
    path: PathBuf,
    settings: Mutex<Settings>,
}

impl SettingsStore {
    pub fn load(path: PathBuf) -> Self {
        let settings = read_json_or_empty::<Settings>(&path).unwrap_or_default();
        Self {
            path,
            settings: Mutex::new(settings),
        }
    }

    pub fn get(&self) -> Settings {
        self.settings.lock().expect("settings lock poisoned").clone()
    }

    pub fn update<F: FnOnce(&mut Settings)>(&self, mutate: F) {
        let mut guard = self.settings.lock().expect("settings lock poisoned");
        mutate(&mut guard);
        if let Err(e) = write_json_atomic(&self.path, &*guard) {
            warn!(
                component = "settings",
                event = "settings.flush_failed",
                error = %e,
                "Failed to persist settings"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_keys_survive_a_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            br#"{"anthropic_api_key": "sk-x", "future_field": {"a": 1}}"#,
        )
        .unwrap();

        let store = SettingsStore::load(path.clone());
        store.update(|s| s.openai_api_key = Some("sk-y".into()));

        let reloaded = SettingsStore::load(path);
        let settings = reloaded.get();
        assert_eq!(settings.anthropic_api_key.as_deref(), Some("sk-x"));
        assert_eq!(settings.openai_api_key.as_deref(), Some("sk-y"));
        assert_eq!(settings.extra["future_field"]["a"], 1);
    }

    #[test]
    fn corrupt_settings_fall_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, b"###").unwrap();
        let store = SettingsStore::load(path);
        assert!(store.get().anthropic_api_key.is_none());
    }
}
