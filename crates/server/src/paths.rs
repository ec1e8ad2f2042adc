//! Central path resolution for all Companion data files.
//!
//! Resolved once at startup from: CLI `--data-dir` > `COMPANION_DATA_DIR` env
//! > `~/.companion`. All callsites use these helpers instead of constructing
//! paths from `HOME`.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

static DATA_DIR: RwLock<Option<PathBuf>> = RwLock::new(None);

/// Initialize the global data directory. Returns the resolved path.
///
/// Priority: `explicit` arg > `COMPANION_DATA_DIR` env > `~/.companion`.
/// Panics if no valid path can be resolved.
pub fn init_data_dir(explicit: Option<&Path>) -> PathBuf {
    let dir = if let Some(p) = explicit {
        p.to_path_buf()
    } else if let Ok(env_val) = std::env::var("COMPANION_DATA_DIR") {
        PathBuf::from(env_val)
    } else {
        dirs::home_dir()
            .expect("HOME directory not found")
            .join(".companion")
    };

    let mut guard = DATA_DIR.write().expect("DATA_DIR lock poisoned");
    *guard = Some(dir.clone());
    dir
}

/// Return the current data directory. Panics if `init_data_dir` hasn't been called.
pub fn data_dir() -> PathBuf {
    DATA_DIR
        .read()
        .expect("DATA_DIR lock poisoned")
        .clone()
        .expect("data_dir() called before init_data_dir()")
}

pub fn log_dir() -> PathBuf {
    data_dir().join("logs")
}

pub fn auth_path() -> PathBuf {
    data_dir().join("auth.json")
}

pub fn settings_path() -> PathBuf {
    data_dir().join("settings.json")
}

pub fn sessions_path() -> PathBuf {
    data_dir().join("sessions.json")
}

pub fn containers_path() -> PathBuf {
    data_dir().join("containers.json")
}

pub fn linear_projects_path() -> PathBuf {
    data_dir().join("linear-projects.json")
}

pub fn plugins_path() -> PathBuf {
    data_dir().join("plugins.json")
}

/// Create all required subdirectories under the data dir.
pub fn ensure_dirs() -> io::Result<()> {
    let base = data_dir();
    std::fs::create_dir_all(&base)?;
    std::fs::create_dir_all(base.join("logs"))?;
    Ok(())
}
