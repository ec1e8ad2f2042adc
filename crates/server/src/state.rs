//! Daemon state: every runtime handle, constructed once at startup and
//! passed down by reference. No module-level singletons.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use companion_protocol::{SessionDescriptor, SessionRecord};
use tokio::sync::oneshot;

use crate::bridge::{BridgeHandle, BridgeMsg};
use crate::container::ContainerRuntime;
use crate::image_pull::ImagePullCoordinator;
use crate::linear_projects::LinearProjectStore;
use crate::paths;
use crate::plugins::PluginBus;
use crate::settings::SettingsStore;
use crate::store::SessionStore;
use crate::worktrees::WorktreeRegistry;

pub struct Daemon {
    pub token: String,
    pub store: Arc<SessionStore>,
    pub settings: Arc<SettingsStore>,
    pub linear_projects: Arc<LinearProjectStore>,
    pub containers: Arc<ContainerRuntime>,
    pub images: Arc<ImagePullCoordinator>,
    pub worktrees: Arc<WorktreeRegistry>,
    pub plugins: Arc<PluginBus>,
    bridges: Mutex<HashMap<String, BridgeHandle>>,
}

impl Daemon {
    pub fn new(token: String, plugins: Arc<PluginBus>) -> Self {
        Self {
            token,
            store: Arc::new(SessionStore::load(paths::sessions_path())),
            settings: Arc::new(SettingsStore::load(paths::settings_path())),
            linear_projects: Arc::new(LinearProjectStore::load(paths::linear_projects_path())),
            containers: Arc::new(ContainerRuntime::new()),
            images: Arc::new(ImagePullCoordinator::new()),
            worktrees: Arc::new(WorktreeRegistry::new()),
            plugins,
            bridges: Mutex::new(HashMap::new()),
        }
    }

    pub fn add_bridge(&self, handle: BridgeHandle) {
        self.bridges
            .lock()
            .expect("bridge registry poisoned")
            .insert(handle.session_id.clone(), handle);
    }

    pub fn bridge(&self, session_id: &str) -> Option<BridgeHandle> {
        self.bridges
            .lock()
            .expect("bridge registry poisoned")
            .get(session_id)
            .cloned()
    }

    pub fn remove_bridge(&self, session_id: &str) -> Option<BridgeHandle> {
        self.bridges
            .lock()
            .expect("bridge registry poisoned")
            .remove(session_id)
    }

    pub fn bridge_ids(&self) -> Vec<String> {
        self.bridges
            .lock()
            .expect("bridge registry poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// Session descriptor joining the persisted record with live state.
    pub fn describe(&self, record: SessionRecord) -> SessionDescriptor {
        let live = self
            .bridge(&record.id)
            .map(|b| b.snapshot().live)
            .unwrap_or(false);
        SessionDescriptor { record, live }
    }

    /// Kill one session's bridge and wait for the cancellation order to run.
    pub async fn kill_session(&self, session_id: &str) -> bool {
        let Some(handle) = self.remove_bridge(session_id) else {
            return false;
        };
        let (tx, rx) = oneshot::channel();
        handle.send(BridgeMsg::Kill { reply: tx }).await;
        let _ = rx.await;
        true
    }

    /// Daemon shutdown: cancel every session, then remove every container.
    pub async fn shutdown(&self) {
        for id in self.bridge_ids() {
            self.kill_session(&id).await;
        }
        self.containers.cleanup_all().await;
        self.containers.persist(&paths::containers_path());
    }
}
