//! Image pull deduplication and progress fan-out.
//!
//! At most one pull runs per image; every subscriber observes the same line
//! stream in order, and late subscribers only see lines produced after they
//! subscribed. `Ready` is a terminal state - once reached, further
//! `ensure_image` calls are no-ops.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PullStatus {
    Idle,
    Pulling,
    Ready,
    Error(String),
}

struct ImageEntry {
    status: PullStatus,
    subscribers: HashMap<u64, mpsc::Sender<String>>,
    next_subscriber_id: u64,
}

impl ImageEntry {
    fn new() -> Self {
        Self {
            status: PullStatus::Idle,
            subscribers: HashMap::new(),
            next_subscriber_id: 1,
        }
    }
}

pub struct ImagePullCoordinator {
    docker_bin: String,
    images: Mutex<HashMap<String, ImageEntry>>,
    changed: Arc<Notify>,
}

impl ImagePullCoordinator {
    pub fn new() -> Self {
        Self {
            docker_bin: std::env::var("COMPANION_DOCKER_BIN")
                .unwrap_or_else(|_| "docker".to_string()),
            images: Mutex::new(HashMap::new()),
            changed: Arc::new(Notify::new()),
        }
    }

    pub fn state(&self, image: &str) -> PullStatus {
        self.images
            .lock()
            .expect("image lock poisoned")
            .get(image)
            .map(|e| e.status.clone())
            .unwrap_or(PullStatus::Idle)
    }

    pub fn is_ready(&self, image: &str) -> bool {
        self.state(image) == PullStatus::Ready
    }

    /// Start a pull if the image is idle or previously errored; no-op while
    /// pulling or once ready.
    pub fn ensure_image(self: &Arc<Self>, image: &str) {
        {
            let mut guard = self.images.lock().expect("image lock poisoned");
            let entry = guard
                .entry(image.to_string())
                .or_insert_with(ImageEntry::new);
            match entry.status {
                PullStatus::Pulling | PullStatus::Ready => return,
                PullStatus::Idle | PullStatus::Error(_) => {
                    entry.status = PullStatus::Pulling;
                }
            }
        }
        self.changed.notify_waiters();

        let this = self.clone();
        let image = image.to_string();
        tokio::spawn(async move {
            this.run_pull(&image).await;
        });
    }

    async fn run_pull(&self, image: &str) {
        info!(
            component = "image_pull",
            event = "image_pull.started",
            image = %image,
            "Pulling container image"
        );

        let result = self.spawn_pull(image).await;

        {
            let mut guard = self.images.lock().expect("image lock poisoned");
            if let Some(entry) = guard.get_mut(image) {
                entry.status = match &result {
                    Ok(()) => PullStatus::Ready,
                    Err(msg) => PullStatus::Error(msg.clone()),
                };
                // Pull finished one way or the other; subscribers re-attach
                // on the next attempt.
                entry.subscribers.clear();
            }
        }
        self.changed.notify_waiters();

        match result {
            Ok(()) => info!(
                component = "image_pull",
                event = "image_pull.ready",
                image = %image,
                "Image ready"
            ),
            Err(e) => warn!(
                component = "image_pull",
                event = "image_pull.failed",
                image = %image,
                error = %e,
                "Image pull failed"
            ),
        }
    }

    async fn spawn_pull(&self, image: &str) -> Result<(), String> {
        let mut child = Command::new(&self.docker_bin)
            .args(["pull", image])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| format!("docker not runnable: {e}"))?;

        let mut tail = String::new();
        if let Some(stdout) = child.stdout.take() {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tail = line.clone();
                self.broadcast_line(image, line);
            }
        }
        if let Some(stderr) = child.stderr.take() {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tail = line.clone();
                self.broadcast_line(image, line);
            }
        }

        let status = child.wait().await.map_err(|e| format!("wait: {e}"))?;
        if status.success() {
            Ok(())
        } else if tail.is_empty() {
            Err(format!("docker pull exited with {status}"))
        } else {
            Err(tail)
        }
    }

    fn broadcast_line(&self, image: &str, line: String) {
        let guard = self.images.lock().expect("image lock poisoned");
        if let Some(entry) = guard.get(image) {
            for tx in entry.subscribers.values() {
                // Bounded channels: a stalled subscriber drops lines rather
                // than stalling the pull.
                let _ = tx.try_send(line.clone());
            }
        }
    }

    /// Subscribe to progress lines for an image. Returns a subscriber id for
    /// [`Self::unsubscribe`].
    pub fn on_progress(&self, image: &str, tx: mpsc::Sender<String>) -> u64 {
        let mut guard = self.images.lock().expect("image lock poisoned");
        let entry = guard
            .entry(image.to_string())
            .or_insert_with(ImageEntry::new);
        let id = entry.next_subscriber_id;
        entry.next_subscriber_id += 1;
        entry.subscribers.insert(id, tx);
        id
    }

    pub fn unsubscribe(&self, image: &str, subscriber_id: u64) {
        let mut guard = self.images.lock().expect("image lock poisoned");
        if let Some(entry) = guard.get_mut(image) {
            entry.subscribers.remove(&subscriber_id);
        }
    }

    /// Wait for the image to become ready, up to `deadline`. Returns false
    /// on timeout or pull error.
    pub async fn wait_for_ready(&self, image: &str, deadline: Duration) -> bool {
        let until = Instant::now() + deadline;
        loop {
            // Register before checking so a transition between the check and
            // the wait is not lost.
            let changed = self.changed.notified();
            match self.state(image) {
                PullStatus::Ready => return true,
                PullStatus::Error(_) => return false,
                PullStatus::Idle | PullStatus::Pulling => {}
            }
            let remaining = until.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            let _ = tokio::time::timeout(remaining, changed).await;
        }
    }
}

impl Default for ImagePullCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coordinator() -> Arc<ImagePullCoordinator> {
        Arc::new(ImagePullCoordinator::new())
    }

    fn set_status(c: &ImagePullCoordinator, image: &str, status: PullStatus) {
        let mut guard = c.images.lock().unwrap();
        guard
            .entry(image.to_string())
            .or_insert_with(ImageEntry::new)
            .status = status;
    }

    #[tokio::test]
    async fn ensure_image_is_noop_once_ready() {
        let c = coordinator();
        set_status(&c, "img:1", PullStatus::Ready);
        c.ensure_image("img:1");
        assert_eq!(c.state("img:1"), PullStatus::Ready);
    }

    #[tokio::test]
    async fn ensure_image_is_noop_while_pulling() {
        let c = coordinator();
        set_status(&c, "img:1", PullStatus::Pulling);
        c.ensure_image("img:1");
        assert_eq!(c.state("img:1"), PullStatus::Pulling);
    }

    #[tokio::test]
    async fn wait_for_ready_returns_false_on_error() {
        let c = coordinator();
        set_status(&c, "img:1", PullStatus::Error("no such image".into()));
        assert!(!c.wait_for_ready("img:1", Duration::from_millis(50)).await);
    }

    #[tokio::test]
    async fn wait_for_ready_observes_transition() {
        let c = coordinator();
        set_status(&c, "img:1", PullStatus::Pulling);
        let waiter = c.clone();
        let handle =
            tokio::spawn(async move { waiter.wait_for_ready("img:1", Duration::from_secs(5)).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        set_status(&c, "img:1", PullStatus::Ready);
        c.changed.notify_waiters();
        assert!(handle.await.unwrap());
    }

    #[tokio::test]
    async fn late_subscriber_sees_only_later_lines() {
        let c = coordinator();
        set_status(&c, "img:1", PullStatus::Pulling);
        c.broadcast_line("img:1", "early".into());

        let (tx, mut rx) = mpsc::channel(16);
        let id = c.on_progress("img:1", tx);
        c.broadcast_line("img:1", "late".into());

        assert_eq!(rx.recv().await.unwrap(), "late");
        c.unsubscribe("img:1", id);
        c.broadcast_line("img:1", "after-unsub".into());
        assert!(rx.try_recv().is_err());
    }
}
