//! Session → worktree mapping registry.
//!
//! A worktree is "in use" while at least one non-archived session references
//! it. Removal is forbidden while in use and refused without `force` when
//! the tree is dirty. `actual_branch` may differ from the requested branch
//! when the daemon had to synthesize a derived branch; only synthesized
//! branches are ever deleted on cleanup.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use companion_protocol::WorktreeInfo;
use tracing::info;

use crate::errors::RuntimeError;
use crate::git::{self, RemoveWorktreeOpts};

#[derive(Default)]
pub struct WorktreeRegistry {
    by_session: Mutex<HashMap<String, WorktreeInfo>>,
}

impl WorktreeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, session_id: &str, info: WorktreeInfo) {
        self.by_session
            .lock()
            .expect("worktree lock poisoned")
            .insert(session_id.to_string(), info);
    }

    pub fn get(&self, session_id: &str) -> Option<WorktreeInfo> {
        self.by_session
            .lock()
            .expect("worktree lock poisoned")
            .get(session_id)
            .cloned()
    }

    /// Sessions (other than `except_session`) sharing the same worktree path.
    pub fn other_users(&self, worktree_path: &str, except_session: &str) -> Vec<String> {
        self.by_session
            .lock()
            .expect("worktree lock poisoned")
            .iter()
            .filter(|(id, info)| {
                id.as_str() != except_session && info.worktree_path == worktree_path
            })
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Remove the worktree bound to a session.
    ///
    /// Returns `Ok(false)` when the tree was left in place (shared with a
    /// live session, or dirty without `force`).
    pub async fn remove_by_session(
        &self,
        session_id: &str,
        force: bool,
    ) -> Result<bool, RuntimeError> {
        let info = {
            let guard = self.by_session.lock().expect("worktree lock poisoned");
            guard.get(session_id).cloned()
        };
        let Some(info) = info else {
            return Ok(false);
        };

        if !self.other_users(&info.worktree_path, session_id).is_empty() {
            return Err(RuntimeError::PreconditionFailed(format!(
                "worktree {} is in use by another session",
                info.worktree_path
            )));
        }

        // Delete only branches the daemon synthesized itself.
        let branch_to_delete = if info.actual_branch != info.branch {
            Some(info.actual_branch.clone())
        } else {
            None
        };

        let result = git::remove_worktree(
            Path::new(&info.repo_root),
            Path::new(&info.worktree_path),
            &RemoveWorktreeOpts {
                force,
                branch_to_delete,
            },
        )
        .await?;

        if result.removed {
            self.by_session
                .lock()
                .expect("worktree lock poisoned")
                .remove(session_id);
            info!(
                component = "worktrees",
                event = "worktree.removed",
                session_id = %session_id,
                path = %info.worktree_path,
                "Removed session worktree"
            );
        }
        Ok(result.removed)
    }

    /// Drop the mapping without touching the filesystem (session deleted
    /// while its worktree stays behind).
    pub fn forget(&self, session_id: &str) -> Option<WorktreeInfo> {
        self.by_session
            .lock()
            .expect("worktree lock poisoned")
            .remove(session_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(path: &str, branch: &str, actual: &str) -> WorktreeInfo {
        WorktreeInfo {
            repo_root: "/repo".into(),
            branch: branch.into(),
            actual_branch: actual.into(),
            worktree_path: path.into(),
            created_at: companion_protocol::unix_now_z(),
        }
    }

    #[test]
    fn mapping_is_stable_across_reads() {
        let reg = WorktreeRegistry::new();
        reg.record("s1", info("/wt/a", "feat/x", "feat/x-wt01"));
        let first = reg.get("s1").unwrap();
        let second = reg.get("s1").unwrap();
        assert_eq!(first.actual_branch, second.actual_branch);
        assert_eq!(first.actual_branch, "feat/x-wt01");
    }

    #[test]
    fn other_users_detects_sharing() {
        let reg = WorktreeRegistry::new();
        reg.record("s1", info("/wt/a", "main", "main"));
        reg.record("s2", info("/wt/a", "main", "main"));
        reg.record("s3", info("/wt/b", "dev", "dev"));
        assert_eq!(reg.other_users("/wt/a", "s1"), vec!["s2".to_string()]);
        assert!(reg.other_users("/wt/b", "s3").is_empty());
    }

    #[test]
    fn forget_removes_only_the_mapping() {
        let reg = WorktreeRegistry::new();
        reg.record("s1", info("/wt/a", "main", "main"));
        assert!(reg.forget("s1").is_some());
        assert!(reg.get("s1").is_none());
        assert!(reg.forget("s1").is_none());
    }
}
