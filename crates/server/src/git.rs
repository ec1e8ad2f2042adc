//! Git operations for session working directories.
//!
//! Everything shells out to `git` in argv form; no shell strings are ever
//! built from request input. Network operations (fetch/pull) are non-fatal
//! by contract - callers get `{success, output}` and decide what to log.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::errors::RuntimeError;

#[derive(Debug, Clone)]
pub struct RepoInfo {
    pub repo_root: String,
    pub default_branch: String,
    pub current_branch: String,
}

#[derive(Debug, Clone)]
pub struct WorktreeCreated {
    pub worktree_path: String,
    pub actual_branch: String,
}

#[derive(Debug, Clone)]
pub struct NetResult {
    pub success: bool,
    pub output: String,
}

#[derive(Debug, Clone, Default)]
pub struct EnsureWorktreeOpts {
    pub base_branch: Option<String>,
    pub create_branch: bool,
    pub force_new: bool,
}

#[derive(Debug, Clone, Default)]
pub struct RemoveWorktreeOpts {
    pub force: bool,
    pub branch_to_delete: Option<String>,
}

/// Branch names are restricted to `[A-Za-z0-9/_.-]+`.
pub fn is_valid_branch_name(branch: &str) -> bool {
    !branch.is_empty()
        && branch
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '_' | '.' | '-'))
}

fn validate_branch(branch: &str) -> Result<(), RuntimeError> {
    if is_valid_branch_name(branch) {
        Ok(())
    } else {
        Err(RuntimeError::InvalidInput(format!(
            "branch name {branch:?} contains disallowed characters"
        )))
    }
}

async fn run_git(args: &[&str], cwd: &Path) -> Result<String, String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| format!("failed to run git: {e}"))?;

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if output.status.success() {
        Ok(stdout)
    } else if stderr.is_empty() {
        Err(stdout)
    } else {
        Err(stderr)
    }
}

/// Resolve repo root, default branch, and current branch for a path.
/// Returns `None` when the path isn't inside a git repository.
pub async fn repo_info(path: &Path) -> Option<RepoInfo> {
    let repo_root = run_git(&["rev-parse", "--show-toplevel"], path).await.ok()?;
    let current_branch = run_git(&["rev-parse", "--abbrev-ref", "HEAD"], path)
        .await
        .ok()?;

    // origin/HEAD gives the default branch when a remote exists; fall back
    // to the current branch for local-only repos.
    let default_branch = match run_git(
        &["symbolic-ref", "refs/remotes/origin/HEAD", "--short"],
        path,
    )
    .await
    {
        Ok(full) => full
            .strip_prefix("origin/")
            .unwrap_or(full.as_str())
            .to_string(),
        Err(_) => current_branch.clone(),
    };

    Some(RepoInfo {
        repo_root,
        default_branch,
        current_branch,
    })
}

/// Directory a worktree for `branch` lives in, under `<repo>-worktrees/`.
fn worktree_path_for(repo_root: &Path, branch: &str, unique_suffix: Option<&str>) -> PathBuf {
    let repo_name = repo_root
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("repo");
    let safe_branch = branch.replace('/', "-");
    let dir_name = match unique_suffix {
        Some(suffix) => format!("{safe_branch}-{suffix}"),
        None => safe_branch,
    };
    repo_root
        .parent()
        .unwrap_or(repo_root)
        .join(format!("{repo_name}-worktrees"))
        .join(dir_name)
}

/// Create (or reuse) a worktree pinned to `branch`.
///
/// With `create_branch`, the branch is created off `base_branch` (or HEAD).
/// When the requested branch is already checked out elsewhere, a derived
/// branch `<branch>-wt<N>` is created instead; `actual_branch` records what
/// the worktree is actually pinned to.
pub async fn ensure_worktree(
    repo_root: &Path,
    branch: &str,
    opts: &EnsureWorktreeOpts,
) -> Result<WorktreeCreated, RuntimeError> {
    validate_branch(branch)?;
    if let Some(base) = &opts.base_branch {
        validate_branch(base)?;
    }

    let suffix = if opts.force_new {
        Some(short_unique_suffix())
    } else {
        None
    };
    let path = worktree_path_for(repo_root, branch, suffix.as_deref());

    if !opts.force_new && path.is_dir() {
        // Existing worktree for this branch - reuse it.
        debug!(
            component = "git",
            event = "git.worktree.reused",
            path = %path.display(),
            branch = %branch,
            "Reusing existing worktree"
        );
        return Ok(WorktreeCreated {
            worktree_path: path.to_string_lossy().to_string(),
            actual_branch: branch.to_string(),
        });
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| RuntimeError::Fatal(format!("create worktree parent dir: {e}")))?;
    }
    let path_str = path.to_string_lossy().to_string();

    let mut actual_branch = branch.to_string();
    let result = if opts.create_branch {
        let base = opts.base_branch.as_deref().unwrap_or("HEAD");
        run_git(
            &["worktree", "add", "-b", branch, &path_str, base],
            repo_root,
        )
        .await
    } else {
        run_git(&["worktree", "add", &path_str, branch], repo_root).await
    };

    if let Err(first_err) = result {
        // Branch checked out elsewhere or already exists - pin the worktree
        // to a derived branch instead.
        let derived = format!("{branch}-wt{}", short_unique_suffix());
        info!(
            component = "git",
            event = "git.worktree.derived_branch",
            requested = %branch,
            derived = %derived,
            error = %first_err,
            "Requested branch unavailable, creating derived branch"
        );
        let base = opts.base_branch.as_deref().unwrap_or(branch);
        run_git(
            &["worktree", "add", "-b", &derived, &path_str, base],
            repo_root,
        )
        .await
        .map_err(|e| RuntimeError::Fatal(format!("worktree add failed: {first_err}; retry: {e}")))?;
        actual_branch = derived;
    }

    Ok(WorktreeCreated {
        worktree_path: path_str,
        actual_branch,
    })
}

pub async fn fetch(repo_root: &Path) -> NetResult {
    net_op(repo_root, &["fetch", "--prune"]).await
}

pub async fn pull(repo_root: &Path) -> NetResult {
    net_op(repo_root, &["pull", "--ff-only"]).await
}

async fn net_op(repo_root: &Path, args: &[&str]) -> NetResult {
    match run_git(args, repo_root).await {
        Ok(output) => NetResult {
            success: true,
            output,
        },
        Err(output) => {
            let err = RuntimeError::Transient(output.clone());
            warn!(
                component = "git",
                event = "git.net_op.failed",
                args = ?args,
                error = %err,
                "Git network operation failed (non-fatal)"
            );
            NetResult {
                success: false,
                output,
            }
        }
    }
}

/// Checkout `branch`, creating it when allowed. Fails only if both the
/// checkout and the creation path fail.
pub async fn checkout_or_create_branch(
    repo_root: &Path,
    branch: &str,
    create_branch: bool,
    default_branch: Option<&str>,
) -> Result<(), RuntimeError> {
    validate_branch(branch)?;

    let checkout_err = match run_git(&["checkout", branch], repo_root).await {
        Ok(_) => return Ok(()),
        Err(e) => e,
    };

    if !create_branch {
        return Err(RuntimeError::PreconditionFailed(format!(
            "checkout {branch} failed: {checkout_err}"
        )));
    }

    let base = default_branch.unwrap_or("HEAD");
    run_git(&["checkout", "-b", branch, base], repo_root)
        .await
        .map(|_| ())
        .map_err(|create_err| {
            RuntimeError::Fatal(format!(
                "checkout {branch} failed ({checkout_err}); creation also failed ({create_err})"
            ))
        })
}

pub async fn is_worktree_dirty(path: &Path) -> bool {
    match run_git(&["status", "--porcelain"], path).await {
        Ok(output) => !output.is_empty(),
        // A worktree we can't inspect counts as dirty.
        Err(_) => true,
    }
}

#[derive(Debug, Clone)]
pub struct RemoveResult {
    pub removed: bool,
}

/// Remove a worktree. Dirty without `force` → `{removed: false}`.
/// A requested `branch_to_delete` is deleted only after successful removal.
pub async fn remove_worktree(
    repo_root: &Path,
    worktree_path: &Path,
    opts: &RemoveWorktreeOpts,
) -> Result<RemoveResult, RuntimeError> {
    if !opts.force && is_worktree_dirty(worktree_path).await {
        return Ok(RemoveResult { removed: false });
    }

    let path_str = worktree_path.to_string_lossy().to_string();
    let mut args = vec!["worktree", "remove"];
    if opts.force {
        args.push("--force");
    }
    args.push(&path_str);

    run_git(&args, repo_root)
        .await
        .map_err(|e| RuntimeError::Fatal(format!("worktree remove failed: {e}")))?;

    if let Some(branch) = &opts.branch_to_delete {
        if let Err(e) = run_git(&["branch", "-D", branch], repo_root).await {
            warn!(
                component = "git",
                event = "git.branch.delete_failed",
                branch = %branch,
                error = %e,
                "Failed to delete derived branch after worktree removal"
            );
        }
    }

    Ok(RemoveResult { removed: true })
}

fn short_unique_suffix() -> String {
    companion_protocol::new_id()[..8].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn branch_name_validation() {
        assert!(is_valid_branch_name("feat/x"));
        assert!(is_valid_branch_name("release-1.2_rc"));
        assert!(!is_valid_branch_name(""));
        assert!(!is_valid_branch_name("feat x"));
        assert!(!is_valid_branch_name("a;rm -rf"));
        assert!(!is_valid_branch_name("héllo"));
    }

    #[test]
    fn worktree_path_replaces_slashes() {
        let path = worktree_path_for(Path::new("/home/u/proj"), "feat/x", None);
        assert_eq!(
            path,
            PathBuf::from("/home/u/proj-worktrees/feat-x")
        );
    }

    #[test]
    fn worktree_path_with_suffix_is_distinct() {
        let a = worktree_path_for(Path::new("/home/u/proj"), "main", Some("ab12cd34"));
        let b = worktree_path_for(Path::new("/home/u/proj"), "main", None);
        assert_ne!(a, b);
        assert!(a.to_string_lossy().contains("main-ab12cd34"));
    }
}
