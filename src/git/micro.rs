//! Micro-worktree manager.
//!
//! Every repo-wide mutation (claim, done, spec writes, repairs) happens in a
//! disposable worktree on a `tmp/<operation>/wu-<n>` branch, never in the
//! user's checkout. The pattern:
//!
//! 1. Sweep any orphaned worktree/branch left by a crashed prior run.
//! 2. Branch from the base ref (usually `origin/main`) and add a worktree in
//!    an OS temp directory.
//! 3. Run the caller's mutation closure there; stage what it returns, with
//!    deletions captured.
//! 4. Integrate: push `tmp/...:main` directly (push-only mode), or merge into
//!    the lane branch's worktree.
//! 5. Remove worktree and temp branch on all exit paths.
//!
//! Step 5 is enforced by a drop guard, so an early `?` cannot leak a worktree.

use std::path::{Path, PathBuf};

use crate::error::{LumenError, Result};
use crate::paths::temp_branch;
use crate::wu::WuId;

use super::{Repository, find_worktree_by_branch};

/// Parameters for one micro-worktree operation.
#[derive(Debug)]
pub struct MicroWorktreeSpec<'a> {
    /// Operation slug used in the temp branch name (`wu-done`, `repair`, ...).
    pub operation: &'a str,
    pub wu_id: WuId,
    /// Lane branch to merge into when not push-only.
    pub lane_branch: Option<&'a str>,
    /// Ref the temp branch starts from, typically `origin/main`.
    pub base_ref: &'a str,
    /// Push the temp branch straight to `origin/main` with a refspec instead
    /// of merging into the lane branch.
    pub push_only: bool,
}

/// What a micro-worktree operation ended up doing.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct MicroWorktreeOutcome {
    /// False when the mutation closure produced no staged changes.
    pub committed: bool,
    pub pushed: bool,
    pub merged: bool,
    /// Repo-relative paths that were staged.
    pub staged: Vec<String>,
}

/// Drop guard owning the temp worktree and branch.
struct MicroWorktreeGuard<'r> {
    repo: &'r Repository,
    branch: String,
    worktree_path: PathBuf,
    /// Owns the enclosing temp directory; dropped after the worktree is
    /// removed.
    _tempdir: tempfile::TempDir,
}

impl Drop for MicroWorktreeGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.repo.worktree_remove(&self.worktree_path, true) {
            log::warn!("micro-worktree removal failed (pruning instead): {e}");
            let _ = self.repo.worktree_prune();
        }
        match self.repo.branch_exists(&self.branch) {
            Ok(true) => {
                if let Err(e) = self.repo.delete_branch(&self.branch, true) {
                    log::warn!("temp branch {} not deleted: {e}", self.branch);
                }
            }
            Ok(false) => {}
            Err(e) => log::warn!("temp branch {} existence check failed: {e}", self.branch),
        }
    }
}

/// Remove any worktree/branch left over from a crashed run of the same
/// operation. Safe to call when nothing is orphaned.
pub fn cleanup_orphaned_micro_worktree(repo: &Repository, branch: &str) -> Result<()> {
    let porcelain = repo.worktree_list_porcelain()?;
    if let Some(path) = find_worktree_by_branch(&porcelain, branch) {
        log::warn!(
            "removing orphaned micro-worktree {} (branch {branch})",
            path.display()
        );
        if repo.worktree_remove(&path, true).is_err() {
            repo.worktree_prune()?;
        }
    }
    if repo.branch_exists(branch)? {
        repo.delete_branch(branch, true)?;
    }
    Ok(())
}

/// Run `mutate` inside a fresh micro-worktree and integrate the result.
///
/// `mutate` receives the worktree path and returns the repo-relative paths to
/// stage; staging uses `git add -A` semantics so deletions are captured.
/// `after_merge` runs after a successful merge into the lane branch (not in
/// push-only mode), rooted at the lane worktree.
///
/// On return (success or failure) no worktree or temp branch matching
/// `tmp/<operation>/wu-<n>` exists.
pub fn with_micro_worktree(
    repo: &Repository,
    spec: &MicroWorktreeSpec<'_>,
    commit_message: &str,
    mutate: impl FnOnce(&Path) -> Result<Vec<String>>,
    mut after_merge: Option<&mut dyn FnMut(&Repository) -> Result<()>>,
) -> Result<MicroWorktreeOutcome> {
    let branch = temp_branch(spec.operation, spec.wu_id);

    cleanup_orphaned_micro_worktree(repo, &branch)?;

    repo.create_branch_no_checkout(&branch, spec.base_ref)?;

    let tempdir = tempfile::Builder::new()
        .prefix("lumenflow-")
        .tempdir()
        .map_err(|e| LumenError::git(format!("create micro-worktree temp dir: {e}")))?;
    let worktree_path = tempdir.path().join("wt");

    if let Err(e) = repo.worktree_add_existing(&worktree_path, &branch) {
        // The branch was created above; the guard does not exist yet, so the
        // branch must be torn down here.
        let _ = repo.delete_branch(&branch, true);
        return Err(e.into());
    }

    let guard = MicroWorktreeGuard {
        repo,
        branch: branch.clone(),
        worktree_path: worktree_path.clone(),
        _tempdir: tempdir,
    };

    let micro = repo.worktree_at(&worktree_path);
    let staged = mutate(&worktree_path)?;

    micro.add_with_deletions(&staged)?;
    let has_changes = !micro.run_check(&["diff", "--cached", "--quiet"])?;
    if !has_changes {
        log::debug!("micro-worktree {branch}: nothing to commit");
        drop(guard);
        return Ok(MicroWorktreeOutcome {
            staged,
            ..Default::default()
        });
    }
    micro.commit(commit_message)?;

    let mut outcome = MicroWorktreeOutcome {
        committed: true,
        staged,
        ..Default::default()
    };

    if spec.push_only {
        micro.push_refspec("origin", &branch, "main")?;
        outcome.pushed = true;
    } else {
        let lane_branch = spec.lane_branch.ok_or_else(|| {
            LumenError::git("micro-worktree merge mode requires a lane branch")
        })?;
        let porcelain = repo.worktree_list_porcelain()?;
        let lane_path = find_worktree_by_branch(&porcelain, lane_branch).ok_or_else(|| {
            LumenError::git(format!("lane branch {lane_branch} has no worktree to merge into"))
        })?;
        let lane_repo = repo.worktree_at(&lane_path);
        lane_repo.merge(&branch, false)?;
        outcome.merged = true;
        if let Some(hook) = after_merge.as_deref_mut() {
            hook(&lane_repo)?;
        }
    }

    drop(guard);
    Ok(outcome)
}
