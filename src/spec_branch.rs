//! Spec branch protocol.
//!
//! `wu:create` publishes a WU's YAML on `spec/wu-<n>` so `main` is never
//! written by creation. At claim time the spec branch is fast-forwarded into
//! main and deleted. A WU's YAML can therefore live on main, on its spec
//! branch, or (transiently) both; the engine reads main's copy when both
//! exist.

use std::path::Path;

use crate::error::{LumenError, Result};
use crate::git::{Repository, find_worktree_by_branch};
use crate::paths::{RepoPaths, spec_branch};
use crate::wu::WuId;

/// Where a WU's YAML currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum WuSource {
    Main,
    SpecBranch,
    Both,
    NotFound,
}

/// Locate a WU's YAML: tracked on `origin/main`, published on its remote
/// spec branch, both, or neither.
pub fn wu_source(repo: &Repository, paths: &RepoPaths, id: WuId) -> Result<WuSource> {
    let on_main = repo.object_exists("origin/main", &paths.wu_file_rel(id))?;
    let on_spec = repo.remote_branch_exists("origin", &spec_branch(id))?;
    Ok(match (on_main, on_spec) {
        (true, true) => WuSource::Both,
        (true, false) => WuSource::Main,
        (false, true) => WuSource::SpecBranch,
        (false, false) => WuSource::NotFound,
    })
}

/// Fast-forward a WU's spec branch into the current branch (main).
///
/// Used by claim when the source is `spec_branch`. The caller runs this from
/// a main checkout; a non-fast-forward merge fails rather than creating a
/// merge commit on main.
pub fn merge_spec_branch_to_main(repo: &Repository, id: WuId) -> Result<()> {
    let branch = spec_branch(id);
    repo.fetch("origin", &branch)?;
    repo.merge(&format!("origin/{branch}"), true)?;
    Ok(())
}

/// Publish a WU YAML on its spec branch without touching any checkout.
///
/// Builds the branch from `base_ref` in a disposable worktree, writes the
/// YAML, commits, and pushes `spec/wu-<n>` to origin. The local spec branch
/// and worktree are removed on all exit paths; the remote branch is the
/// durable artifact.
pub fn publish_wu_spec(
    repo: &Repository,
    paths: &RepoPaths,
    id: WuId,
    yaml: &str,
    base_ref: &str,
) -> Result<()> {
    let branch = spec_branch(id);

    // Sweep leftovers from a crashed publish
    let porcelain = repo.worktree_list_porcelain()?;
    if let Some(stale) = find_worktree_by_branch(&porcelain, &branch) {
        log::warn!("removing stale spec worktree {}", stale.display());
        if repo.worktree_remove(&stale, true).is_err() {
            repo.worktree_prune()?;
        }
    }
    if repo.branch_exists(&branch)? {
        repo.delete_branch(&branch, true)?;
    }

    repo.create_branch_no_checkout(&branch, base_ref)?;

    let tempdir = tempfile::Builder::new()
        .prefix("lumenflow-spec-")
        .tempdir()
        .map_err(|e| LumenError::git(format!("create spec worktree temp dir: {e}")))?;
    let worktree_path = tempdir.path().join("wt");

    let result = (|| -> Result<()> {
        repo.worktree_add_existing(&worktree_path, &branch)?;

        let micro = repo.worktree_at(&worktree_path);
        let rel = paths.wu_file_rel(id);
        let file = worktree_path.join(&rel);
        if let Some(parent) = file.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| LumenError::git(format!("create {}: {e}", parent.display())))?;
        }
        std::fs::write(&file, yaml)
            .map_err(|e| LumenError::git(format!("write {}: {e}", file.display())))?;

        micro.add_with_deletions(&[rel])?;
        micro.commit(&format!("wu({id}): spec"))?;
        micro.push("origin", &branch)?;
        Ok(())
    })();

    // Cleanup on all exit paths: worktree first, then the local branch
    if repo.worktree_remove(&worktree_path, true).is_err() {
        let _ = repo.worktree_prune();
    }
    if repo.branch_exists(&branch).unwrap_or(false) {
        let _ = repo.delete_branch(&branch, true);
    }

    result
}

/// Delete a WU's spec branch locally and on origin, best-effort.
///
/// Called after claim has merged the spec into main; failures are logged, not
/// fatal, because a dangling spec branch is cosmetic once main has the YAML.
pub fn delete_spec_branch(repo: &Repository, id: WuId) {
    let branch = spec_branch(id);
    match repo.branch_exists(&branch) {
        Ok(true) => {
            if let Err(e) = repo.delete_branch(&branch, true) {
                log::warn!("local {branch} not deleted: {e}");
            }
        }
        Ok(false) => {}
        Err(e) => log::warn!("local {branch} existence check failed: {e}"),
    }
    if let Err(e) = repo.delete_remote_branch("origin", &branch) {
        log::warn!("remote {branch} not deleted: {e}");
    }
}

/// True when `path` (a WU YAML inside a worktree) matches the worktree's
/// checked-out copy of the spec, a guard for claim-time divergence checks.
pub fn spec_matches_worktree(worktree_root: &Path, rel: &str, yaml: &str) -> bool {
    std::fs::read_to_string(worktree_root.join(rel))
        .map(|on_disk| on_disk == yaml)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_enum_is_snake_case() {
        assert_eq!(WuSource::SpecBranch.to_string(), "spec_branch");
        assert_eq!(WuSource::NotFound.to_string(), "not_found");
    }

    #[test]
    fn spec_matches_worktree_compares_bytes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("wu")).unwrap();
        std::fs::write(dir.path().join("wu/WU-1.yaml"), "id: WU-1\n").unwrap();
        assert!(spec_matches_worktree(dir.path(), "wu/WU-1.yaml", "id: WU-1\n"));
        assert!(!spec_matches_worktree(dir.path(), "wu/WU-1.yaml", "id: WU-2\n"));
        assert!(!spec_matches_worktree(dir.path(), "wu/WU-9.yaml", ""));
    }
}
