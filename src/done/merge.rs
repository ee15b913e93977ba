//! Merge phase of completion.
//!
//! Integration into `main` never checks out local `main`: a temp branch from
//! `origin/main` is checked out in a disposable worktree, the lane branch's
//! commits are brought in (fast-forward when possible, linearised otherwise),
//! and the result is pushed with the refspec `tmp/wu-done/wu-<n>:main`. The
//! remote ref update is the linearisation point; on a lost race the retry
//! strategy refetches and tries again.

use std::path::Path;

use crate::error::{LumenError, Result};
use crate::git::micro::cleanup_orphaned_micro_worktree;
use crate::git::Repository;
use crate::paths::{RepoPaths, temp_branch};
use crate::retry::{RetryPreset, is_retryable_git_failure, with_retry};
use crate::wu::WuId;

/// Result of the merge phase.
#[derive(Debug, Default)]
pub struct MergeOutcome {
    pub pushed: bool,
    pub merged: bool,
    pub pr_url: Option<String>,
}

/// Resolve merge conflicts on append-only files by unioning both sides.
///
/// The event log is JSONL ordered by append position; two agents appending
/// concurrently conflict textually but never semantically. Both sides' lines
/// are concatenated, deduplicated, and ordered by their `timestamp` field.
/// Stamp conflicts keep our side (stamps for one WU are written once with
/// identical content). Returns the conflicted paths that were resolved;
/// other conflicts are left for the caller to surface.
pub fn auto_resolve_append_only_conflicts(
    repo: &Repository,
    paths: &RepoPaths,
    worktree: &Path,
) -> Result<Vec<String>> {
    let conflicted = repo.run_command(&["diff", "--name-only", "--diff-filter=U"])?;
    let mut resolved = Vec::new();

    let events_rel = paths.events_file_rel();
    let stamps_prefix = format!(
        "{}/",
        paths
            .rel(&paths.stamps_dir())
            .unwrap_or_else(|| "operations/stamps".to_string())
    );

    for rel in conflicted.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if rel == events_rel {
            let file = worktree.join(rel);
            let raw = std::fs::read_to_string(&file).map_err(|e| {
                LumenError::git(format!("read conflicted {}: {e}", file.display()))
            })?;
            let merged = union_jsonl_conflict(&raw);
            std::fs::write(&file, merged).map_err(|e| {
                LumenError::git(format!("write resolved {}: {e}", file.display()))
            })?;
            repo.add(&[rel.to_string()])?;
            resolved.push(rel.to_string());
        } else if rel.starts_with(&stamps_prefix) {
            repo.run_command(&["checkout", "--ours", "--", rel])?;
            repo.add(&[rel.to_string()])?;
            resolved.push(rel.to_string());
        }
    }
    Ok(resolved)
}

/// Union the lines of a conflicted JSONL file, dropping conflict markers,
/// deduplicating, and sorting by the JSON `timestamp` field (stable for
/// lines without one).
fn union_jsonl_conflict(raw: &str) -> String {
    let mut seen = std::collections::HashSet::new();
    let mut lines: Vec<&str> = Vec::new();
    for line in raw.lines() {
        if line.starts_with("<<<<<<<")
            || line.starts_with("=======")
            || line.starts_with(">>>>>>>")
            || line.starts_with("|||||||")
            || line.trim().is_empty()
        {
            continue;
        }
        if seen.insert(line) {
            lines.push(line);
        }
    }
    lines.sort_by_key(|line| {
        serde_json::from_str::<serde_json::Value>(line)
            .ok()
            .and_then(|v| v.get("timestamp").and_then(|t| t.as_str().map(String::from)))
            .unwrap_or_default()
    });
    let mut out = lines.join("\n");
    if !out.is_empty() {
        out.push('\n');
    }
    out
}

/// Bring the lane branch's commits onto the temp (main) branch.
///
/// Fast-forward when main has not moved; otherwise linearise the lane
/// commits on top (unless `auto_rebase` is off, which fails instead).
/// Conflicts on append-only files are auto-resolved; anything else aborts
/// the linearisation and fails.
fn integrate_lane_into_temp(
    micro: &Repository,
    paths: &RepoPaths,
    worktree: &Path,
    lane_branch: &str,
    auto_rebase: bool,
) -> Result<()> {
    if micro.merge(lane_branch, true).is_ok() {
        return Ok(());
    }
    if !auto_rebase {
        return Err(LumenError::git_with_hint(
            format!("cannot fast-forward {lane_branch} onto main and auto-rebase is disabled"),
            vec![format!("git rebase origin/main {lane_branch}")],
        ));
    }

    let base = micro.merge_base("HEAD", lane_branch)?;
    let range = format!("{base}..{lane_branch}");
    if let Err(e) = micro.run_command(&["cherry-pick", &range]) {
        // Try the append-only resolution once, then continue the pick
        let resolved = auto_resolve_append_only_conflicts(micro, paths, worktree)?;
        if resolved.is_empty() {
            let _ = micro.run_command(&["cherry-pick", "--abort"]);
            return Err(LumenError::git_with_hint(
                format!("linearising {lane_branch} onto main conflicted: {e}"),
                vec![
                    format!("git rebase origin/main {lane_branch}"),
                    "resolve conflicts, then re-run wu:done".to_string(),
                ],
            ));
        }
        if let Err(e) = micro.run_command(&["-c", "core.editor=true", "cherry-pick", "--continue"])
        {
            let _ = micro.run_command(&["cherry-pick", "--abort"]);
            return Err(LumenError::git(format!(
                "cherry-pick did not complete after conflict resolution: {e}"
            )));
        }
    }
    Ok(())
}

/// One attempt at integrating the lane branch into `origin/main` via a
/// push-only micro-worktree.
fn attempt_push_to_main(
    repo: &Repository,
    paths: &RepoPaths,
    id: WuId,
    lane_branch: &str,
    auto_rebase: bool,
) -> Result<()> {
    let branch = temp_branch("wu-done", id);
    cleanup_orphaned_micro_worktree(repo, &branch)?;
    repo.fetch("origin", "main")?;
    repo.create_branch_no_checkout(&branch, "origin/main")?;

    let tempdir = tempfile::Builder::new()
        .prefix("lumenflow-done-")
        .tempdir()
        .map_err(|e| LumenError::git(format!("create merge worktree temp dir: {e}")))?;
    let worktree_path = tempdir.path().join("wt");

    let result = (|| -> Result<()> {
        repo.worktree_add_existing(&worktree_path, &branch)?;
        let micro = repo.worktree_at(&worktree_path);

        // Pick up anything that landed on origin/main since the fetch
        if let Err(e) = micro.pull_rebase_autostash("origin", "main") {
            log::debug!("pull --rebase in merge worktree: {e}");
        }

        integrate_lane_into_temp(&micro, paths, &worktree_path, lane_branch, auto_rebase)?;
        micro.push_refspec("origin", &branch, "main")?;
        Ok(())
    })();

    if repo.worktree_remove(&worktree_path, true).is_err() {
        let _ = repo.worktree_prune();
    }
    if repo.branch_exists(&branch).unwrap_or(false) {
        let _ = repo.delete_branch(&branch, true);
    }

    result
}

/// Integrate the lane branch into main, retrying lost push races with the
/// `wu_done` preset.
pub fn integrate_lane_branch(
    repo: &Repository,
    paths: &RepoPaths,
    id: WuId,
    lane_branch: &str,
    auto_rebase: bool,
) -> Result<MergeOutcome> {
    let cfg = RetryPreset::WuDone.config();
    with_retry(
        &cfg,
        |err: &LumenError| is_retryable_git_failure(&err.to_string()),
        |attempt, err, delay| {
            log::warn!(
                "{id}: merge attempt {attempt} lost the race ({err}); retrying in {}ms",
                delay.as_millis()
            );
        },
        |_| attempt_push_to_main(repo, paths, id, lane_branch, auto_rebase),
    )
    .map(|()| MergeOutcome {
        pushed: true,
        merged: true,
        pr_url: None,
    })
    .map_err(|exhausted| match exhausted.last {
        LumenError::Git { message, try_next } => LumenError::Git {
            message: format!("{message} (after {} attempt(s))", exhausted.attempts),
            try_next,
        },
        other => other,
    })
}

/// branch-pr mode: push the lane branch and open a PR with `gh`.
///
/// When `gh` is unavailable the push still happens and completion succeeds
/// with `pr_url: None`; the push is the durable part, the PR is decoration.
pub fn push_and_open_pr(
    repo: &Repository,
    id: WuId,
    lane_branch: &str,
    title: &str,
) -> Result<MergeOutcome> {
    repo.push("origin", lane_branch)?;

    let output = std::process::Command::new("gh")
        .args([
            "pr",
            "create",
            "--head",
            lane_branch,
            "--title",
            &format!("wu({id}): {title}"),
            "--fill",
        ])
        .current_dir(repo.dir())
        .output();

    let pr_url = match output {
        Ok(out) if out.status.success() => {
            let url = String::from_utf8_lossy(&out.stdout).trim().to_string();
            (!url.is_empty()).then_some(url)
        }
        Ok(out) => {
            log::warn!(
                "gh pr create failed; branch pushed, no PR: {}",
                String::from_utf8_lossy(&out.stderr).trim()
            );
            None
        }
        Err(e) => {
            log::warn!("gh unavailable; branch pushed, no PR: {e}");
            None
        }
    };

    Ok(MergeOutcome {
        pushed: true,
        merged: false,
        pr_url,
    })
}
