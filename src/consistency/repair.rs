//! Idempotent drift repair.

use std::path::Path;

use crate::backlog::{DONE_SECTION, IN_PROGRESS_SECTION, remove_wu_from_section};
use crate::error::Result;
use crate::git::micro::{MicroWorktreeSpec, with_micro_worktree};
use crate::git::Repository;
use crate::lanes::check_worktree_exists;
use crate::paths::{RepoPaths, lane_branch};
use crate::stamps::{StampTracker, stamp_content};
use crate::utils;
use crate::wu::store::{EventStore, WuEvent};
use crate::wu::{WuId, WuStatus, schema};

use super::detect::{DriftKind, check_wu_consistency};

/// A drift the repairer refused to touch, with the guard that stopped it.
#[derive(Debug, Clone)]
pub struct SkippedRepair {
    pub kind: DriftKind,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct RepairOutcome {
    pub repaired: Vec<DriftKind>,
    pub skipped: Vec<SkippedRepair>,
    /// Repo-relative paths the file-level repairs touched.
    pub touched: Vec<String>,
    /// Whether a repair commit was pushed to main.
    pub committed: bool,
}

/// Remove the WU from status.md's in-progress section. Returns touched paths.
fn repair_status_md(paths: &RepoPaths, id: WuId) -> Result<Vec<String>> {
    let path = paths.status_file();
    let content = std::fs::read_to_string(&path).unwrap_or_default();
    let (updated, changed) = remove_wu_from_section(&content, IN_PROGRESS_SECTION, id);
    if !changed {
        return Ok(Vec::new());
    }
    std::fs::write(&path, updated).map_err(|e| {
        crate::error::LumenError::validation(Some(id), format!("write {}: {e}", path.display()))
    })?;
    Ok(vec![paths.status_file_rel()])
}

/// Resolve a dual listing in backlog.md by keeping the Done entry.
fn repair_backlog_dual(paths: &RepoPaths, id: WuId) -> Result<Vec<String>> {
    let path = paths.backlog_file();
    let content = std::fs::read_to_string(&path).unwrap_or_default();
    if !crate::backlog::section_contains(&content, DONE_SECTION, id) {
        return Ok(Vec::new());
    }
    let (updated, changed) = remove_wu_from_section(&content, IN_PROGRESS_SECTION, id);
    if !changed {
        return Ok(Vec::new());
    }
    std::fs::write(&path, updated).map_err(|e| {
        crate::error::LumenError::validation(Some(id), format!("write {}: {e}", path.display()))
    })?;
    Ok(vec![paths.backlog_file_rel()])
}

/// Create the missing stamp for a done WU. Returns touched paths.
fn repair_missing_stamp(paths: &RepoPaths, id: WuId) -> Result<Vec<String>> {
    let normalized = schema::load_work_unit(&paths.wu_file(id))?;
    let wu = normalized.wu;
    let completed = wu
        .completed
        .or_else(|| wu.completed_at.map(|at| at.date_naive()))
        .unwrap_or_else(utils::today);
    let stamp = paths.stamp_file(id);
    if let Some(parent) = stamp.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            crate::error::LumenError::validation(Some(id), format!("create {}: {e}", parent.display()))
        })?;
    }
    std::fs::write(&stamp, stamp_content(id, &wu.title, completed)).map_err(|e| {
        crate::error::LumenError::validation(Some(id), format!("write {}: {e}", stamp.display()))
    })?;
    Ok(vec![paths.stamp_file_rel(id)])
}

/// Bring a not-done YAML in line with its tracked stamp: status=done,
/// locked, completion timestamps. Returns touched paths.
fn repair_yaml_to_done(paths: &RepoPaths, id: WuId) -> Result<Vec<String>> {
    let normalized = schema::load_work_unit(&paths.wu_file(id))?;
    let mut wu = normalized.wu;
    if wu.status == WuStatus::Done && wu.locked {
        return Ok(Vec::new());
    }
    let now = utils::now_datetime();
    wu.status = WuStatus::Done;
    wu.locked = true;
    wu.completed_at.get_or_insert(now);
    wu.completed = wu.completed_at.map(|at| at.date_naive());
    std::fs::write(paths.wu_file(id), schema::to_yaml(&wu)?).map_err(|e| {
        crate::error::LumenError::validation(Some(id), format!("write WU YAML: {e}"))
    })?;
    Ok(vec![paths.wu_file_rel(id)])
}

/// Append claim (when absent) + complete events into the worktree's copy of
/// the event log, iff the derived status is not already done.
fn append_reconciliation_events(paths: &RepoPaths, id: WuId) -> Result<Vec<String>> {
    let store = EventStore::new(paths);
    if store.derive_status(id)? == Some(WuStatus::Done) {
        return Ok(Vec::new());
    }
    let now = utils::now_datetime();
    if store.last_event(id, Some("claim"))?.is_none() {
        let normalized = schema::load_work_unit(&paths.wu_file(id))?;
        store.append(&WuEvent::Claim {
            wu_id: id,
            timestamp: now,
            lane: normalized.wu.lane,
            title: normalized.wu.title,
        })?;
    }
    store.append(&WuEvent::Complete {
        wu_id: id,
        timestamp: now,
    })?;
    Ok(vec![paths.events_file_rel()])
}

/// Delete a done WU's lingering worktree and branch, subject to three
/// mandatory guards: the caller's cwd must be outside the worktree, the
/// worktree must be clean, and a tracked stamp must exist.
fn repair_orphan_worktree(
    repo: &Repository,
    paths: &RepoPaths,
    id: WuId,
    cwd: &Path,
) -> Result<std::result::Result<(), String>> {
    let tracker = StampTracker::new(repo, paths);
    if !tracker.is_tracked(id)? {
        return Ok(Err(
            "no tracked stamp; deleting the worktree could lose a completion".to_string(),
        ));
    }

    let pattern = regex::Regex::new(&format!(r"(?i)\b{}\b", regex::escape(&id.lower())))
        .expect("worktree id regex");
    let worktree = repo.worktrees()?.into_iter().find(|wt| {
        let dir_name = wt
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        pattern.is_match(&dir_name)
            || wt.branch.as_deref().is_some_and(|b| pattern.is_match(b))
    });

    let mut branch_to_delete = None;
    if let Some(wt) = worktree {
        let canon_cwd = dunce::canonicalize(cwd).unwrap_or_else(|_| cwd.to_path_buf());
        let canon_wt = dunce::canonicalize(&wt.path).unwrap_or_else(|_| wt.path.clone());
        if canon_cwd.starts_with(&canon_wt) {
            return Ok(Err("cwd is inside the worktree being removed".to_string()));
        }
        if repo.worktree_at(&wt.path).is_dirty()? {
            return Ok(Err("worktree has uncommitted changes".to_string()));
        }
        repo.worktree_remove(&wt.path, true)?;
        branch_to_delete = wt.branch;
    }

    // Fall back to the recorded/derived lane branch when no worktree held it
    if branch_to_delete.is_none() {
        if let Ok(normalized) = schema::load_work_unit(&paths.wu_file(id)) {
            branch_to_delete = Some(
                normalized
                    .wu
                    .claimed_branch
                    .unwrap_or_else(|| lane_branch(&normalized.wu.lane, id)),
            );
        }
    }

    if let Some(branch) = branch_to_delete {
        if repo.branch_exists(&branch)? {
            repo.delete_branch(&branch, true)?;
        }
        if let Err(e) = repo.delete_remote_branch("origin", &branch) {
            log::warn!("remote {branch} not deleted: {e}");
        }
    }

    Ok(Ok(()))
}

/// Detect and repair one WU's drifts.
///
/// File-level repairs are batched into a single micro-worktree operation,
/// committed as `fix(WU-N): repair state inconsistency` and pushed to main.
/// Worktree/branch deletion runs afterwards under its safety guards.
/// Re-running on a healthy WU is a no-op.
pub fn repair_wu(
    repo: &Repository,
    paths: &RepoPaths,
    id: WuId,
    cwd: &Path,
) -> Result<RepairOutcome> {
    let report = check_wu_consistency(repo, paths, id)?;
    let mut outcome = RepairOutcome::default();
    if report.drifts.is_empty() {
        return Ok(outcome);
    }

    let file_level: Vec<DriftKind> = report
        .drifts
        .iter()
        .map(|d| d.kind)
        .filter(|kind| {
            matches!(
                kind,
                DriftKind::YamlDoneStatusInProgress
                    | DriftKind::BacklogDualSection
                    | DriftKind::YamlDoneNoStamp
                    | DriftKind::StampExistsYamlNotDone
            )
        })
        .collect();

    if !file_level.is_empty() {
        let spec = MicroWorktreeSpec {
            operation: "repair",
            wu_id: id,
            lane_branch: None,
            base_ref: "origin/main",
            push_only: true,
        };
        let mut touched: Vec<String> = Vec::new();
        let kinds = file_level.clone();
        let result = with_micro_worktree(
            repo,
            &spec,
            &format!("fix({id}): repair state inconsistency"),
            |worktree| {
                let wpaths = paths.rebase(worktree);
                for kind in &kinds {
                    let paths_touched = match kind {
                        DriftKind::YamlDoneStatusInProgress => repair_status_md(&wpaths, id)?,
                        DriftKind::BacklogDualSection => repair_backlog_dual(&wpaths, id)?,
                        DriftKind::YamlDoneNoStamp => repair_missing_stamp(&wpaths, id)?,
                        DriftKind::StampExistsYamlNotDone => {
                            let mut t = repair_yaml_to_done(&wpaths, id)?;
                            t.extend(append_reconciliation_events(&wpaths, id)?);
                            t
                        }
                        _ => Vec::new(),
                    };
                    touched.extend(paths_touched);
                }
                touched.sort();
                touched.dedup();
                Ok(touched.clone())
            },
            None,
        )?;
        outcome.committed = result.pushed;
        outcome.touched = touched;
        outcome.repaired.extend(file_level);
    }

    if report.has(DriftKind::OrphanWorktreeDone) {
        match repair_orphan_worktree(repo, paths, id, cwd)? {
            Ok(()) => {
                // Verify before claiming success: the worktree and branch are
                // gone exactly when the detector no longer fires
                if check_worktree_exists(repo, id)? {
                    outcome.skipped.push(SkippedRepair {
                        kind: DriftKind::OrphanWorktreeDone,
                        reason: "worktree still present after removal".to_string(),
                    });
                } else {
                    outcome.repaired.push(DriftKind::OrphanWorktreeDone);
                }
            }
            Err(reason) => outcome.skipped.push(SkippedRepair {
                kind: DriftKind::OrphanWorktreeDone,
                reason,
            }),
        }
    }

    for drift in &report.drifts {
        if drift.kind == DriftKind::MissingWorktreeClaimed {
            outcome.skipped.push(SkippedRepair {
                kind: DriftKind::MissingWorktreeClaimed,
                reason: "manual intervention required: recreate or release the claim".to_string(),
            });
        }
    }

    Ok(outcome)
}
