//! Drift detection.

use crate::backlog::{DONE_SECTION, IN_PROGRESS_SECTION, section_contains};
use crate::error::Result;
use crate::git::Repository;
use crate::lanes::check_worktree_exists;
use crate::paths::{RepoPaths, lane_branch};
use crate::stamps::StampTracker;
use crate::wu::{WuId, WuStatus, schema};

/// The independent drift classes, checked per WU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum DriftKind {
    /// YAML says done but status.md still lists the WU as in progress.
    YamlDoneStatusInProgress,
    /// backlog.md lists the WU in both Done and In progress.
    BacklogDualSection,
    /// YAML says done but no tracked stamp exists.
    YamlDoneNoStamp,
    /// YAML says done but a worktree or lane branch still exists.
    OrphanWorktreeDone,
    /// A tracked stamp exists but YAML is not done.
    StampExistsYamlNotDone,
    /// Claimed in worktree mode, active, but the worktree path is gone.
    MissingWorktreeClaimed,
}

impl DriftKind {
    /// Whether the repairer can heal this drift without a human.
    pub fn auto_repairable(self) -> bool {
        !matches!(self, DriftKind::MissingWorktreeClaimed)
    }
}

/// One detected drift.
#[derive(Debug, Clone)]
pub struct Drift {
    pub wu_id: WuId,
    pub kind: DriftKind,
    pub detail: String,
}

/// Result of checking one WU.
#[derive(Debug)]
pub struct ConsistencyReport {
    pub wu_id: WuId,
    pub drifts: Vec<Drift>,
}

impl ConsistencyReport {
    pub fn valid(&self) -> bool {
        self.drifts.is_empty()
    }

    pub fn has(&self, kind: DriftKind) -> bool {
        self.drifts.iter().any(|d| d.kind == kind)
    }
}

fn read_or_empty(path: &std::path::Path) -> String {
    std::fs::read_to_string(path).unwrap_or_default()
}

/// Whether the WU's lane branch (claimed or derived) still exists locally.
fn lingering_branch(repo: &Repository, paths: &RepoPaths, id: WuId) -> Result<Option<String>> {
    let branch = match schema::load_work_unit(&paths.wu_file(id)) {
        Ok(n) => n
            .wu
            .claimed_branch
            .clone()
            .unwrap_or_else(|| lane_branch(&n.wu.lane, id)),
        Err(_) => return Ok(None),
    };
    Ok(repo.branch_exists(&branch)?.then_some(branch))
}

/// Detect every drift for one WU.
pub fn check_wu_consistency(
    repo: &Repository,
    paths: &RepoPaths,
    id: WuId,
) -> Result<ConsistencyReport> {
    let mut drifts = Vec::new();
    let normalized = match schema::load_work_unit(&paths.wu_file(id)) {
        Ok(n) => Some(n),
        Err(e) => {
            log::debug!("consistency check for {id}: YAML unreadable: {e}");
            None
        }
    };
    let status = normalized.as_ref().map(|n| n.wu.status);
    let tracker = StampTracker::new(repo, paths);
    let stamp_tracked = tracker.is_tracked(id).unwrap_or(false);

    let status_md = read_or_empty(&paths.status_file());
    let backlog_md = read_or_empty(&paths.backlog_file());

    if status == Some(WuStatus::Done) {
        if section_contains(&status_md, IN_PROGRESS_SECTION, id) {
            drifts.push(Drift {
                wu_id: id,
                kind: DriftKind::YamlDoneStatusInProgress,
                detail: "status.md still lists the WU as in progress".to_string(),
            });
        }
        if !stamp_tracked {
            drifts.push(Drift {
                wu_id: id,
                kind: DriftKind::YamlDoneNoStamp,
                detail: format!("no tracked stamp at {}", paths.stamp_file_rel(id)),
            });
        }
        let worktree = check_worktree_exists(repo, id)?;
        let branch = lingering_branch(repo, paths, id)?;
        if worktree || branch.is_some() {
            let what = match (&branch, worktree) {
                (Some(branch), true) => format!("worktree and branch {branch}"),
                (Some(branch), false) => format!("branch {branch}"),
                (None, _) => "worktree".to_string(),
            };
            drifts.push(Drift {
                wu_id: id,
                kind: DriftKind::OrphanWorktreeDone,
                detail: format!("{what} still exists for a done WU"),
            });
        }
    }

    if section_contains(&backlog_md, DONE_SECTION, id)
        && section_contains(&backlog_md, IN_PROGRESS_SECTION, id)
    {
        drifts.push(Drift {
            wu_id: id,
            kind: DriftKind::BacklogDualSection,
            detail: "backlog.md lists the WU in both Done and In progress".to_string(),
        });
    }

    if stamp_tracked && status.is_some() && status != Some(WuStatus::Done) {
        drifts.push(Drift {
            wu_id: id,
            kind: DriftKind::StampExistsYamlNotDone,
            detail: format!(
                "tracked stamp present but YAML status is {}",
                status.expect("checked above")
            ),
        });
    }

    if let Some(normalized) = &normalized {
        let wu = &normalized.wu;
        if wu.claimed_mode == Some(crate::wu::ClaimedMode::Worktree)
            && wu.status.is_active()
            && wu
                .worktree_path
                .as_ref()
                .is_none_or(|p| !p.exists())
        {
            drifts.push(Drift {
                wu_id: id,
                kind: DriftKind::MissingWorktreeClaimed,
                detail: "claimed in worktree mode but the worktree path is missing".to_string(),
            });
        }
    }

    Ok(ConsistencyReport { wu_id: id, drifts })
}
