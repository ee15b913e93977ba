//! Context resolver.
//!
//! `compute_context` produces the unified [`WuContext`]: where the caller is
//! (main checkout, a WU worktree, outside), what git says, what the WU's YAML
//! says, and whether the two agree, inside a soft 100 ms budget. Sub-reads
//! run in parallel and fail soft: a broken git state nulls one field instead
//! of failing the whole resolution, because every command entry point calls
//! this before doing anything.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::config::EngineDefaults;
use crate::git::Repository;
use crate::paths::RepoPaths;
use crate::wu::{WorkUnit, WuId, WuStatus, schema};

/// Where the current working directory sits relative to the repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    /// Inside the main checkout.
    Main,
    /// Inside a lane worktree; the id is extracted from the directory name
    /// when present.
    Worktree { wu_id: Option<WuId> },
    /// Not inside this repository at all.
    Outside,
}

/// Fail-soft snapshot of one checkout's git state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GitState {
    pub branch: Option<String>,
    pub detached: bool,
    pub dirty: bool,
    pub has_staged: bool,
    pub ahead: u32,
    pub behind: u32,
    pub tracking: Option<String>,
    pub modified: Vec<String>,
}

/// A WU's YAML plus the status the engine should act on.
///
/// When resolved from main while a worktree holds the lane branch, the
/// worktree's copy of the YAML wins: its status is `effective_status` and
/// `is_consistent` is false if the two disagree.
#[derive(Debug, Clone)]
pub struct WuStateView {
    pub wu: WorkUnit,
    pub effective_status: WuStatus,
    pub is_consistent: bool,
}

/// The unified context: location × git × WU × session.
#[derive(Debug)]
pub struct WuContext {
    pub location: Location,
    pub session_id: Option<String>,
    pub git: Option<GitState>,
    pub wu: Option<WuStateView>,
    /// Git state of the WU's worktree, populated when resolving from main
    /// for an in-progress WU.
    pub worktree_git: Option<GitState>,
    /// How far the lane branch has drifted behind its upstream.
    pub branch_drift: crate::config::BranchDriftLevel,
    pub elapsed: Duration,
    /// Budget overrun is observability, not an error.
    pub over_budget: bool,
}

/// Inputs to [`compute_context`].
#[derive(Debug, Default)]
pub struct ContextQuery {
    pub cwd: PathBuf,
    pub wu_id: Option<WuId>,
    pub session_id: Option<String>,
}

/// Classify a cwd against the repo root and its worktrees directory.
pub fn classify_location(paths: &RepoPaths, cwd: &Path) -> Location {
    let canon = |p: &Path| dunce::canonicalize(p).unwrap_or_else(|_| p.to_path_buf());
    let cwd = canon(cwd);
    let worktrees = canon(&paths.worktrees_dir());

    if let Ok(rest) = cwd.strip_prefix(&worktrees) {
        let wu_id = rest
            .components()
            .next()
            .and_then(|c| WuId::extract(&c.as_os_str().to_string_lossy()));
        return Location::Worktree { wu_id };
    }
    if cwd.starts_with(canon(paths.root())) {
        return Location::Main;
    }
    Location::Outside
}

/// Read git state fail-soft: any hard failure yields `None`, partial
/// failures (no upstream, say) degrade individual fields.
pub fn read_git_state(repo: &Repository) -> Option<GitState> {
    let porcelain = match repo.status_porcelain() {
        Ok(p) => p,
        Err(e) => {
            log::debug!("git state unavailable at {}: {e}", repo.dir().display());
            return None;
        }
    };

    let branch = repo.current_branch().ok().flatten();
    let detached = branch.is_none() && repo.commit_hash("HEAD").is_ok();

    let mut dirty = false;
    let mut has_staged = false;
    let mut modified = Vec::new();
    for line in porcelain.lines() {
        if line.len() < 3 {
            continue;
        }
        dirty = true;
        let (index, worktree) = (line.as_bytes()[0], line.as_bytes()[1]);
        if index != b' ' && index != b'?' {
            has_staged = true;
        }
        if worktree == b'M' || index == b'M' {
            modified.push(line[3..].to_string());
        }
    }

    let tracking = branch.as_ref().and_then(|_| {
        repo.raw(&["rev-parse", "--abbrev-ref", "@{upstream}"])
            .ok()
            .map(|s| s.trim().to_string())
    });
    let (ahead, behind) = match (&branch, &tracking) {
        (Some(branch), Some(upstream)) => {
            repo.ahead_behind(branch, upstream).unwrap_or((0, 0))
        }
        _ => (0, 0),
    };

    Some(GitState {
        branch,
        detached,
        dirty,
        has_staged,
        ahead,
        behind,
        tracking,
        modified,
    })
}

/// Find the branch of a worktree whose name or branch carries the WU id.
fn worktree_branch_for(repo: &Repository, id: WuId) -> Option<String> {
    let pattern = regex::Regex::new(&format!(r"(?i)\b{}\b", regex::escape(&id.lower()))).ok()?;
    repo.worktrees().ok()?.into_iter().find_map(|wt| {
        let branch = wt.branch?;
        let dir_name = wt
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        (pattern.is_match(&branch) || pattern.is_match(&dir_name)).then_some(branch)
    })
}

/// Read the WU view. From main, the worktree's copy of the YAML is consulted
/// for status divergence.
pub fn read_wu_state(
    repo: &Repository,
    paths: &RepoPaths,
    id: WuId,
    from_main: bool,
) -> Option<WuStateView> {
    let normalized = match schema::load_work_unit(&paths.wu_file(id)) {
        Ok(n) => n,
        Err(e) => {
            log::debug!("WU state unavailable for {id}: {e}");
            return None;
        }
    };
    let wu = normalized.wu;
    let mut view = WuStateView {
        effective_status: wu.status,
        is_consistent: true,
        wu,
    };

    if from_main {
        if let Some(branch) = worktree_branch_for(repo, id) {
            // Skip the main checkout's own branch
            if branch != "main" {
                if let Ok(raw) = repo.show_file(&branch, &paths.wu_file_rel(id)) {
                    if let Ok(worktree_copy) = schema::validate_and_normalize(&raw) {
                        if worktree_copy.wu.status != view.wu.status {
                            view.is_consistent = false;
                            view.effective_status = worktree_copy.wu.status;
                        }
                    }
                }
            }
        }
    }

    Some(view)
}

/// Resolve the full context for a command invocation.
pub fn compute_context(
    paths: &RepoPaths,
    defaults: &EngineDefaults,
    query: &ContextQuery,
) -> WuContext {
    let started = Instant::now();
    let repo = Repository::at(paths.root());
    let cwd_repo = Repository::at(&query.cwd);

    let (location, (git, wu)) = rayon::join(
        || classify_location(paths, &query.cwd),
        || {
            rayon::join(
                || read_git_state(&cwd_repo),
                || {
                    query
                        .wu_id
                        .and_then(|id| read_wu_state(&repo, paths, id, true))
                },
            )
        },
    );

    // Re-resolve WU state with the actual location now known: divergence
    // detection only applies when running from main.
    let wu = match (&location, wu) {
        (Location::Main, wu) => wu,
        (_, Some(view)) => Some(WuStateView {
            is_consistent: true,
            effective_status: view.wu.status,
            wu: view.wu,
        }),
        (_, None) => None,
    };

    let worktree_git = match (&location, &wu) {
        (Location::Main, Some(view)) if view.effective_status == WuStatus::InProgress => view
            .wu
            .worktree_path
            .as_ref()
            .filter(|p| p.exists())
            .and_then(|p| read_git_state(&repo.worktree_at(p.clone()))),
        _ => None,
    };

    // Drift is measured on whichever checkout holds the lane branch
    let behind = worktree_git
        .as_ref()
        .or(git.as_ref())
        .map(|state| state.behind)
        .unwrap_or(0);
    let branch_drift = defaults.branch_drift.classify(behind);
    if branch_drift != crate::config::BranchDriftLevel::None {
        log::warn!("branch is {behind} commit(s) behind its upstream ({branch_drift})");
    }

    let elapsed = started.elapsed();
    let over_budget = elapsed > defaults.context_computation;
    if over_budget {
        log::warn!(
            "context resolution took {}ms (budget {}ms)",
            elapsed.as_millis(),
            defaults.context_computation.as_millis()
        );
    }

    WuContext {
        location,
        session_id: query.session_id.clone(),
        git,
        wu,
        worktree_git,
        branch_drift,
        elapsed,
        over_budget,
    }
}
