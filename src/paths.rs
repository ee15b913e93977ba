//! Path and branch-name factory.
//!
//! Every on-disk artifact location and every branch naming convention lives
//! here so the rest of the engine never concatenates path fragments by hand.
//! Directory names are configurable per repository; the defaults match the
//! layout the engine bootstraps into a fresh repo.

use std::path::{Path, PathBuf};

use crate::wu::WuId;

/// Layout of LumenFlow artifacts relative to a repository root.
///
/// Construct with [`RepoPaths::new`] for the default layout. All accessors
/// return absolute paths under the root; [`RepoPaths::rel`] converts back to
/// the repo-relative form used for git staging and backlog references.
#[derive(Debug, Clone)]
pub struct RepoPaths {
    root: PathBuf,
    wu_dir: String,
    stamps_dir: String,
    state_dir: String,
    memory_dir: String,
    operations_dir: String,
}

impl RepoPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            wu_dir: "wu".to_string(),
            stamps_dir: "operations/stamps".to_string(),
            state_dir: ".lumenflow/state".to_string(),
            memory_dir: ".lumenflow/memory".to_string(),
            operations_dir: "operations".to_string(),
        }
    }

    /// Rebase this layout onto a different root (e.g., a micro-worktree).
    ///
    /// Artifact locations are repo-relative, so the same layout applies in
    /// every checkout of the repository.
    pub fn rebase(&self, root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..self.clone()
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn wu_dir(&self) -> PathBuf {
        self.root.join(&self.wu_dir)
    }

    pub fn wu_file(&self, id: WuId) -> PathBuf {
        self.wu_dir().join(format!("{id}.yaml"))
    }

    /// Repo-relative WU YAML path, e.g. `wu/WU-7.yaml`.
    ///
    /// This exact string (wrapped in parentheses) is what backlog/status
    /// markdown lines are matched on.
    pub fn wu_file_rel(&self, id: WuId) -> String {
        format!("{}/{id}.yaml", self.wu_dir)
    }

    pub fn stamps_dir(&self) -> PathBuf {
        self.root.join(&self.stamps_dir)
    }

    pub fn stamp_file(&self, id: WuId) -> PathBuf {
        self.stamps_dir().join(format!("{id}.done"))
    }

    pub fn stamp_file_rel(&self, id: WuId) -> String {
        format!("{}/{id}.done", self.stamps_dir)
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root.join(&self.state_dir)
    }

    pub fn events_file(&self) -> PathBuf {
        self.state_dir().join("wu-events.jsonl")
    }

    pub fn events_file_rel(&self) -> String {
        format!("{}/wu-events.jsonl", self.state_dir)
    }

    pub fn recovery_dir(&self) -> PathBuf {
        self.state_dir().join("recovery")
    }

    pub fn recovery_file(&self, id: WuId) -> PathBuf {
        self.recovery_dir().join(format!("{id}.recovery"))
    }

    pub fn memory_dir(&self) -> PathBuf {
        self.root.join(&self.memory_dir)
    }

    pub fn signals_file(&self) -> PathBuf {
        self.memory_dir().join("signals.jsonl")
    }

    pub fn receipts_file(&self) -> PathBuf {
        self.memory_dir().join("signal-receipts.jsonl")
    }

    pub fn operations_dir(&self) -> PathBuf {
        self.root.join(&self.operations_dir)
    }

    pub fn backlog_file(&self) -> PathBuf {
        self.operations_dir().join("backlog.md")
    }

    pub fn backlog_file_rel(&self) -> String {
        format!("{}/backlog.md", self.operations_dir)
    }

    pub fn status_file(&self) -> PathBuf {
        self.operations_dir().join("status.md")
    }

    pub fn status_file_rel(&self) -> String {
        format!("{}/status.md", self.operations_dir)
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join("lumenflow.yaml")
    }

    /// Directory that holds lane worktrees, a sibling of the repository root
    /// so `git clean` and editor file watchers inside the repo never see them.
    pub fn worktrees_dir(&self) -> PathBuf {
        let name = self
            .root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "repo".to_string());
        match self.root.parent() {
            Some(parent) => parent.join(format!("{name}-worktrees")),
            None => self.root.join(".worktrees"),
        }
    }

    /// Worktree path for a claimed WU: `<worktreesDir>/<kebab(lane)>-wu-<n>`.
    pub fn worktree_path(&self, lane: &str, id: WuId) -> PathBuf {
        self.worktrees_dir()
            .join(format!("{}-{}", kebab(lane), id.lower()))
    }

    /// Convert an absolute path under the root to its repo-relative string.
    ///
    /// Returns `None` for paths outside the repository; callers treat that as
    /// a scope violation.
    pub fn rel(&self, path: &Path) -> Option<String> {
        path.strip_prefix(&self.root)
            .ok()
            .map(|p| p.to_string_lossy().replace('\\', "/"))
    }
}

/// Kebab-case a lane name for use in branch names and worktree directories.
///
/// `"Core: Engine"` becomes `core-engine`. Runs of non-alphanumeric
/// characters collapse into a single hyphen; leading/trailing hyphens are
/// stripped so the result is always a valid git ref component.
pub fn kebab(lane: &str) -> String {
    let mut out = String::with_capacity(lane.len());
    let mut pending_hyphen = false;
    for ch in lane.chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_hyphen && !out.is_empty() {
                out.push('-');
            }
            pending_hyphen = false;
            out.push(ch.to_ascii_lowercase());
        } else {
            pending_hyphen = true;
        }
    }
    out
}

/// Lane branch for a claimed WU: `lane/<kebab(lane)>/wu-<n>`.
pub fn lane_branch(lane: &str, id: WuId) -> String {
    format!("lane/{}/{}", kebab(lane), id.lower())
}

/// Spec branch carrying a WU's YAML before claim: `spec/wu-<n>`.
pub fn spec_branch(id: WuId) -> String {
    format!("spec/{}", id.lower())
}

/// Temporary branch backing a micro-worktree: `tmp/<operation>/wu-<n>`.
pub fn temp_branch(operation: &str, id: WuId) -> String {
    format!("tmp/{operation}/{}", id.lower())
}
