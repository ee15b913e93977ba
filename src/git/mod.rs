//! Git adapter.
//!
//! A thin layer over the `git` binary exposing exactly the operations the
//! engine needs. Every call runs in a fixed working directory (the repo root
//! or a worktree), logs the command line at debug level, and surfaces
//! failures as [`GitError`] carrying the command and stderr. The engine never
//! shells out to git anywhere else.

use std::path::{Path, PathBuf};
use std::process::Command;

mod error;
pub mod micro;
mod parse;

pub use error::GitError;
pub use parse::find_worktree_by_branch;

/// One entry from `git worktree list --porcelain`.
#[derive(Debug, Clone, PartialEq)]
pub struct WorktreeInfo {
    pub path: PathBuf,
    pub head: String,
    pub branch: Option<String>,
    pub bare: bool,
    pub detached: bool,
}

/// Handle for running git in one working directory.
///
/// Cheap to construct; holds no open resources. Use [`Repository::at`] with a
/// worktree path to operate on that worktree.
#[derive(Debug, Clone)]
pub struct Repository {
    dir: PathBuf,
}

impl Repository {
    pub fn at(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// A view of the same repository rooted at a different worktree.
    pub fn worktree_at(&self, path: impl Into<PathBuf>) -> Repository {
        Repository::at(path)
    }

    fn command_line(args: &[&str]) -> String {
        let mut line = String::from("git");
        for arg in args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }

    fn run(&self, args: &[&str]) -> Result<std::process::Output, GitError> {
        let command = Self::command_line(args);
        log::debug!("$ {command} [{}]", self.dir.display());
        Command::new("git")
            .args(args)
            .current_dir(&self.dir)
            .output()
            .map_err(|source| GitError::Io { command, source })
    }

    /// Run a git command; non-zero exit is a [`GitError::CommandFailed`].
    pub fn run_command(&self, args: &[&str]) -> Result<String, GitError> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stdout = String::from_utf8_lossy(&output.stdout);
            // Some git commands report errors on stdout (e.g. commit with
            // nothing to commit)
            let stderr = [stderr.trim(), stdout.trim()]
                .into_iter()
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>()
                .join("\n");
            return Err(GitError::CommandFailed {
                command: Self::command_line(args),
                stderr,
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Run a git command where the exit code is a boolean answer.
    pub fn run_check(&self, args: &[&str]) -> Result<bool, GitError> {
        Ok(self.run(args)?.status.success())
    }

    /// Escape hatch for callers composing operations the adapter does not
    /// model.
    pub fn raw(&self, args: &[&str]) -> Result<String, GitError> {
        self.run_command(args)
    }

    // =========================================================================
    // Read operations
    // =========================================================================

    /// Porcelain status text for downstream parsing.
    pub fn status_porcelain(&self) -> Result<String, GitError> {
        self.run_command(&["status", "--porcelain"])
    }

    pub fn is_dirty(&self) -> Result<bool, GitError> {
        Ok(!self.status_porcelain()?.trim().is_empty())
    }

    /// Current branch, or `None` in detached HEAD state.
    pub fn current_branch(&self) -> Result<Option<String>, GitError> {
        let out = self.run_command(&["branch", "--show-current"])?;
        let branch = out.trim();
        Ok((!branch.is_empty()).then(|| branch.to_string()))
    }

    pub fn commit_hash(&self, reference: &str) -> Result<String, GitError> {
        Ok(self.run_command(&["rev-parse", reference])?.trim().to_string())
    }

    /// `git rev-list --count <range>`.
    pub fn rev_list_count(&self, range: &str) -> Result<u32, GitError> {
        let out = self.run_command(&["rev-list", "--count", range])?;
        out.trim()
            .parse()
            .map_err(|_| GitError::ParseError(format!("rev-list --count returned '{}'", out.trim())))
    }

    /// Commit subjects in `<range>`, newest first.
    pub fn rev_list_subjects(&self, range: &str) -> Result<Vec<String>, GitError> {
        let out = self.run_command(&["log", "--format=%s", range])?;
        Ok(out.lines().map(str::to_string).collect())
    }

    pub fn branch_exists(&self, branch: &str) -> Result<bool, GitError> {
        self.run_check(&[
            "show-ref",
            "--verify",
            "--quiet",
            &format!("refs/heads/{branch}"),
        ])
    }

    /// Whether `<reference>:<path>` names a tracked blob.
    pub fn object_exists(&self, reference: &str, path: &str) -> Result<bool, GitError> {
        let out = self.run_command(&["ls-tree", reference, "--", path])?;
        Ok(!out.trim().is_empty())
    }

    /// Whether the remote has a head named `branch`.
    pub fn remote_branch_exists(&self, remote: &str, branch: &str) -> Result<bool, GitError> {
        let out = self.run_command(&[
            "ls-remote",
            "--heads",
            remote,
            &format!("refs/heads/{branch}"),
        ])?;
        Ok(!out.trim().is_empty())
    }

    /// Contents of `<reference>:<path>` via `git show`.
    pub fn show_file(&self, reference: &str, path: &str) -> Result<String, GitError> {
        self.run_command(&["show", &format!("{reference}:{path}")])
    }

    /// Null-terminated list of staged paths.
    pub fn staged_paths(&self) -> Result<Vec<String>, GitError> {
        let out = self.run_command(&["diff", "--cached", "--name-only", "-z"])?;
        Ok(out
            .split('\0')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Ahead/behind counts of `branch` relative to `upstream`.
    pub fn ahead_behind(&self, branch: &str, upstream: &str) -> Result<(u32, u32), GitError> {
        let out = self.run_command(&[
            "rev-list",
            "--left-right",
            "--count",
            &format!("{branch}...{upstream}"),
        ])?;
        let mut parts = out.split_whitespace();
        let ahead = parts.next().and_then(|s| s.parse().ok());
        let behind = parts.next().and_then(|s| s.parse().ok());
        match (ahead, behind) {
            (Some(a), Some(b)) => Ok((a, b)),
            _ => Err(GitError::ParseError(format!(
                "unexpected rev-list --left-right output '{}'",
                out.trim()
            ))),
        }
    }

    // =========================================================================
    // Mutating operations
    // =========================================================================

    pub fn fetch(&self, remote: &str, reference: &str) -> Result<(), GitError> {
        self.run_command(&["fetch", remote, reference]).map(drop)
    }

    /// `git merge <ref>`, optionally fast-forward-only.
    pub fn merge(&self, reference: &str, ff_only: bool) -> Result<(), GitError> {
        let mut args = vec!["merge"];
        if ff_only {
            args.push("--ff-only");
        }
        args.push(reference);
        self.run_command(&args).map(drop)
    }

    pub fn rebase(&self, onto: &str) -> Result<(), GitError> {
        self.run_command(&["rebase", onto]).map(drop)
    }

    pub fn rebase_abort(&self) -> Result<(), GitError> {
        self.run_command(&["rebase", "--abort"]).map(drop)
    }

    pub fn pull_rebase_autostash(&self, remote: &str, branch: &str) -> Result<(), GitError> {
        self.run_command(&["pull", "--rebase", "--autostash", remote, branch])
            .map(drop)
    }

    pub fn push(&self, remote: &str, branch: &str) -> Result<(), GitError> {
        self.run_command(&["push", remote, branch]).map(drop)
    }

    /// Push `local_ref` to `remote_ref` on the remote, e.g.
    /// `tmp/wu-done/wu-7` -> `main`.
    pub fn push_refspec(
        &self,
        remote: &str,
        local_ref: &str,
        remote_ref: &str,
    ) -> Result<(), GitError> {
        self.run_command(&["push", remote, &format!("{local_ref}:{remote_ref}")])
            .map(drop)
    }

    pub fn create_branch(&self, branch: &str, base: &str) -> Result<(), GitError> {
        self.run_command(&["checkout", "-b", branch, base]).map(drop)
    }

    pub fn create_branch_no_checkout(&self, branch: &str, base: &str) -> Result<(), GitError> {
        self.run_command(&["branch", branch, base]).map(drop)
    }

    pub fn delete_branch(&self, branch: &str, force: bool) -> Result<(), GitError> {
        let flag = if force { "-D" } else { "-d" };
        self.run_command(&["branch", flag, branch]).map(drop)
    }

    pub fn delete_remote_branch(&self, remote: &str, branch: &str) -> Result<(), GitError> {
        self.run_command(&["push", remote, "--delete", branch])
            .map(drop)
    }

    // =========================================================================
    // Worktrees
    // =========================================================================

    pub fn worktree_list_porcelain(&self) -> Result<String, GitError> {
        self.run_command(&["worktree", "list", "--porcelain"])
    }

    pub fn worktrees(&self) -> Result<Vec<WorktreeInfo>, GitError> {
        WorktreeInfo::parse_porcelain_list(&self.worktree_list_porcelain()?)
    }

    /// `git worktree add <path> <branch>` for an existing branch.
    pub fn worktree_add_existing(&self, path: &Path, branch: &str) -> Result<(), GitError> {
        let path_str = path.to_str().ok_or_else(|| {
            GitError::ParseError(format!("worktree path is not UTF-8: {}", path.display()))
        })?;
        self.run_command(&["worktree", "add", path_str, branch])
            .map(drop)
    }

    pub fn worktree_remove(&self, path: &Path, force: bool) -> Result<(), GitError> {
        let path_str = path.to_str().ok_or_else(|| {
            GitError::ParseError(format!("worktree path is not UTF-8: {}", path.display()))
        })?;
        let mut args = vec!["worktree", "remove"];
        if force {
            args.push("--force");
        }
        args.push(path_str);
        self.run_command(&args).map(drop)
    }

    pub fn worktree_prune(&self) -> Result<(), GitError> {
        self.run_command(&["worktree", "prune"]).map(drop)
    }

    // =========================================================================
    // Staging and commits
    // =========================================================================

    /// Stage the given repo-relative paths.
    pub fn add(&self, paths: &[String]) -> Result<(), GitError> {
        if paths.is_empty() {
            return Ok(());
        }
        let mut args = vec!["add", "--"];
        args.extend(paths.iter().map(String::as_str));
        self.run_command(&args).map(drop)
    }

    /// Stage paths with `-A` so deletions are captured. An empty list stages
    /// everything (`git add -A .`).
    pub fn add_with_deletions(&self, paths: &[String]) -> Result<(), GitError> {
        let mut args = vec!["add", "-A"];
        if paths.is_empty() {
            args.push(".");
        } else {
            args.push("--");
            args.extend(paths.iter().map(String::as_str));
        }
        self.run_command(&args).map(drop)
    }

    pub fn commit(&self, message: &str) -> Result<(), GitError> {
        self.run_command(&["commit", "-m", message]).map(drop)
    }

    /// `git reset --soft <ref>`: used by the squash paths to collapse
    /// completion attempts without touching the working tree.
    pub fn reset_soft(&self, reference: &str) -> Result<(), GitError> {
        self.run_command(&["reset", "--soft", reference]).map(drop)
    }

    pub fn reset_hard(&self, reference: &str) -> Result<(), GitError> {
        self.run_command(&["reset", "--hard", reference]).map(drop)
    }

    /// Merge base of two refs.
    pub fn merge_base(&self, a: &str, b: &str) -> Result<String, GitError> {
        Ok(self.run_command(&["merge-base", a, b])?.trim().to_string())
    }
}
