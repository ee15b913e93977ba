//! Parsing of `git worktree list --porcelain` output.
//!
//! Porcelain output is a sequence of blocks separated by blank lines. Each
//! block opens with `worktree <path>` and continues with attribute lines:
//! valued ones (`HEAD <sha>`, `branch <ref>`) and bare flags (`bare`,
//! `detached`). Attributes this engine has no use for (`locked`, `prunable`,
//! and whatever future git versions add) are skipped rather than rejected.

use std::path::PathBuf;

use super::{GitError, WorktreeInfo};

/// Split an attribute line into its key and optional value. Flag attributes
/// like `bare` are a bare key with no value.
fn split_attr(line: &str) -> (&str, Option<&str>) {
    match line.split_once(' ') {
        Some((key, value)) => (key, Some(value)),
        None => (line, None),
    }
}

/// Require a value on an attribute that must carry one.
fn require_value<'a>(key: &str, value: Option<&'a str>) -> Result<&'a str, GitError> {
    value.ok_or_else(|| {
        GitError::ParseError(format!("porcelain attribute '{key}' carries no value"))
    })
}

impl WorktreeInfo {
    /// Parse the full porcelain listing into one entry per block.
    pub fn parse_porcelain_list(output: &str) -> Result<Vec<Self>, GitError> {
        output
            .split("\n\n")
            .map(str::trim)
            .filter(|block| !block.is_empty())
            .map(Self::parse_block)
            .collect()
    }

    fn parse_block(block: &str) -> Result<Self, GitError> {
        let mut lines = block.lines();
        let opener = lines
            .next()
            .ok_or_else(|| GitError::ParseError("empty worktree block".to_string()))?;

        let (key, value) = split_attr(opener);
        if key != "worktree" {
            return Err(GitError::ParseError(format!(
                "worktree block must open with a path, got '{opener}'"
            )));
        }
        let mut wt = WorktreeInfo {
            path: PathBuf::from(require_value(key, value)?),
            head: String::new(),
            branch: None,
            bare: false,
            detached: false,
        };

        for line in lines {
            match split_attr(line) {
                ("HEAD", value) => wt.head = require_value("HEAD", value)?.to_string(),
                ("branch", value) => {
                    let full = require_value("branch", value)?;
                    // git reports the full ref; the engine works with short
                    // branch names throughout
                    wt.branch = Some(match full.strip_prefix("refs/heads/") {
                        Some(short) => short.to_string(),
                        None => full.to_string(),
                    });
                }
                ("bare", _) => wt.bare = true,
                ("detached", _) => wt.detached = true,
                _ => {}
            }
        }

        Ok(wt)
    }
}

/// Find the filesystem path of the worktree holding `branch`, from porcelain
/// output. Returns `None` when no worktree has the branch checked out.
pub fn find_worktree_by_branch(porcelain: &str, branch: &str) -> Option<PathBuf> {
    WorktreeInfo::parse_porcelain_list(porcelain)
        .ok()?
        .into_iter()
        .find(|wt| wt.branch.as_deref() == Some(branch))
        .map(|wt| wt.path)
}
