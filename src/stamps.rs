//! Completion stamps.
//!
//! A stamp (`<stampsDir>/<WU-N>.done`) is the durable marker that a WU's
//! completion reached `main`. YAML can drift, markdown can be hand-edited;
//! the stamp on `origin/main` is the cross-check everything else reconciles
//! against. A stamp only counts once git tracks it; a stray local `.done`
//! file must never trigger repairs or recovery decisions.

use chrono::NaiveDate;

use crate::git::Repository;
use crate::paths::RepoPaths;
use crate::wu::WuId;

/// Exact stamp file contents.
pub fn stamp_content(id: WuId, title: &str, completed: NaiveDate) -> String {
    format!("WU {id} — {title}\nCompleted: {}\n", completed.format("%Y-%m-%d"))
}

/// Read access to stamps, distinguishing local files from tracked ones.
#[derive(Debug)]
pub struct StampTracker<'a> {
    repo: &'a Repository,
    paths: &'a RepoPaths,
}

impl<'a> StampTracker<'a> {
    pub fn new(repo: &'a Repository, paths: &'a RepoPaths) -> Self {
        Self { repo, paths }
    }

    /// Whether a stamp file exists on disk (tracked or not).
    pub fn exists_locally(&self, id: WuId) -> bool {
        self.paths.stamp_file(id).is_file()
    }

    /// Whether the stamp is tracked at the given ref (e.g. `HEAD`,
    /// `origin/main`).
    pub fn tracked_at(&self, id: WuId, reference: &str) -> Result<bool, crate::git::GitError> {
        self.repo
            .object_exists(reference, &self.paths.stamp_file_rel(id))
    }

    /// Whether the stamp is tracked in the local HEAD.
    ///
    /// This is the "recognised by the stamps tracker" predicate: repairs act
    /// on tracked stamps only.
    pub fn is_tracked(&self, id: WuId) -> Result<bool, crate::git::GitError> {
        self.tracked_at(id, "HEAD")
    }

    /// Whether the completion commit reached `origin/main`, the zombie
    /// detection cross-check.
    pub fn on_origin_main(&self, id: WuId) -> Result<bool, crate::git::GitError> {
        self.tracked_at(id, "origin/main")
    }
}
