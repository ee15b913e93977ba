// Helper functions are shared across several integration test binaries; not
// every binary uses every helper.
#![allow(dead_code)]

//! Test harness: isolated git repositories with a bare origin.
//!
//! Each test gets a fresh temp directory holding `origin.git` (bare), a
//! `repo` clone of it on `main`, and room for lane worktrees next to the
//! clone (the engine places worktrees as siblings of the repo root). Git
//! commands run with a pinned identity and no signing so commits work on any
//! CI box.

use std::path::{Path, PathBuf};
use std::process::Command;

use lumenflow::git::Repository;
use lumenflow::paths::{RepoPaths, lane_branch};
use lumenflow::wu::WuId;

pub struct TestRepo {
    /// Owns everything; dropped last.
    _dir: tempfile::TempDir,
    pub root: PathBuf,
    pub origin: PathBuf,
}

impl TestRepo {
    pub fn new() -> Self {
        let _ = env_logger::builder().is_test(true).try_init();

        let dir = tempfile::tempdir().expect("create temp dir");
        let origin = dir.path().join("origin.git");
        let root = dir.path().join("repo");

        run_git(dir.path(), &["init", "--bare", "origin.git"]);
        run_git(dir.path(), &["init", "-b", "main", "repo"]);

        let repo = Self {
            _dir: dir,
            root,
            origin,
        };
        repo.git(&["config", "user.name", "LumenFlow Tests"]);
        repo.git(&["config", "user.email", "tests@lumenflow.invalid"]);
        repo.git(&["config", "commit.gpgsign", "false"]);
        repo.git(&["remote", "add", "origin", repo.origin.to_str().unwrap()]);

        repo.write(
            "operations/backlog.md",
            "# Backlog\n\n## 🔧 In progress\n\n## ✅ Done\n",
        );
        repo.write(
            "operations/status.md",
            "# Status\n\n## 🔧 In progress\n\n## ✅ Done\n",
        );
        repo.write("README.md", "test repo\n");
        repo.commit_all("chore: seed repo");
        repo.git(&["push", "-u", "origin", "main"]);
        run_git(&repo.origin, &["symbolic-ref", "HEAD", "refs/heads/main"]);
        repo
    }

    pub fn paths(&self) -> RepoPaths {
        RepoPaths::new(&self.root)
    }

    pub fn repo(&self) -> Repository {
        Repository::at(&self.root)
    }

    /// Run git in the repo root, panicking on failure.
    pub fn git(&self, args: &[&str]) -> String {
        run_git(&self.root, args)
    }

    /// Run git in an arbitrary directory (worktrees, second clones).
    pub fn git_in(&self, dir: &Path, args: &[&str]) -> String {
        run_git(dir, args)
    }

    pub fn write(&self, rel: &str, content: &str) {
        let path = self.root.join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("create parent dirs");
        }
        std::fs::write(path, content).expect("write file");
    }

    pub fn read(&self, rel: &str) -> String {
        std::fs::read_to_string(self.root.join(rel)).expect("read file")
    }

    pub fn commit_all(&self, message: &str) {
        self.git(&["add", "-A", "."]);
        self.git(&["commit", "-m", message]);
    }

    pub fn push_main(&self) {
        self.git(&["push", "origin", "main"]);
    }

    /// Contents of a file at a ref (e.g. on origin/main), or None.
    pub fn show(&self, reference: &str, rel: &str) -> Option<String> {
        let out = Command::new("git")
            .args(["show", &format!("{reference}:{rel}")])
            .current_dir(&self.root)
            .output()
            .expect("run git show");
        out.status
            .success()
            .then(|| String::from_utf8_lossy(&out.stdout).into_owned())
    }

    /// A standard WU YAML document for tests.
    pub fn wu_yaml(id: u32, lane: &str, status: &str, extra: &str) -> String {
        format!(
            r#"id: WU-{id}
title: Test work unit {id}
lane: "{lane}"
type: chore
status: {status}
priority: P2
created: 2026-07-01
locked: false
description: >-
  A sufficiently long description for the integration test fixture, covering
  what this work unit changes and why the change is needed.
acceptance:
  - behaves as the test asserts
code_paths: []
tests: []
{extra}"#
        )
    }

    /// Commit a WU YAML on main and push it.
    pub fn seed_wu(&self, id: u32, lane: &str, status: &str, extra: &str) {
        self.write(
            &format!("wu/WU-{id}.yaml"),
            &Self::wu_yaml(id, lane, status, extra),
        );
        self.commit_all(&format!("wu(WU-{id}): spec"));
        self.push_main();
    }

    /// Commit a completed (done, locked) WU YAML on main and push it.
    pub fn seed_done_wu(&self, id: u32, lane: &str, extra: &str) {
        let yaml = Self::wu_yaml(
            id,
            lane,
            "done",
            &format!("completed_at: 2026-07-10T12:00:00Z\ncompleted: 2026-07-10\n{extra}"),
        )
        .replace("locked: false", "locked: true");
        self.write(&format!("wu/WU-{id}.yaml"), &yaml);
        self.commit_all(&format!("wu(WU-{id}): done - Test work unit {id}"));
        self.push_main();
    }

    /// Create the lane branch and worktree for a claimed WU, mirroring what
    /// `wu:claim` produces. Returns the worktree path.
    pub fn make_worktree(&self, id: u32, lane: &str) -> PathBuf {
        let wu_id = WuId::new(id).unwrap();
        let branch = lane_branch(lane, wu_id);
        let path = self.paths().worktree_path(lane, wu_id);
        std::fs::create_dir_all(path.parent().unwrap()).expect("create worktrees dir");
        self.git(&["branch", &branch, "main"]);
        self.git(&["worktree", "add", path.to_str().unwrap(), &branch]);
        path
    }

    /// Make a commit on origin/main from a second clone, leaving the local
    /// main behind.
    pub fn advance_origin_main(&self, rel: &str, content: &str) {
        let other = self.root.parent().unwrap().join("other");
        run_git(
            self.root.parent().unwrap(),
            &["clone", self.origin.to_str().unwrap(), "other"],
        );
        run_git(&other, &["config", "user.name", "Other Agent"]);
        run_git(&other, &["config", "user.email", "other@lumenflow.invalid"]);
        run_git(&other, &["config", "commit.gpgsign", "false"]);
        let file = other.join(rel);
        if let Some(parent) = file.parent() {
            std::fs::create_dir_all(parent).expect("create parent dirs");
        }
        std::fs::write(&file, content).expect("write file in other clone");
        run_git(&other, &["add", "-A", "."]);
        run_git(&other, &["commit", "-m", "other agent commit"]);
        run_git(&other, &["push", "origin", "main"]);
        std::fs::remove_dir_all(&other).expect("drop other clone");
    }

    pub fn branch_exists(&self, branch: &str) -> bool {
        Command::new("git")
            .args(["show-ref", "--verify", "--quiet", &format!("refs/heads/{branch}")])
            .current_dir(&self.root)
            .status()
            .expect("run git show-ref")
            .success()
    }

    pub fn worktree_listed(&self, needle: &str) -> bool {
        self.git(&["worktree", "list", "--porcelain"]).contains(needle)
    }
}

fn run_git(dir: &Path, args: &[&str]) -> String {
    let out = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .unwrap_or_else(|e| panic!("failed to spawn git {args:?}: {e}"));
    assert!(
        out.status.success(),
        "git {args:?} failed in {}:\n{}{}",
        dir.display(),
        String::from_utf8_lossy(&out.stdout),
        String::from_utf8_lossy(&out.stderr),
    );
    String::from_utf8_lossy(&out.stdout).into_owned()
}
