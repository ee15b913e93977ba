//! Create / claim / release engine operations end-to-end.

mod common;

use common::TestRepo;
use lumenflow::error::ErrorKind;
use lumenflow::ops::Engine;
use lumenflow::signals::SignalBus;
use lumenflow::sink::NoopSink;
use lumenflow::spec_branch::{WuSource, wu_source};
use lumenflow::wu::{WuId, WuStatus, schema};

const LANE: &str = "Core: Engine";

fn wu(n: u32) -> WuId {
    WuId::new(n).unwrap()
}

/// Lock the lanes: definitions in lumenflow.yaml plus the inference file.
fn lock_lanes(repo: &TestRepo) {
    repo.write(
        "lumenflow.yaml",
        "lanes:\n  definitions:\n    - name: \"Core: Engine\"\n      wip_limit: 1\n  lifecycle:\n    status: locked\n",
    );
    repo.write(".lumenflow/lane-inference.yaml", "lanes: {}\n");
    repo.commit_all("chore: lock lanes");
    repo.push_main();
}

fn spec_branch_exists_on_origin(repo: &TestRepo, id: u32) -> bool {
    !repo
        .git(&["ls-remote", "--heads", "origin", &format!("spec/wu-{id}")])
        .trim()
        .is_empty()
}

#[test]
fn create_publishes_on_spec_branch_not_main() {
    let repo = TestRepo::new();
    lock_lanes(&repo);
    let paths = repo.paths();
    let git = repo.repo();
    let bus = SignalBus::new(&paths);
    let engine = Engine {
        repo: &git,
        paths: &paths,
        bus: &bus,
        sink: &NoopSink,
    };

    let id = engine
        .create_wu(&TestRepo::wu_yaml(5, LANE, "ready", ""))
        .expect("create succeeds");
    assert_eq!(id, wu(5));

    assert!(spec_branch_exists_on_origin(&repo, 5));
    assert!(repo.show("origin/main", "wu/WU-5.yaml").is_none());
    assert_eq!(wu_source(&git, &paths, wu(5)).unwrap(), WuSource::SpecBranch);

    // The spec branch carries the canonical YAML
    repo.git(&["fetch", "origin", "spec/wu-5"]);
    let published = repo.show("origin/spec/wu-5", "wu/WU-5.yaml").unwrap();
    let normalized = schema::validate_and_normalize(&published).unwrap();
    assert_eq!(normalized.wu.status, WuStatus::Ready);
}

#[test]
fn create_refuses_duplicates_and_unknown_lanes() {
    let repo = TestRepo::new();
    lock_lanes(&repo);
    let paths = repo.paths();
    let git = repo.repo();
    let bus = SignalBus::new(&paths);
    let engine = Engine {
        repo: &git,
        paths: &paths,
        bus: &bus,
        sink: &NoopSink,
    };

    engine
        .create_wu(&TestRepo::wu_yaml(5, LANE, "ready", ""))
        .unwrap();
    let err = engine
        .create_wu(&TestRepo::wu_yaml(5, LANE, "ready", ""))
        .unwrap_err();
    assert!(err.to_string().contains("already exists"), "got: {err}");

    let err = engine
        .create_wu(&TestRepo::wu_yaml(6, "Nope: Lane", "ready", ""))
        .unwrap_err();
    assert!(err.to_string().contains("not defined"), "got: {err}");
}

#[test]
fn create_requires_locked_lanes_for_delivery_wus() {
    let repo = TestRepo::new();
    // No lumenflow.yaml at all: unconfigured
    let paths = repo.paths();
    let git = repo.repo();
    let bus = SignalBus::new(&paths);
    let engine = Engine {
        repo: &git,
        paths: &paths,
        bus: &bus,
        sink: &NoopSink,
    };

    let err = engine
        .create_wu(&TestRepo::wu_yaml(5, LANE, "ready", ""))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ValidationError);
    assert!(err.to_string().contains("locked"), "got: {err}");

    // Initiative documents are allowed from any lane state
    engine
        .create_wu(&TestRepo::wu_yaml(
            7,
            LANE,
            "ready",
            "initiative: \"Platform Hardening\"\n",
        ))
        .expect("initiative creation is ungated");
}

#[test]
fn claim_merges_spec_branch_and_creates_the_worktree() {
    let repo = TestRepo::new();
    lock_lanes(&repo);
    let paths = repo.paths();
    let git = repo.repo();
    let bus = SignalBus::new(&paths);
    let engine = Engine {
        repo: &git,
        paths: &paths,
        bus: &bus,
        sink: &NoopSink,
    };

    engine
        .create_wu(&TestRepo::wu_yaml(5, LANE, "ready", ""))
        .unwrap();
    let outcome = engine.claim_wu(wu(5)).expect("claim succeeds");

    assert_eq!(outcome.branch, "lane/core-engine/wu-5");
    assert!(outcome.worktree_path.is_dir());
    assert!(repo.branch_exists("lane/core-engine/wu-5"));

    // The spec branch was garbage-collected after the fast-forward
    assert!(!spec_branch_exists_on_origin(&repo, 5));

    // origin/main records the claim: YAML fields plus the claim event
    let claimed = repo.show("origin/main", "wu/WU-5.yaml").unwrap();
    let normalized = schema::validate_and_normalize(&claimed).unwrap();
    assert_eq!(normalized.wu.status, WuStatus::InProgress);
    assert_eq!(
        normalized.wu.claimed_branch.as_deref(),
        Some("lane/core-engine/wu-5")
    );
    let events = repo
        .show("origin/main", ".lumenflow/state/wu-events.jsonl")
        .unwrap();
    assert!(events.contains(r#""type":"claim""#));
    assert!(events.contains(r#""wuId":"WU-5""#));

    // A second claim of the same lane is refused
    engine
        .create_wu(&TestRepo::wu_yaml(8, LANE, "ready", ""))
        .unwrap();
    let err = engine.claim_wu(wu(8)).unwrap_err();
    assert!(err.to_string().contains("WIP limit"), "got: {err}");
}

#[test]
fn release_returns_the_wu_to_ready_and_removes_the_worktree() {
    let repo = TestRepo::new();
    lock_lanes(&repo);
    let paths = repo.paths();
    let git = repo.repo();
    let bus = SignalBus::new(&paths);
    let engine = Engine {
        repo: &git,
        paths: &paths,
        bus: &bus,
        sink: &NoopSink,
    };

    engine
        .create_wu(&TestRepo::wu_yaml(5, LANE, "ready", ""))
        .unwrap();
    let claim = engine.claim_wu(wu(5)).unwrap();

    engine.release_wu(wu(5), &repo.root).expect("release succeeds");

    assert!(!claim.worktree_path.exists());
    assert!(!repo.branch_exists("lane/core-engine/wu-5"));

    let released = repo.show("origin/main", "wu/WU-5.yaml").unwrap();
    let normalized = schema::validate_and_normalize(&released).unwrap();
    assert_eq!(normalized.wu.status, WuStatus::Ready);
    assert_eq!(normalized.wu.claimed_branch, None);
    assert_eq!(normalized.wu.worktree_path, None);

    let events = repo
        .show("origin/main", ".lumenflow/state/wu-events.jsonl")
        .unwrap();
    assert!(events.contains(r#""type":"release""#));

    // The lane is free again
    engine.claim_wu(wu(5)).expect("reclaim after release");
}

#[test]
fn release_refuses_a_dirty_worktree() {
    let repo = TestRepo::new();
    lock_lanes(&repo);
    let paths = repo.paths();
    let git = repo.repo();
    let bus = SignalBus::new(&paths);
    let engine = Engine {
        repo: &git,
        paths: &paths,
        bus: &bus,
        sink: &NoopSink,
    };

    engine
        .create_wu(&TestRepo::wu_yaml(5, LANE, "ready", ""))
        .unwrap();
    let claim = engine.claim_wu(wu(5)).unwrap();
    std::fs::write(claim.worktree_path.join("wip.txt"), "half-done work").unwrap();

    let err = engine.release_wu(wu(5), &repo.root).unwrap_err();
    assert!(err.to_string().contains("uncommitted"), "got: {err}");
    assert!(claim.worktree_path.exists());
}
