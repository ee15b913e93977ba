//! Context resolution against real repositories.

mod common;

use common::TestRepo;
use lumenflow::config::EngineDefaults;
use lumenflow::context::{ContextQuery, Location, compute_context, read_wu_state};
use lumenflow::wu::{WuId, WuStatus, schema};

const LANE: &str = "Core: Engine";

fn wu(n: u32) -> WuId {
    WuId::new(n).unwrap()
}

#[test]
fn main_context_with_clean_git_state() {
    let repo = TestRepo::new();
    repo.seed_wu(9, LANE, "ready", "");

    let context = compute_context(
        &repo.paths(),
        &EngineDefaults::default(),
        &ContextQuery {
            cwd: repo.root.clone(),
            wu_id: Some(wu(9)),
            session_id: None,
        },
    );

    assert_eq!(context.location, Location::Main);
    let git = context.git.expect("git state resolves in a repo");
    assert_eq!(git.branch.as_deref(), Some("main"));
    assert!(!git.dirty);
    let view = context.wu.expect("WU state resolves");
    assert_eq!(view.effective_status, WuStatus::Ready);
    assert!(view.is_consistent);
    assert_eq!(
        context.branch_drift,
        lumenflow::config::BranchDriftLevel::None
    );
}

#[test]
fn worktree_location_carries_the_wu_id() {
    let repo = TestRepo::new();
    repo.seed_wu(9, LANE, "in_progress", "");
    let worktree = repo.make_worktree(9, LANE);

    let context = compute_context(
        &repo.paths(),
        &EngineDefaults::default(),
        &ContextQuery {
            cwd: worktree,
            wu_id: Some(wu(9)),
            session_id: None,
        },
    );
    assert_eq!(context.location, Location::Worktree { wu_id: Some(wu(9)) });
}

#[test]
fn divergent_worktree_status_wins_from_main() {
    let repo = TestRepo::new();
    repo.seed_wu(9, LANE, "in_progress", "");
    let worktree = repo.make_worktree(9, LANE);

    // The worktree's copy moves to blocked without main knowing
    let mut blocked = schema::load_work_unit(&worktree.join("wu/WU-9.yaml"))
        .unwrap()
        .wu;
    blocked.status = WuStatus::Blocked;
    std::fs::write(
        worktree.join("wu/WU-9.yaml"),
        schema::to_yaml(&blocked).unwrap(),
    )
    .unwrap();
    repo.git_in(&worktree, &["add", "-A", "."]);
    repo.git_in(&worktree, &["commit", "-m", "wu(WU-9): block"]);

    let view = read_wu_state(&repo.repo(), &repo.paths(), wu(9), true)
        .expect("WU state resolves");
    assert!(!view.is_consistent, "divergence must be flagged");
    assert_eq!(view.effective_status, WuStatus::Blocked);
    assert_eq!(view.wu.status, WuStatus::InProgress, "main's copy is kept");
}

#[test]
fn consistent_worktree_is_reported_consistent() {
    let repo = TestRepo::new();
    repo.seed_wu(9, LANE, "in_progress", "");
    repo.make_worktree(9, LANE);

    let view = read_wu_state(&repo.repo(), &repo.paths(), wu(9), true).unwrap();
    assert!(view.is_consistent);
    assert_eq!(view.effective_status, WuStatus::InProgress);
}
