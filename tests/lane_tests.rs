//! Lane occupancy and worktree matching against real repositories.

mod common;

use common::TestRepo;
use lumenflow::lanes::{check_lane_occupancy, check_worktree_exists};
use lumenflow::wu::WuId;
use rstest::rstest;

const LANE: &str = "Docs: Guides";

fn wu(n: u32) -> WuId {
    WuId::new(n).unwrap()
}

#[rstest]
#[case(2049, true)]
#[case(204, false)]
#[case(20, false)]
#[case(49, false)]
fn worktree_match_requires_word_boundary(#[case] id: u32, #[case] expected: bool) {
    let repo = TestRepo::new();
    repo.make_worktree(2049, LANE);

    assert_eq!(
        check_worktree_exists(&repo.repo(), wu(id)).unwrap(),
        expected,
        "WU-{id} against a wu-2049 worktree"
    );
}

#[test]
fn no_worktrees_means_no_match() {
    let repo = TestRepo::new();
    assert!(!check_worktree_exists(&repo.repo(), wu(1)).unwrap());
}

#[test]
fn active_wu_holds_the_lane() {
    let repo = TestRepo::new();
    repo.seed_wu(301, LANE, "in_progress", "");
    repo.seed_wu(302, LANE, "ready", "");

    let err = check_lane_occupancy(&repo.repo(), &repo.paths(), LANE, wu(302)).unwrap_err();
    let msg = err.to_string();
    assert!(msg.contains("WIP limit"), "got: {msg}");
    assert!(msg.contains("WU-301"));
}

#[test]
fn done_wu_with_lingering_worktree_blocks_the_lane() {
    let repo = TestRepo::new();
    repo.seed_done_wu(303, LANE, "");
    repo.make_worktree(303, LANE);
    repo.seed_wu(304, LANE, "ready", "");

    let err = check_lane_occupancy(&repo.repo(), &repo.paths(), LANE, wu(304)).unwrap_err();
    assert!(err.to_string().contains("consistency repair"), "got: {err}");
}

#[test]
fn other_lanes_do_not_interfere() {
    let repo = TestRepo::new();
    repo.seed_wu(305, "Core: Engine", "in_progress", "");
    repo.seed_wu(306, LANE, "ready", "");

    check_lane_occupancy(&repo.repo(), &repo.paths(), LANE, wu(306))
        .expect("a busy Core lane must not block Docs");
}

#[test]
fn clean_done_wus_do_not_block() {
    let repo = TestRepo::new();
    repo.seed_done_wu(307, LANE, "");
    repo.seed_wu(308, LANE, "ready", "");

    check_lane_occupancy(&repo.repo(), &repo.paths(), LANE, wu(308))
        .expect("a completed and cleaned WU must not hold the lane");
}
