//! Consistency detection and repair against real repositories.

mod common;

use common::TestRepo;
use lumenflow::consistency::{DriftKind, check_wu_consistency, repair_wu};
use lumenflow::wu::{WuId, WuStatus, schema};

const LANE: &str = "Core: Engine";

fn wu(n: u32) -> WuId {
    WuId::new(n).unwrap()
}

const DONE_EXTRA: &str = "completed_at: 2026-07-10T12:00:00Z\ncompleted: 2026-07-10\n";

fn seed_done(repo: &TestRepo, id: u32, with_stamp: bool) {
    let extra = format!(
        "{DONE_EXTRA}claimed_branch: lane/core-engine/wu-{id}\nclaimed_mode: worktree\n"
    );
    repo.write(
        &format!("wu/WU-{id}.yaml"),
        &TestRepo::wu_yaml(id, LANE, "done", &extra).replace("locked: false", "locked: true"),
    );
    if with_stamp {
        repo.write(
            &format!("operations/stamps/WU-{id}.done"),
            &format!("WU WU-{id} — Test work unit {id}\nCompleted: 2026-07-10\n"),
        );
    }
    repo.commit_all(&format!("wu(WU-{id}): done - Test work unit {id}"));
    repo.push_main();
}

#[test]
fn healthy_wu_is_valid() {
    let repo = TestRepo::new();
    seed_done(&repo, 210, true);
    let report = check_wu_consistency(&repo.repo(), &repo.paths(), wu(210)).unwrap();
    assert!(report.valid(), "unexpected drifts: {:?}", report.drifts);
}

#[test]
fn orphan_worktree_detected_and_repaired() {
    let repo = TestRepo::new();
    seed_done(&repo, 200, true);
    let worktree = repo.make_worktree(200, LANE);
    assert!(worktree.exists());

    let paths = repo.paths();
    let git = repo.repo();

    let report = check_wu_consistency(&git, &paths, wu(200)).unwrap();
    assert!(report.has(DriftKind::OrphanWorktreeDone));

    let outcome = repair_wu(&git, &paths, wu(200), &repo.root).unwrap();
    assert!(outcome.repaired.contains(&DriftKind::OrphanWorktreeDone));
    assert!(outcome.skipped.is_empty(), "skipped: {:?}", outcome.skipped);

    assert!(!worktree.exists());
    assert!(!repo.branch_exists("lane/core-engine/wu-200"));

    let after = check_wu_consistency(&git, &paths, wu(200)).unwrap();
    assert!(after.valid(), "drifts remain: {:?}", after.drifts);
}

#[test]
fn orphan_repair_refuses_dirty_worktree() {
    let repo = TestRepo::new();
    seed_done(&repo, 200, true);
    let worktree = repo.make_worktree(200, LANE);
    std::fs::write(worktree.join("scratch.txt"), "uncommitted").unwrap();

    let outcome = repair_wu(&repo.repo(), &repo.paths(), wu(200), &repo.root).unwrap();
    assert!(outcome
        .skipped
        .iter()
        .any(|s| s.kind == DriftKind::OrphanWorktreeDone && s.reason.contains("uncommitted")));
    assert!(worktree.exists(), "guard must leave the worktree alone");
}

#[test]
fn orphan_repair_refuses_cwd_inside_worktree() {
    let repo = TestRepo::new();
    seed_done(&repo, 200, true);
    let worktree = repo.make_worktree(200, LANE);

    let outcome = repair_wu(&repo.repo(), &repo.paths(), wu(200), &worktree).unwrap();
    assert!(outcome
        .skipped
        .iter()
        .any(|s| s.kind == DriftKind::OrphanWorktreeDone && s.reason.contains("cwd")));
    assert!(worktree.exists());
}

#[test]
fn orphan_repair_refuses_without_tracked_stamp() {
    let repo = TestRepo::new();
    seed_done(&repo, 200, false);
    let worktree = repo.make_worktree(200, LANE);

    let outcome = repair_wu(&repo.repo(), &repo.paths(), wu(200), &repo.root).unwrap();
    assert!(outcome
        .skipped
        .iter()
        .any(|s| s.kind == DriftKind::OrphanWorktreeDone && s.reason.contains("stamp")));
    assert!(worktree.exists());
}

#[test]
fn missing_stamp_is_created_on_main() {
    let repo = TestRepo::new();
    seed_done(&repo, 201, false);

    let paths = repo.paths();
    let git = repo.repo();
    let report = check_wu_consistency(&git, &paths, wu(201)).unwrap();
    assert!(report.has(DriftKind::YamlDoneNoStamp));

    let outcome = repair_wu(&git, &paths, wu(201), &repo.root).unwrap();
    assert!(outcome.repaired.contains(&DriftKind::YamlDoneNoStamp));
    assert!(outcome.committed);
    assert!(outcome
        .touched
        .contains(&"operations/stamps/WU-201.done".to_string()));

    let stamp = repo
        .show("origin/main", "operations/stamps/WU-201.done")
        .expect("stamp pushed to origin/main");
    assert_eq!(stamp, "WU WU-201 — Test work unit 201\nCompleted: 2026-07-10\n");

    // After pulling the repair, the WU checks clean
    repo.git(&["pull", "origin", "main"]);
    let after = check_wu_consistency(&git, &paths, wu(201)).unwrap();
    assert!(after.valid(), "drifts remain: {:?}", after.drifts);

    // Re-running the repairer is a no-op
    let again = repair_wu(&git, &paths, wu(201), &repo.root).unwrap();
    assert!(again.repaired.is_empty());
    assert!(!again.committed);
}

#[test]
fn stamp_without_done_yaml_reconciles_yaml_and_events() {
    let repo = TestRepo::new();
    repo.seed_wu(202, LANE, "in_progress", "claimed_branch: lane/core-engine/wu-202\n");
    repo.write(
        "operations/stamps/WU-202.done",
        "WU WU-202 — Test work unit 202\nCompleted: 2026-07-10\n",
    );
    repo.commit_all("stamp landed without metadata");
    repo.push_main();

    let paths = repo.paths();
    let git = repo.repo();
    let report = check_wu_consistency(&git, &paths, wu(202)).unwrap();
    assert!(report.has(DriftKind::StampExistsYamlNotDone));

    let outcome = repair_wu(&git, &paths, wu(202), &repo.root).unwrap();
    assert!(outcome.repaired.contains(&DriftKind::StampExistsYamlNotDone));

    repo.git(&["pull", "origin", "main"]);
    let normalized = schema::load_work_unit(&repo.root.join("wu/WU-202.yaml")).unwrap();
    assert_eq!(normalized.wu.status, WuStatus::Done);
    assert!(normalized.wu.locked);
    assert!(normalized.wu.completed_at.is_some());

    let events = repo.read(".lumenflow/state/wu-events.jsonl");
    assert!(events.contains(r#""type":"claim""#));
    assert!(events.contains(r#""type":"complete""#));

    let after = check_wu_consistency(&git, &paths, wu(202)).unwrap();
    assert!(after.valid(), "drifts remain: {:?}", after.drifts);
}

#[test]
fn status_md_in_progress_entry_for_done_wu_is_removed() {
    let repo = TestRepo::new();
    repo.write(
        "operations/status.md",
        "# Status\n\n## 🔧 In progress\n\n- WU-203 — Test work unit 203 (wu/WU-203.yaml)\n\n## ✅ Done\n",
    );
    seed_done(&repo, 203, true);

    let paths = repo.paths();
    let git = repo.repo();
    let report = check_wu_consistency(&git, &paths, wu(203)).unwrap();
    assert!(report.has(DriftKind::YamlDoneStatusInProgress));

    let outcome = repair_wu(&git, &paths, wu(203), &repo.root).unwrap();
    assert!(outcome
        .repaired
        .contains(&DriftKind::YamlDoneStatusInProgress));

    let status_md = repo.show("origin/main", "operations/status.md").unwrap();
    assert!(!status_md.contains("(wu/WU-203.yaml)"));
}

#[test]
fn missing_worktree_claimed_is_manual() {
    let repo = TestRepo::new();
    repo.seed_wu(
        204,
        LANE,
        "in_progress",
        "claimed_branch: lane/core-engine/wu-204\nclaimed_mode: worktree\nworktree_path: /nonexistent/wu-204\n",
    );

    let paths = repo.paths();
    let git = repo.repo();
    let report = check_wu_consistency(&git, &paths, wu(204)).unwrap();
    assert!(report.has(DriftKind::MissingWorktreeClaimed));

    let outcome = repair_wu(&git, &paths, wu(204), &repo.root).unwrap();
    assert!(outcome
        .skipped
        .iter()
        .any(|s| s.kind == DriftKind::MissingWorktreeClaimed));
    assert!(outcome.repaired.is_empty());
}
