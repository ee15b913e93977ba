//! Completion engine (`wu:done`).
//!
//! Completion is a strict phase sequence: guards, zombie recovery, the
//! transition check, the main-sync guard, an atomic metadata transaction
//! (validate before any write, snapshot before flush), git staging under an
//! allowlist, a single completion commit, and integration into `main` by
//! mode. A failure after the commit rolls the branch back to the pre-commit
//! SHA and restores the snapshot, so the worktree is left as if `wu:done`
//! had never run.

pub mod merge;
pub mod recovery;

use std::path::{Path, PathBuf};

use crate::backlog::{
    DONE_SECTION, IN_PROGRESS_SECTION, append_wu_to_section, remove_wu_from_section, wu_line,
};
use crate::error::{LumenError, Result};
use crate::git::Repository;
use crate::paths::{RepoPaths, kebab, lane_branch};
use crate::signals::{NewSignal, SignalBus};
use crate::sink::{ControlPlaneEvent, ControlPlaneEventKind, EventSink, push_events};
use crate::stamps::{StampTracker, stamp_content};
use crate::transaction::{
    WuTransaction, create_transaction_snapshot, restore_from_snapshot,
};
use crate::utils;
use crate::wu::state::assert_transition;
use crate::wu::store::{EventStore, WuEvent};
use crate::wu::{ClaimedMode, WuId, WuStatus, schema};

use merge::{MergeOutcome, integrate_lane_branch, push_and_open_pr};
use recovery::{
    clear_recovery_attempts, increment_recovery, load_recovery, max_recovery_attempts,
    prepare_recovery_with_squash, squash_previous_completion_attempts,
};

/// Result of a successful completion.
#[derive(Debug, PartialEq, Eq)]
pub struct CompletionOutcome {
    pub success: bool,
    pub committed: bool,
    pub pushed: bool,
    pub merged: bool,
    pub pr_url: Option<String>,
    /// The worktree and lane branch may now be removed.
    pub cleanup_safe: bool,
}

/// Caller-tunable completion behaviour.
#[derive(Debug, Clone)]
pub struct CompletionOptions {
    /// Linearise the lane branch onto main when fast-forward is impossible.
    pub auto_rebase: bool,
}

impl Default for CompletionOptions {
    fn default() -> Self {
        Self { auto_rebase: true }
    }
}

/// The completion engine and its collaborators.
pub struct CompletionEngine<'a> {
    /// Handle rooted at the main checkout.
    pub repo: &'a Repository,
    /// Layout of the main checkout.
    pub paths: &'a RepoPaths,
    pub bus: &'a SignalBus,
    pub sink: &'a dyn EventSink,
}

impl CompletionEngine<'_> {
    /// Run the full completion sequence for a WU claimed in a worktree (or,
    /// for branch modes, in whichever checkout holds the lane branch).
    pub fn execute_worktree_completion(
        &self,
        worktree: &Path,
        id: WuId,
        opts: &CompletionOptions,
    ) -> Result<CompletionOutcome> {
        let wpaths = self.paths.rebase(worktree);
        let wrepo = self.repo.worktree_at(worktree);

        // Phase 0: the worktree's WU YAML must parse before anything else
        let mut normalized = schema::load_work_unit(&wpaths.wu_file(id))?;

        // Phase 1: zombie recovery
        if normalized.wu.status == WuStatus::Done {
            let tracker = StampTracker::new(self.repo, self.paths);
            let stamped = tracker.on_origin_main(id).unwrap_or(false);
            if !stamped {
                let attempts = load_recovery(&wpaths, id)?.map(|m| m.attempts).unwrap_or(0);
                let max_attempts = max_recovery_attempts();
                if attempts >= max_attempts {
                    return Err(LumenError::RecoveryLoop {
                        wu_id: id,
                        attempts,
                        max_attempts,
                    });
                }
                let marker = increment_recovery(&wpaths, id)?;
                log::warn!(
                    "{id}: zombie completion detected; recovery attempt {} of {max_attempts}",
                    marker.attempts
                );
                prepare_recovery_with_squash(&wrepo, id)?;

                let wu = &mut normalized.wu;
                wu.status = WuStatus::InProgress;
                wu.locked = false;
                wu.completed_at = None;
                wu.completed = None;
                std::fs::write(wpaths.wu_file(id), schema::to_yaml(wu)?).map_err(|e| {
                    LumenError::validation(Some(id), format!("reset worktree YAML: {e}"))
                })?;
            }
        }

        // Phase 2: transition check
        assert_transition(normalized.wu.status, WuStatus::Done, id)?;

        // Phase 3: main-sync guard, before any file writes
        validate_main_not_behind_origin(self.repo)?;

        // Phase 4: validations ahead of the transaction
        if normalized.changed {
            std::fs::write(wpaths.wu_file(id), schema::to_yaml(&normalized.wu)?).map_err(
                |e| LumenError::validation(Some(id), format!("rewrite normalised YAML: {e}")),
            )?;
        }
        schema::validate_done(&normalized.wu)?;
        validate_code_paths_committed(&wrepo, &normalized.wu)?;

        // Phase 5: collect the metadata writes
        let now = utils::now_datetime();
        let mut wu = normalized.wu.clone();
        wu.status = WuStatus::Done;
        wu.locked = true;
        wu.completed_at = Some(now);
        wu.completed = Some(now.date_naive());

        let mut tx = WuTransaction::new();
        let mut allowlist: Vec<String> = Vec::new();

        let yaml = schema::to_yaml(&wu)?;
        tx.add_write(wpaths.wu_file(id), Some(yaml.clone()), "WU YAML")?;
        allowlist.push(wpaths.wu_file_rel(id));

        for (file, rel) in [
            (wpaths.status_file(), wpaths.status_file_rel()),
            (wpaths.backlog_file(), wpaths.backlog_file_rel()),
        ] {
            let content = std::fs::read_to_string(&file).unwrap_or_default();
            let (content, _) = remove_wu_from_section(&content, IN_PROGRESS_SECTION, id);
            let (content, _) = append_wu_to_section(&content, DONE_SECTION, &wu_line(&wu), id);
            tx.add_write(file, Some(content), "summary markdown")?;
            allowlist.push(rel);
        }

        tx.add_write(
            wpaths.stamp_file(id),
            Some(stamp_content(id, &wu.title, now.date_naive())),
            "completion stamp",
        )?;
        allowlist.push(wpaths.stamp_file_rel(id));

        let events_path = wpaths.events_file();
        let mut events_raw = std::fs::read_to_string(&events_path).unwrap_or_default();
        if !events_raw.is_empty() && !events_raw.ends_with('\n') {
            events_raw.push('\n');
        }
        let complete = WuEvent::Complete {
            wu_id: id,
            timestamp: now,
        };
        events_raw.push_str(&serde_json::to_string(&complete).map_err(|e| {
            LumenError::validation(Some(id), format!("serialise complete event: {e}"))
        })?);
        events_raw.push('\n');
        tx.add_write(events_path, Some(events_raw), "event log")?;
        allowlist.push(wpaths.events_file_rel());

        let initiative_rel = collect_initiative_write(&wpaths, &wu, &mut tx)?;
        if let Some(rel) = &initiative_rel {
            allowlist.push(rel.clone());
        }

        // Phase 6: snapshot, flush, post-mutation validation
        let snapshot = create_transaction_snapshot(&tx.pending_paths())?;
        let report = tx.commit()?;
        if !report.success {
            restore_from_snapshot(&snapshot)?;
            return Err(LumenError::Transaction {
                message: report
                    .failed
                    .into_iter()
                    .map(|(p, e)| format!("{}: {e}", p.display()))
                    .collect::<Vec<_>>()
                    .join("; "),
                restored: true,
            });
        }
        if let Err(e) = validate_post_mutation(&wpaths, id) {
            restore_from_snapshot(&snapshot)?;
            return Err(LumenError::Transaction {
                message: format!("post-mutation validation failed: {e}"),
                restored: true,
            });
        }

        // Phases 7-8: git mutation in the worktree, then integration by
        // mode. Any failure rolls the branch back to the pre-commit SHA and
        // restores the snapshot so a retry starts clean.
        let pre_commit_sha = wrepo.commit_hash("HEAD")?;
        let branch = wu
            .claimed_branch
            .clone()
            .unwrap_or_else(|| lane_branch(&wu.lane, id));

        let merge_result = (|| -> Result<MergeOutcome> {
            wrepo.add_with_deletions(&allowlist)?;
            validate_staged_files(&wrepo, &allowlist)?;

            squash_previous_completion_attempts(&wrepo, id)?;
            assert_no_conflict_artifacts_in_index(&wrepo)?;

            let defaults = crate::config::EngineDefaults::default();
            let subject = utils::truncate_subject(
                &format!("wu({id}): done - {}", wu.title),
                defaults.max_commit_subject,
            );
            wrepo.commit(&subject)?;

            match wu.claimed_mode.unwrap_or(ClaimedMode::Worktree) {
                ClaimedMode::Worktree | ClaimedMode::BranchOnly => {
                    integrate_lane_branch(self.repo, self.paths, id, &branch, opts.auto_rebase)
                }
                ClaimedMode::BranchPr => push_and_open_pr(&wrepo, id, &branch, &wu.title),
            }
        })();
        let merge: MergeOutcome = match merge_result {
            Ok(outcome) => outcome,
            Err(err) => {
                log::warn!("{id}: completion git phase failed; rolling back");
                if let Err(rollback) = wrepo.reset_hard(&pre_commit_sha) {
                    log::warn!("{id}: rollback to {pre_commit_sha} failed: {rollback}");
                }
                if let Err(restore) = restore_from_snapshot(&snapshot) {
                    log::warn!("{id}: snapshot restore failed: {restore}");
                }
                return Err(err);
            }
        };

        // Phase 9: post-success bookkeeping, all best-effort
        clear_recovery_attempts(&wpaths, id)?;
        let signal = self.bus.create_signal(NewSignal {
            message: format!("{id} completed in lane '{}'", wu.lane),
            wu_id: Some(id),
            lane: Some(wu.lane.clone()),
            kind: Some("completion".to_string()),
            sender: Some("wu:done".to_string()),
            ..Default::default()
        });
        if let Err(e) = signal {
            log::warn!("{id}: completion signal not emitted: {e}");
        }
        push_events(
            self.sink,
            &[ControlPlaneEvent::new(ControlPlaneEventKind::TaskCompleted, id)
                .with_lane(wu.lane.clone())
                .with_spec_hash(yaml.as_bytes())],
        );

        Ok(CompletionOutcome {
            success: true,
            committed: true,
            pushed: merge.pushed,
            merged: merge.merged,
            pr_url: merge.pr_url,
            cleanup_safe: true,
        })
    }
}

/// Fail when local main is behind origin/main. Fail-open only when the fetch
/// itself errors (no remote, offline).
pub fn validate_main_not_behind_origin(repo: &Repository) -> Result<()> {
    if let Err(e) = repo.fetch("origin", "main") {
        log::warn!("main-sync guard skipped, fetch failed: {e}");
        return Ok(());
    }
    let local = repo.commit_hash("main")?;
    let remote = repo.commit_hash("origin/main")?;
    if local == remote {
        return Ok(());
    }
    let behind = repo.rev_list_count("main..origin/main")?;
    if behind >= 1 {
        return Err(LumenError::git_with_hint(
            format!("Local main is {behind} commit(s) behind origin/main"),
            vec!["git pull origin main".to_string()],
        ));
    }
    Ok(())
}

/// Every dirty file matching the WU's `code_paths` globs fails completion:
/// declared code must be committed before `wu:done`.
pub fn validate_code_paths_committed(
    wrepo: &Repository,
    wu: &crate::wu::WorkUnit,
) -> Result<()> {
    if wu.code_paths.is_empty() {
        return Ok(());
    }
    let mut builder = ignore::overrides::OverrideBuilder::new(wrepo.dir());
    for glob in &wu.code_paths {
        builder.add(glob).map_err(|e| {
            LumenError::validation(Some(wu.id), format!("invalid code_paths glob '{glob}': {e}"))
        })?;
    }
    let overrides = builder.build().map_err(|e| {
        LumenError::validation(Some(wu.id), format!("code_paths globs did not compile: {e}"))
    })?;

    let porcelain = wrepo.status_porcelain()?;
    let dirty: Vec<String> = porcelain
        .lines()
        .filter(|line| line.len() > 3)
        .map(|line| line[3..].trim().to_string())
        .filter(|path| overrides.matched(path, false).is_whitelist())
        .collect();

    if !dirty.is_empty() {
        return Err(LumenError::validation(
            Some(wu.id),
            format!(
                "declared code_paths have uncommitted changes: {}",
                dirty.join(", ")
            ),
        ));
    }
    Ok(())
}

/// Refuse staged paths outside the metadata allowlist (defence against
/// hook-driven scope creep).
pub fn validate_staged_files(wrepo: &Repository, allowlist: &[String]) -> Result<()> {
    let staged = wrepo.staged_paths()?;
    let allowed: std::collections::HashSet<&str> =
        allowlist.iter().map(String::as_str).collect();
    let violations: Vec<String> = staged
        .into_iter()
        .filter(|p| !allowed.contains(p.as_str()))
        .collect();
    if !violations.is_empty() {
        return Err(LumenError::ScopeViolation {
            message: "staged paths outside the completion allowlist".to_string(),
            paths: violations,
        });
    }
    Ok(())
}

/// Reject index entries carrying conflict markers.
pub fn assert_no_conflict_artifacts_in_index(wrepo: &Repository) -> Result<()> {
    let mut tainted = Vec::new();
    for path in wrepo.staged_paths()? {
        let Ok(content) = wrepo.run_command(&["show", &format!(":{path}")]) else {
            continue;
        };
        if content.lines().any(|l| {
            l.starts_with("<<<<<<< ") || l.starts_with(">>>>>>> ") || l == "======="
        }) {
            tainted.push(path);
        }
    }
    if !tainted.is_empty() {
        return Err(LumenError::git(format!(
            "conflict markers staged in: {}",
            tainted.join(", ")
        )));
    }
    Ok(())
}

/// Post-mutation checks: the flushed files must reflect a completed WU.
fn validate_post_mutation(wpaths: &RepoPaths, id: WuId) -> Result<()> {
    let normalized = schema::load_work_unit(&wpaths.wu_file(id))?;
    if normalized.wu.status != WuStatus::Done || !normalized.wu.locked {
        return Err(LumenError::validation(
            Some(id),
            "YAML is not done/locked after the transaction",
        ));
    }
    if normalized.wu.completed_at.is_none() {
        return Err(LumenError::validation(Some(id), "completed_at missing after the transaction"));
    }
    if !wpaths.stamp_file(id).is_file() {
        return Err(LumenError::not_found("stamp file", Some(wpaths.stamp_file(id))));
    }
    let store = EventStore::at_path(wpaths.events_file());
    if store.derive_status(id)? != Some(WuStatus::Done) {
        return Err(LumenError::validation(
            Some(id),
            "event log does not derive to done after the transaction",
        ));
    }
    Ok(())
}

/// Queue an update to the initiative YAML when the WU belongs to one and the
/// file exists: the WU id is appended to the initiative's `delivered` list.
fn collect_initiative_write(
    wpaths: &RepoPaths,
    wu: &crate::wu::WorkUnit,
    tx: &mut WuTransaction,
) -> Result<Option<String>> {
    let Some(name) = &wu.initiative else {
        return Ok(None);
    };
    let rel = format!("initiatives/{}.yaml", kebab(name));
    let path: PathBuf = wpaths.root().join(&rel);
    let raw = match std::fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(LumenError::validation(
                Some(wu.id),
                format!("read {}: {e}", path.display()),
            ));
        }
    };
    let mut doc: serde_yaml::Value = serde_yaml::from_str(&raw)
        .map_err(|e| LumenError::validation(Some(wu.id), format!("invalid initiative YAML: {e}")))?;
    let map = doc.as_mapping_mut().ok_or_else(|| {
        LumenError::validation(Some(wu.id), "initiative YAML is not a mapping")
    })?;

    let key = serde_yaml::Value::String("delivered".to_string());
    if !map.contains_key(&key) {
        map.insert(key.clone(), serde_yaml::Value::Sequence(Vec::new()));
    }
    let Some(seq) = map.get_mut(&key).and_then(|v| v.as_sequence_mut()) else {
        return Err(LumenError::validation(
            Some(wu.id),
            "initiative 'delivered' is not a list",
        ));
    };
    let id_value = serde_yaml::Value::String(wu.id.to_string());
    if !seq.contains(&id_value) {
        seq.push(id_value);
    }

    let updated = serde_yaml::to_string(&doc)
        .map_err(|e| LumenError::validation(Some(wu.id), format!("serialise initiative: {e}")))?;
    tx.add_write(path, Some(updated), "initiative YAML")?;
    Ok(Some(rel))
}
