//! Engine operations: create, claim, release.
//!
//! These are the engine halves of the corresponding CLI commands. Every
//! repo-level mutation goes through the spec-branch protocol or a push-only
//! micro-worktree; the user's main checkout is only ever fast-forwarded.

use std::path::Path;

use crate::config::LaneLifecycle;
use crate::error::{LumenError, Result};
use crate::git::micro::{MicroWorktreeSpec, with_micro_worktree};
use crate::git::Repository;
use crate::lanes::{check_lane_occupancy, classify_lanes, ensure_creation_allowed};
use crate::paths::{RepoPaths, lane_branch};
use crate::signals::{NewSignal, SignalBus};
use crate::sink::{ControlPlaneEvent, ControlPlaneEventKind, EventSink, push_events};
use crate::spec_branch::{WuSource, delete_spec_branch, merge_spec_branch_to_main, publish_wu_spec, wu_source};
use crate::utils;
use crate::wu::state::assert_transition;
use crate::wu::store::{EventStore, WuEvent};
use crate::wu::{ClaimedMode, WuId, WuStatus, schema};

/// Shared collaborators for the engine operations.
pub struct Engine<'a> {
    pub repo: &'a Repository,
    pub paths: &'a RepoPaths,
    pub bus: &'a SignalBus,
    pub sink: &'a dyn EventSink,
}

/// Result of a claim: where the work now lives.
#[derive(Debug)]
pub struct ClaimOutcome {
    pub branch: String,
    pub worktree_path: std::path::PathBuf,
}

impl Engine<'_> {
    /// `wu:create`: validate a new WU document and publish it on
    /// `spec/wu-<n>` without touching main.
    ///
    /// Delivery WUs require locked lanes; initiative documents may be
    /// created from any lane state.
    pub fn create_wu(&self, yaml: &str) -> Result<WuId> {
        let normalized = schema::validate_and_normalize(yaml)?;
        let wu = &normalized.wu;
        if wu.status != WuStatus::Ready {
            return Err(LumenError::validation(
                Some(wu.id),
                format!("new WUs start ready, found {}", wu.status),
            ));
        }

        let classification = classify_lanes(self.paths)?;
        ensure_creation_allowed(&classification, wu.initiative.is_some())?;
        if classification.status == LaneLifecycle::Locked
            && crate::config::LumenflowConfig::load(self.paths)?
                .is_some_and(|c| c.lane(&wu.lane).is_none())
        {
            return Err(LumenError::validation(
                Some(wu.id),
                format!("lane '{}' is not defined in lumenflow.yaml", wu.lane),
            ));
        }

        match wu_source(self.repo, self.paths, wu.id)? {
            WuSource::NotFound => {}
            source => {
                return Err(LumenError::validation(
                    Some(wu.id),
                    format!("{} already exists (source: {source})", wu.id),
                ));
            }
        }

        let canonical = schema::to_yaml(wu)?;
        publish_wu_spec(self.repo, self.paths, wu.id, &canonical, "origin/main")?;

        push_events(
            self.sink,
            &[ControlPlaneEvent::new(ControlPlaneEventKind::TaskCreated, wu.id)
                .with_lane(wu.lane.clone())
                .with_spec_hash(canonical.as_bytes())],
        );
        Ok(wu.id)
    }

    /// `wu:claim`: take a ready WU into a lane worktree.
    ///
    /// Resolves the spec source (fast-forwarding the spec branch into main
    /// when needed), enforces lane occupancy, records the claim on main via
    /// a push-only micro-worktree, then creates the lane branch and
    /// worktree.
    pub fn claim_wu(&self, id: WuId) -> Result<ClaimOutcome> {
        match wu_source(self.repo, self.paths, id)? {
            WuSource::NotFound => {
                return Err(LumenError::not_found(
                    format!("{id} spec"),
                    Some(self.paths.wu_file(id)),
                ));
            }
            WuSource::SpecBranch => {
                merge_spec_branch_to_main(self.repo, id)?;
                self.repo.push("origin", "main")?;
                delete_spec_branch(self.repo, id);
            }
            // When both exist, main's copy wins; the spec branch is left to
            // claim-time garbage collection
            WuSource::Main | WuSource::Both => {}
        }

        let normalized = schema::load_work_unit(&self.paths.wu_file(id))?;
        let wu = normalized.wu;
        assert_transition(wu.status, WuStatus::InProgress, id)?;
        check_lane_occupancy(self.repo, self.paths, &wu.lane, id)?;

        let branch = lane_branch(&wu.lane, id);
        if self.repo.branch_exists(&branch)? {
            return Err(LumenError::validation(
                Some(id),
                format!("lane branch {branch} already exists; release or repair first"),
            ));
        }
        let worktree_path = self.paths.worktree_path(&wu.lane, id);
        if worktree_path.exists() {
            return Err(LumenError::validation(
                Some(id),
                format!("worktree path {} already exists", worktree_path.display()),
            ));
        }

        // Record the claim on main: YAML fields plus the claim event
        let spec = MicroWorktreeSpec {
            operation: "wu-claim",
            wu_id: id,
            lane_branch: None,
            base_ref: "origin/main",
            push_only: true,
        };
        let yaml_rel = self.paths.wu_file_rel(id);
        let events_rel = self.paths.events_file_rel();
        let wu_for_claim = wu.clone();
        let branch_for_claim = branch.clone();
        let worktree_for_claim = worktree_path.clone();
        let paths_for_micro = self.paths.clone();
        with_micro_worktree(
            self.repo,
            &spec,
            &format!("wu({id}): claim"),
            move |micro_root| {
                let wpaths = paths_for_micro.rebase(micro_root);
                let mut claimed = schema::load_work_unit(&wpaths.wu_file(id))?.wu;
                claimed.status = WuStatus::InProgress;
                claimed.claimed_branch = Some(branch_for_claim);
                claimed.claimed_mode = Some(ClaimedMode::Worktree);
                claimed.worktree_path = Some(worktree_for_claim);
                std::fs::write(wpaths.wu_file(id), schema::to_yaml(&claimed)?).map_err(|e| {
                    LumenError::validation(Some(id), format!("write claimed YAML: {e}"))
                })?;

                let store = EventStore::at_path(wpaths.events_file());
                store.append(&WuEvent::Claim {
                    wu_id: id,
                    timestamp: utils::now_datetime(),
                    lane: wu_for_claim.lane.clone(),
                    title: wu_for_claim.title.clone(),
                })?;

                Ok(vec![yaml_rel, events_rel])
            },
            None,
        )?;

        // Bring the local main checkout up to the claim commit
        self.repo.fetch("origin", "main")?;
        if let Err(e) = self.repo.merge("origin/main", true) {
            log::warn!("local main not fast-forwarded after claim: {e}");
        }

        if let Some(parent) = worktree_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                LumenError::validation(Some(id), format!("create {}: {e}", parent.display()))
            })?;
        }
        self.repo.create_branch_no_checkout(&branch, "origin/main")?;
        self.repo.worktree_add_existing(&worktree_path, &branch)?;

        let _ = self.bus.create_signal(NewSignal {
            message: format!("{id} claimed in lane '{}'", wu.lane),
            wu_id: Some(id),
            lane: Some(wu.lane.clone()),
            kind: Some("claim".to_string()),
            sender: Some("wu:claim".to_string()),
            ..Default::default()
        });
        push_events(
            self.sink,
            &[ControlPlaneEvent::new(ControlPlaneEventKind::TaskClaimed, id)
                .with_lane(wu.lane.clone())],
        );

        Ok(ClaimOutcome {
            branch,
            worktree_path,
        })
    }

    /// `wu:release`: abandon a claim. YAML back to ready, claim fields
    /// cleared, worktree and branch removed.
    ///
    /// Guarded like the orphan-worktree repair: the caller's cwd must be
    /// outside the worktree and the worktree must be clean.
    pub fn release_wu(&self, id: WuId, cwd: &Path) -> Result<()> {
        let normalized = schema::load_work_unit(&self.paths.wu_file(id))?;
        let wu = normalized.wu;
        assert_transition(wu.status, WuStatus::Ready, id)?;

        let branch = wu
            .claimed_branch
            .clone()
            .unwrap_or_else(|| lane_branch(&wu.lane, id));

        if let Some(worktree) = &wu.worktree_path {
            if worktree.exists() {
                let canon_cwd = dunce::canonicalize(cwd).unwrap_or_else(|_| cwd.to_path_buf());
                let canon_wt =
                    dunce::canonicalize(worktree).unwrap_or_else(|_| worktree.clone());
                if canon_cwd.starts_with(&canon_wt) {
                    return Err(LumenError::validation(
                        Some(id),
                        "cannot release from inside the WU worktree",
                    ));
                }
                if self.repo.worktree_at(worktree).is_dirty()? {
                    return Err(LumenError::validation(
                        Some(id),
                        "worktree has uncommitted changes; commit or discard them first",
                    ));
                }
                self.repo.worktree_remove(worktree, true)?;
            }
        }
        if self.repo.branch_exists(&branch)? {
            self.repo.delete_branch(&branch, true)?;
        }
        if let Err(e) = self.repo.delete_remote_branch("origin", &branch) {
            log::debug!("remote {branch} not deleted on release: {e}");
        }

        // Record the release on main
        let spec = MicroWorktreeSpec {
            operation: "wu-release",
            wu_id: id,
            lane_branch: None,
            base_ref: "origin/main",
            push_only: true,
        };
        let yaml_rel = self.paths.wu_file_rel(id);
        let events_rel = self.paths.events_file_rel();
        let paths_for_micro = self.paths.clone();
        with_micro_worktree(
            self.repo,
            &spec,
            &format!("wu({id}): release"),
            move |micro_root| {
                let wpaths = paths_for_micro.rebase(micro_root);
                let mut released = schema::load_work_unit(&wpaths.wu_file(id))?.wu;
                released.status = WuStatus::Ready;
                released.claimed_branch = None;
                released.claimed_mode = None;
                released.worktree_path = None;
                std::fs::write(wpaths.wu_file(id), schema::to_yaml(&released)?).map_err(|e| {
                    LumenError::validation(Some(id), format!("write released YAML: {e}"))
                })?;

                let store = EventStore::at_path(wpaths.events_file());
                store.append(&WuEvent::Release {
                    wu_id: id,
                    timestamp: utils::now_datetime(),
                })?;

                Ok(vec![yaml_rel, events_rel])
            },
            None,
        )?;

        self.repo.fetch("origin", "main")?;
        if let Err(e) = self.repo.merge("origin/main", true) {
            log::warn!("local main not fast-forwarded after release: {e}");
        }

        let _ = self.bus.create_signal(NewSignal {
            message: format!("{id} released lane '{}'", wu.lane),
            wu_id: Some(id),
            lane: Some(wu.lane),
            kind: Some("release".to_string()),
            sender: Some("wu:release".to_string()),
            ..Default::default()
        });
        Ok(())
    }
}
