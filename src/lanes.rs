//! Lane lifecycle and occupancy.
//!
//! A lane is a named serialisation domain: under the default WIP policy it
//! holds one active WU at a time. Lifecycle is classified deterministically
//! from on-disk artifacts (`lumenflow.yaml` definitions plus the inference
//! file); delivery WU creation requires `locked`, initiative creation is
//! allowed from any state. Occupancy is enforced at claim time.

use std::path::PathBuf;

use crate::config::{LaneLifecycle, LaneLifecycleRecord, LumenflowConfig};
use crate::error::{LumenError, Result};
use crate::git::Repository;
use crate::paths::RepoPaths;
use crate::utils;
use crate::wu::{WuId, WuStatus, schema};

/// Classification of the repo's lane configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaneClassification {
    pub status: LaneLifecycle,
    pub reason: String,
}

/// Path of the lane inference artifact.
pub fn inference_file(paths: &RepoPaths) -> PathBuf {
    paths.root().join(".lumenflow/lane-inference.yaml")
}

/// Classify the lane lifecycle from on-disk artifacts.
///
/// - no config or no definitions: `unconfigured`
/// - definitions but missing/unparseable inference, or an explicit draft
///   marker: `draft`
/// - definitions + parseable inference: `locked`
pub fn classify_lanes(paths: &RepoPaths) -> Result<LaneClassification> {
    let Some(config) = LumenflowConfig::load(paths)? else {
        return Ok(LaneClassification {
            status: LaneLifecycle::Unconfigured,
            reason: "lumenflow.yaml absent".to_string(),
        });
    };
    if config.lanes.definitions.is_empty() {
        return Ok(LaneClassification {
            status: LaneLifecycle::Unconfigured,
            reason: "no lane definitions".to_string(),
        });
    }

    if let Some(record) = &config.lanes.lifecycle {
        if record.status == LaneLifecycle::Draft {
            return Ok(LaneClassification {
                status: LaneLifecycle::Draft,
                reason: "explicitly marked draft".to_string(),
            });
        }
    }

    let inference = inference_file(paths);
    match std::fs::read_to_string(&inference) {
        Ok(raw) => {
            if serde_yaml::from_str::<serde_yaml::Value>(&raw).is_err() {
                return Ok(LaneClassification {
                    status: LaneLifecycle::Draft,
                    reason: "lane inference unparseable".to_string(),
                });
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(LaneClassification {
                status: LaneLifecycle::Draft,
                reason: "lane inference missing".to_string(),
            });
        }
        Err(e) => {
            return Err(LumenError::validation(
                None,
                format!("read {}: {e}", inference.display()),
            ));
        }
    }

    Ok(LaneClassification {
        status: LaneLifecycle::Locked,
        reason: "definitions and inference present".to_string(),
    })
}

/// Persist a classification into `lumenflow.yaml`.
///
/// `inferred` marks classifications the engine derived (rather than the user
/// declared); those also record `migrated_at` and the reason.
pub fn persist_lifecycle(
    paths: &RepoPaths,
    classification: &LaneClassification,
    inferred: bool,
) -> Result<()> {
    let mut config = LumenflowConfig::load(paths)?.unwrap_or_default();
    let now = utils::now_datetime();
    let record = LaneLifecycleRecord {
        status: classification.status,
        updated_at: Some(now),
        migrated_at: inferred.then_some(now),
        migration_reason: inferred.then(|| classification.reason.clone()),
    };
    config.lanes.lifecycle = Some(record);
    config.save(paths)
}

/// Gate for WU creation: delivery WUs require `locked` lanes; initiatives are
/// allowed from any state.
pub fn ensure_creation_allowed(classification: &LaneClassification, is_initiative: bool) -> Result<()> {
    if is_initiative || classification.status == LaneLifecycle::Locked {
        return Ok(());
    }
    Err(LumenError::validation(
        None,
        format!(
            "delivery WU creation requires locked lanes; lanes are {} ({})",
            classification.status, classification.reason
        ),
    ))
}

/// Whether a worktree exists for the WU, matched on a word boundary.
///
/// `WU-204` never matches a `wu-2049` worktree: both the directory name and
/// the checked-out branch are tested with `\bwu-<n>\b`.
pub fn check_worktree_exists(repo: &Repository, id: WuId) -> Result<bool> {
    let pattern = regex::Regex::new(&format!(r"(?i)\b{}\b", regex::escape(&id.lower())))
        .expect("worktree id regex");
    for wt in repo.worktrees()? {
        let dir_name = wt
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if pattern.is_match(&dir_name) {
            return Ok(true);
        }
        if let Some(branch) = &wt.branch {
            if pattern.is_match(branch) {
                return Ok(true);
            }
        }
    }
    Ok(false)
}

/// A WU occupying the lane and blocking a claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaneOccupant {
    /// A done WU whose worktree or branch is still around; run consistency
    /// repair first.
    LingeringDone { wu_id: WuId },
    /// A live WU holds the lane under the WIP policy.
    Active { wu_id: WuId, status: WuStatus },
}

/// Enforce lane occupancy before a claim.
///
/// Scans sibling WU YAML files for (a) done WUs in the lane whose
/// worktree/branch still exists (refuse until cleaned) and (b) active WUs
/// exceeding the lane's WIP limit (default 1).
pub fn check_lane_occupancy(
    repo: &Repository,
    paths: &RepoPaths,
    lane: &str,
    claiming: WuId,
) -> Result<()> {
    let config = LumenflowConfig::load(paths)?;
    let wip_limit = config
        .as_ref()
        .and_then(|c| c.lane(lane))
        .and_then(|l| l.wip_limit)
        .unwrap_or(1) as usize;

    let mut active: Vec<LaneOccupant> = Vec::new();

    let entries = match std::fs::read_dir(paths.wu_dir()) {
        Ok(iter) => iter,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => {
            return Err(LumenError::validation(
                None,
                format!("read {}: {e}", paths.wu_dir().display()),
            ));
        }
    };

    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("yaml") {
            continue;
        }
        let Ok(normalized) = schema::load_work_unit(&path) else {
            continue;
        };
        let wu = normalized.wu;
        if wu.lane != lane || wu.id == claiming {
            continue;
        }
        match wu.status {
            WuStatus::Done if check_worktree_exists(repo, wu.id)? => {
                return Err(LumenError::validation(
                    Some(claiming),
                    format!(
                        "lane '{lane}' blocked: {} is done but its worktree/branch lingers; run consistency repair",
                        wu.id
                    ),
                ));
            }
            status if status.is_active() => {
                active.push(LaneOccupant::Active {
                    wu_id: wu.id,
                    status,
                });
            }
            _ => {}
        }
    }

    if active.len() >= wip_limit {
        let holders = active
            .iter()
            .map(|o| match o {
                LaneOccupant::Active { wu_id, status } => format!("{wu_id} ({status})"),
                LaneOccupant::LingeringDone { wu_id } => wu_id.to_string(),
            })
            .collect::<Vec<_>>()
            .join(", ");
        return Err(LumenError::validation(
            Some(claiming),
            format!("lane '{lane}' at WIP limit {wip_limit}: held by {holders}"),
        ));
    }

    Ok(())
}
