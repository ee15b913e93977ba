//! Zombie recovery.
//!
//! A zombie is a WU whose worktree YAML says `done` but whose completion
//! commit never reached `main` (no stamp on `origin/main`): the previous
//! `wu:done` died between the metadata commit and the push. Recovery squashes
//! the stale completion commits, resets the YAML to `in_progress`, and lets
//! completion run again. A per-WU marker file bounds the attempts so a
//! persistently failing WU escalates to a human instead of looping.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{LumenError, Result};
use crate::git::Repository;
use crate::paths::RepoPaths;
use crate::retry::RetryPreset;
use crate::utils;
use crate::wu::WuId;

/// `<stateDir>/recovery/<WU-N>.recovery`: attempt counter for in-flight
/// recovery. Absent when no recovery is in flight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryMarker {
    pub attempts: u32,
    pub last_attempt: DateTime<Utc>,
}

/// Maximum recovery attempts before manual intervention, from the recovery
/// retry preset (clamped into the sane band).
pub fn max_recovery_attempts() -> u32 {
    RetryPreset::Recovery.config().max_attempts.clamp(2, 10)
}

pub fn load_recovery(paths: &RepoPaths, id: WuId) -> Result<Option<RecoveryMarker>> {
    let path = paths.recovery_file(id);
    let raw = match std::fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(LumenError::validation(
                Some(id),
                format!("read {}: {e}", path.display()),
            ));
        }
    };
    let marker = serde_json::from_str(&raw).map_err(|e| {
        LumenError::validation(Some(id), format!("invalid recovery marker: {e}"))
    })?;
    Ok(Some(marker))
}

/// Read-modify-write increment of the attempt counter.
pub fn increment_recovery(paths: &RepoPaths, id: WuId) -> Result<RecoveryMarker> {
    let previous = load_recovery(paths, id)?.map(|m| m.attempts).unwrap_or(0);
    let marker = RecoveryMarker {
        attempts: previous + 1,
        last_attempt: utils::now_datetime(),
    };
    let path = paths.recovery_file(id);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            LumenError::validation(Some(id), format!("create {}: {e}", parent.display()))
        })?;
    }
    let json = serde_json::to_string(&marker)
        .map_err(|e| LumenError::validation(Some(id), format!("serialise recovery marker: {e}")))?;
    std::fs::write(&path, json).map_err(|e| {
        LumenError::validation(Some(id), format!("write {}: {e}", path.display()))
    })?;
    Ok(marker)
}

/// Remove the marker after a successful completion. Tolerates absence.
pub fn clear_recovery_attempts(paths: &RepoPaths, id: WuId) -> Result<()> {
    match std::fs::remove_file(paths.recovery_file(id)) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(LumenError::validation(
            Some(id),
            format!("remove recovery marker: {e}"),
        )),
    }
}

/// The subject prefix every completion commit for this WU carries.
pub fn completion_subject_prefix(id: WuId) -> String {
    format!("wu({id}): done")
}

/// Count the completion-attempt commits sitting on top of the lane branch
/// (consecutive from HEAD, above `origin/main`).
pub fn count_previous_completion_attempts(repo: &Repository, id: WuId) -> Result<u32> {
    let subjects = repo.rev_list_subjects("origin/main..HEAD")?;
    let prefix = completion_subject_prefix(id);
    Ok(subjects
        .iter()
        .take_while(|s| s.starts_with(&prefix))
        .count() as u32)
}

/// Collapse the stale completion commits: soft-reset past them so their
/// metadata changes return to the index and the next completion commit is
/// the only one representing the WU.
pub fn squash_previous_completion_attempts(repo: &Repository, id: WuId) -> Result<u32> {
    let count = count_previous_completion_attempts(repo, id)?;
    if count > 0 {
        log::debug!("{id}: squashing {count} previous completion attempt(s)");
        repo.reset_soft(&format!("HEAD~{count}"))?;
    }
    Ok(count)
}

/// Recovery preparation inside the WU worktree: drop the stale completion
/// commits so the retried completion produces a single one.
pub fn prepare_recovery_with_squash(worktree_repo: &Repository, id: WuId) -> Result<u32> {
    squash_previous_completion_attempts(worktree_repo, id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marker_round_trip_camel_case() {
        let marker = RecoveryMarker {
            attempts: 2,
            last_attempt: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
        };
        let json = serde_json::to_string(&marker).unwrap();
        assert!(json.contains(r#""attempts":2"#));
        assert!(json.contains(r#""lastAttempt":"#));
        let back: RecoveryMarker = serde_json::from_str(&json).unwrap();
        assert_eq!(back, marker);
    }

    #[test]
    fn increment_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let paths = RepoPaths::new(dir.path());
        let id = WuId::new(7).unwrap();

        assert!(load_recovery(&paths, id).unwrap().is_none());
        let first = increment_recovery(&paths, id).unwrap();
        assert_eq!(first.attempts, 1);
        let second = increment_recovery(&paths, id).unwrap();
        assert_eq!(second.attempts, 2);
        assert_eq!(load_recovery(&paths, id).unwrap().unwrap().attempts, 2);

        clear_recovery_attempts(&paths, id).unwrap();
        assert!(load_recovery(&paths, id).unwrap().is_none());
        // Clearing twice is fine
        clear_recovery_attempts(&paths, id).unwrap();
    }

    #[test]
    fn max_attempts_is_in_the_sane_band() {
        let max = max_recovery_attempts();
        assert!((2..=10).contains(&max));
    }

    #[test]
    fn corrupt_marker_is_an_error_not_a_reset() {
        let dir = tempfile::tempdir().unwrap();
        let paths = RepoPaths::new(dir.path());
        let id = WuId::new(7).unwrap();
        std::fs::create_dir_all(paths.recovery_dir()).unwrap();
        std::fs::write(paths.recovery_file(id), "{not json").unwrap();
        assert!(load_recovery(&paths, id).is_err());
    }

    #[test]
    fn subject_prefix_matches_commit_format() {
        let id = WuId::new(42).unwrap();
        assert_eq!(completion_subject_prefix(id), "wu(WU-42): done");
        assert!("wu(WU-42): done - Ship it".starts_with(&completion_subject_prefix(id)));
        assert!(!"wu(WU-421): done - other".starts_with(&completion_subject_prefix(WuId::new(42).unwrap())));
    }
}
