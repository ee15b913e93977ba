//! Engine error taxonomy.
//!
//! Every engine-level failure is one of a closed set of kinds. Variants carry
//! structured context (WU id, offending paths, attempt counts) so callers,
//! CLI handlers and agents alike, can react without parsing messages, and
//! each kind maps to a default list of `try_next` shell commands surfaced to
//! the user.

use std::fmt;
use std::path::PathBuf;

use crate::git::GitError;
use crate::wu::{WuId, WuStatus};

/// Closed classification of engine failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    ValidationError,
    InvalidStateTransition,
    TransactionError,
    GitError,
    RecoveryLoop,
    ScopeViolation,
    NotFound,
    CancelledByUser,
}

#[derive(Debug)]
pub enum LumenError {
    /// Schema or completeness validation failed.
    Validation {
        wu_id: Option<WuId>,
        message: String,
    },
    /// The state machine refused a transition.
    InvalidStateTransition {
        wu_id: WuId,
        from: WuStatus,
        to: WuStatus,
    },
    /// Transaction validate/commit or post-mutation validation failed.
    ///
    /// `restored` is true when the snapshot rollback ran and the pre-transaction
    /// bytes are back on disk.
    Transaction {
        message: String,
        restored: bool,
    },
    /// A git operation failed in a way the retry strategy could not absorb.
    Git {
        message: String,
        try_next: Vec<String>,
    },
    /// Zombie recovery exceeded its attempt budget; manual intervention needed.
    RecoveryLoop {
        wu_id: WuId,
        attempts: u32,
        max_attempts: u32,
    },
    /// A path escaped the worktree or the staged-files allowlist.
    ScopeViolation {
        paths: Vec<String>,
        message: String,
    },
    /// A WU YAML or stamp was absent where the engine expected it.
    NotFound {
        what: String,
        path: Option<PathBuf>,
    },
    /// An interactive prompt was cancelled.
    CancelledByUser,
}

impl LumenError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LumenError::Validation { .. } => ErrorKind::ValidationError,
            LumenError::InvalidStateTransition { .. } => ErrorKind::InvalidStateTransition,
            LumenError::Transaction { .. } => ErrorKind::TransactionError,
            LumenError::Git { .. } => ErrorKind::GitError,
            LumenError::RecoveryLoop { .. } => ErrorKind::RecoveryLoop,
            LumenError::ScopeViolation { .. } => ErrorKind::ScopeViolation,
            LumenError::NotFound { .. } => ErrorKind::NotFound,
            LumenError::CancelledByUser => ErrorKind::CancelledByUser,
        }
    }

    /// Shorthand for a validation failure tied to a WU.
    pub fn validation(wu_id: impl Into<Option<WuId>>, message: impl Into<String>) -> Self {
        LumenError::Validation {
            wu_id: wu_id.into(),
            message: message.into(),
        }
    }

    pub fn git(message: impl Into<String>) -> Self {
        LumenError::Git {
            message: message.into(),
            try_next: Vec::new(),
        }
    }

    pub fn git_with_hint(message: impl Into<String>, try_next: Vec<String>) -> Self {
        LumenError::Git {
            message: message.into(),
            try_next,
        }
    }

    pub fn not_found(what: impl Into<String>, path: Option<PathBuf>) -> Self {
        LumenError::NotFound {
            what: what.into(),
            path,
        }
    }

    /// Actionable shell commands for the user, most likely fix first.
    pub fn try_next(&self) -> Vec<String> {
        match self {
            LumenError::Git { try_next, .. } if !try_next.is_empty() => try_next.clone(),
            LumenError::RecoveryLoop { wu_id, .. } => vec![
                format!("git log --oneline origin/main -- operations/stamps/{wu_id}.done"),
                format!("lf wu:recover {wu_id} --manual"),
            ],
            LumenError::ScopeViolation { .. } => {
                vec!["git restore --staged <path-outside-allowlist>".to_string()]
            }
            _ => Vec::new(),
        }
    }
}

impl fmt::Display for LumenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LumenError::Validation { wu_id, message } => match wu_id {
                Some(id) => write!(f, "{id}: {message}"),
                None => write!(f, "{message}"),
            },
            LumenError::InvalidStateTransition { wu_id, from, to } => {
                write!(f, "{wu_id}: invalid transition {from} -> {to}")
            }
            LumenError::Transaction { message, restored } => {
                if *restored {
                    write!(f, "transaction failed (files restored): {message}")
                } else {
                    write!(f, "transaction failed: {message}")
                }
            }
            LumenError::Git { message, .. } => write!(f, "{message}"),
            LumenError::RecoveryLoop {
                wu_id,
                attempts,
                max_attempts,
            } => write!(
                f,
                "{wu_id}: zombie recovery attempted {attempts} time(s), max {max_attempts}; manual intervention required"
            ),
            LumenError::ScopeViolation { paths, message } => {
                write!(f, "{message}")?;
                for p in paths {
                    write!(f, "\n  {p}")?;
                }
                Ok(())
            }
            LumenError::NotFound { what, path } => match path {
                Some(p) => write!(f, "{what} not found at {}", p.display()),
                None => write!(f, "{what} not found"),
            },
            LumenError::CancelledByUser => write!(f, "cancelled"),
        }
    }
}

impl std::error::Error for LumenError {}

impl From<GitError> for LumenError {
    fn from(e: GitError) -> Self {
        LumenError::Git {
            message: e.to_string(),
            try_next: Vec::new(),
        }
    }
}

pub type Result<T> = std::result::Result<T, LumenError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_stable() {
        assert_eq!(
            LumenError::CancelledByUser.kind().to_string(),
            "CANCELLED_BY_USER"
        );
        assert_eq!(
            LumenError::git("push rejected").kind().to_string(),
            "GIT_ERROR"
        );
    }

    #[test]
    fn transition_error_message_names_both_states() {
        let err = LumenError::InvalidStateTransition {
            wu_id: WuId::new(7).unwrap(),
            from: WuStatus::Done,
            to: WuStatus::InProgress,
        };
        let msg = err.to_string();
        assert!(msg.contains("WU-7"));
        assert!(msg.contains("done"));
        assert!(msg.contains("in_progress"));
    }

    #[test]
    fn git_hints_pass_through() {
        let err = LumenError::git_with_hint(
            "Local main is 1 commit(s) behind origin/main",
            vec!["git pull origin main".to_string()],
        );
        assert_eq!(err.try_next(), vec!["git pull origin main".to_string()]);
    }

    #[test]
    fn recovery_loop_has_manual_hint() {
        let err = LumenError::RecoveryLoop {
            wu_id: WuId::new(3).unwrap(),
            attempts: 5,
            max_attempts: 5,
        };
        assert!(!err.try_next().is_empty());
    }
}
