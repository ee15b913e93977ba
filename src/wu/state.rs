//! WU state machine.
//!
//! The transition table is fixed; everything else in the engine asks this
//! module before changing a status. Terminal statuses have no outgoing edges,
//! so a locked/done WU can never be resurrected by a stray command.

use crate::error::{LumenError, Result};

use super::{WuId, WuStatus};

/// Allowed transitions out of each status.
pub fn allowed_transitions(from: WuStatus) -> &'static [WuStatus] {
    use WuStatus::*;
    match from {
        Ready => &[InProgress, Waiting, Cancelled],
        // Ready is reachable back from InProgress via release
        InProgress => &[Ready, Blocked, Waiting, Done, Cancelled],
        Blocked => &[InProgress, Cancelled],
        Waiting => &[Ready, InProgress, Cancelled],
        Done => &[],
        Cancelled => &[],
    }
}

/// Whether `from -> to` is a legal transition.
pub fn is_valid_transition(from: WuStatus, to: WuStatus) -> bool {
    allowed_transitions(from).contains(&to)
}

/// Fail with [`LumenError::InvalidStateTransition`] unless `from -> to` is
/// allowed.
pub fn assert_transition(from: WuStatus, to: WuStatus, wu_id: WuId) -> Result<()> {
    if is_valid_transition(from, to) {
        Ok(())
    } else {
        Err(LumenError::InvalidStateTransition { wu_id, from, to })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn wu(n: u32) -> WuId {
        WuId::new(n).unwrap()
    }

    #[test]
    fn core_lifecycle_edges() {
        assert!(is_valid_transition(WuStatus::Ready, WuStatus::InProgress));
        assert!(is_valid_transition(WuStatus::InProgress, WuStatus::Blocked));
        assert!(is_valid_transition(WuStatus::Blocked, WuStatus::InProgress));
        assert!(is_valid_transition(WuStatus::InProgress, WuStatus::Done));
        assert!(is_valid_transition(WuStatus::InProgress, WuStatus::Cancelled));
        assert!(is_valid_transition(WuStatus::Blocked, WuStatus::Cancelled));
    }

    #[test]
    fn terminal_statuses_have_no_edges() {
        assert!(allowed_transitions(WuStatus::Done).is_empty());
        assert!(allowed_transitions(WuStatus::Cancelled).is_empty());
    }

    #[test]
    fn ready_cannot_jump_to_done() {
        let err = assert_transition(WuStatus::Ready, WuStatus::Done, wu(9)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidStateTransition);
    }

    #[test]
    fn blocked_cannot_complete_directly() {
        assert!(!is_valid_transition(WuStatus::Blocked, WuStatus::Done));
    }

    #[test]
    fn no_self_transitions() {
        for status in [
            WuStatus::Ready,
            WuStatus::InProgress,
            WuStatus::Blocked,
            WuStatus::Waiting,
            WuStatus::Done,
            WuStatus::Cancelled,
        ] {
            assert!(!is_valid_transition(status, status), "{status} -> {status}");
        }
    }
}
