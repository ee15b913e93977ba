//! Control-plane event sink.
//!
//! Completion, claim, and creation emit fire-and-forget events to an optional
//! external control plane. The sink is an opaque port: the engine calls
//! `push` and carries on regardless of the result. Every failure collapses to
//! `{sent: false, skipped_reason}`; a broken control plane must never block
//! a WU operation.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::wu::WuId;

/// Wire schema version for control-plane events.
pub const SCHEMA_VERSION: u32 = 1;

/// Kind of a control-plane event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ControlPlaneEventKind {
    TaskCreated,
    TaskClaimed,
    TaskCompleted,
}

#[derive(Debug, Clone, Serialize)]
pub struct ControlPlaneEvent {
    pub kind: ControlPlaneEventKind,
    pub schema_version: u32,
    pub wu_id: WuId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lane: Option<String>,
    pub timestamp: DateTime<Utc>,
    /// sha256 hex of the WU spec bytes, when available.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spec_hash: Option<String>,
}

impl ControlPlaneEvent {
    pub fn new(kind: ControlPlaneEventKind, wu_id: WuId) -> Self {
        Self {
            kind,
            schema_version: SCHEMA_VERSION,
            wu_id,
            lane: None,
            timestamp: crate::utils::now_datetime(),
            spec_hash: None,
        }
    }

    pub fn with_lane(mut self, lane: impl Into<String>) -> Self {
        self.lane = Some(lane.into());
        self
    }

    pub fn with_spec_hash(mut self, spec_bytes: &[u8]) -> Self {
        self.spec_hash = Some(spec_hash(spec_bytes));
        self
    }
}

/// sha256 hex digest of spec bytes.
pub fn spec_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Closed set of reasons a push was skipped or failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum SkipReason {
    WorkspaceConfigMissing,
    ControlPlaneNotConfigured,
    MissingTokenEnv,
    NoEvents,
    NoEventsAccepted,
    PushFailed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushOutcome {
    pub sent: bool,
    pub accepted: usize,
    pub skipped_reason: Option<SkipReason>,
}

impl PushOutcome {
    pub fn skipped(reason: SkipReason) -> Self {
        Self {
            sent: false,
            accepted: 0,
            skipped_reason: Some(reason),
        }
    }
}

/// Port to the external control plane.
pub trait EventSink {
    fn push(&self, events: &[ControlPlaneEvent]) -> PushOutcome;
}

/// Sink used when no control plane is configured.
#[derive(Debug, Default)]
pub struct NoopSink;

impl EventSink for NoopSink {
    fn push(&self, _events: &[ControlPlaneEvent]) -> PushOutcome {
        PushOutcome::skipped(SkipReason::ControlPlaneNotConfigured)
    }
}

/// Fail-open push wrapper: empty batches short-circuit, and the outcome is
/// logged instead of propagated.
pub fn push_events(sink: &dyn EventSink, events: &[ControlPlaneEvent]) -> PushOutcome {
    if events.is_empty() {
        return PushOutcome::skipped(SkipReason::NoEvents);
    }
    let outcome = sink.push(events);
    if !outcome.sent {
        log::debug!(
            "control-plane push skipped: {}",
            outcome
                .skipped_reason
                .map(|r| r.to_string())
                .unwrap_or_else(|| "unknown".to_string())
        );
    }
    outcome
}
