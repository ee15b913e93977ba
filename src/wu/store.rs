//! Append-only WU event log with derived status.
//!
//! One JSON object per line in `<stateDir>/wu-events.jsonl`. The log is the
//! source of truth for *runtime* status; the YAML documents are the source of
//! truth for *spec*. Readers tolerate malformed lines (a half-written line
//! from a crashed agent must not poison every later read); writers only ever
//! append, which is what makes concurrent agents safe without locking.

use std::collections::BTreeSet;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{LumenError, Result};
use crate::paths::RepoPaths;
use crate::utils;

use super::{WuId, WuStatus};

/// One event in the WU log. Tagged union over `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WuEvent {
    #[serde(rename_all = "camelCase")]
    Create {
        wu_id: WuId,
        timestamp: DateTime<Utc>,
        lane: String,
        title: String,
    },
    #[serde(rename_all = "camelCase")]
    Claim {
        wu_id: WuId,
        timestamp: DateTime<Utc>,
        lane: String,
        title: String,
    },
    #[serde(rename_all = "camelCase")]
    Release {
        wu_id: WuId,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    Block {
        wu_id: WuId,
        timestamp: DateTime<Utc>,
        reason: String,
    },
    #[serde(rename_all = "camelCase")]
    Unblock {
        wu_id: WuId,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    Complete {
        wu_id: WuId,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    Checkpoint {
        wu_id: WuId,
        timestamp: DateTime<Utc>,
        note: String,
    },
    #[serde(rename_all = "camelCase")]
    Spawn {
        wu_id: WuId,
        timestamp: DateTime<Utc>,
        parent_wu_id: WuId,
        spawn_id: String,
    },
}

impl WuEvent {
    pub fn wu_id(&self) -> WuId {
        match self {
            WuEvent::Create { wu_id, .. }
            | WuEvent::Claim { wu_id, .. }
            | WuEvent::Release { wu_id, .. }
            | WuEvent::Block { wu_id, .. }
            | WuEvent::Unblock { wu_id, .. }
            | WuEvent::Complete { wu_id, .. }
            | WuEvent::Checkpoint { wu_id, .. }
            | WuEvent::Spawn { wu_id, .. } => *wu_id,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            WuEvent::Create { timestamp, .. }
            | WuEvent::Claim { timestamp, .. }
            | WuEvent::Release { timestamp, .. }
            | WuEvent::Block { timestamp, .. }
            | WuEvent::Unblock { timestamp, .. }
            | WuEvent::Complete { timestamp, .. }
            | WuEvent::Checkpoint { timestamp, .. }
            | WuEvent::Spawn { timestamp, .. } => *timestamp,
        }
    }

    /// The tag value this event serialises under.
    pub fn kind(&self) -> &'static str {
        match self {
            WuEvent::Create { .. } => "create",
            WuEvent::Claim { .. } => "claim",
            WuEvent::Release { .. } => "release",
            WuEvent::Block { .. } => "block",
            WuEvent::Unblock { .. } => "unblock",
            WuEvent::Complete { .. } => "complete",
            WuEvent::Checkpoint { .. } => "checkpoint",
            WuEvent::Spawn { .. } => "spawn",
        }
    }

    /// Status this event drives its WU into, if any. Checkpoint and spawn are
    /// informational.
    pub fn derived_status(&self) -> Option<WuStatus> {
        match self {
            WuEvent::Create { .. } | WuEvent::Claim { .. } | WuEvent::Unblock { .. } => {
                Some(WuStatus::InProgress)
            }
            WuEvent::Release { .. } => Some(WuStatus::Ready),
            WuEvent::Block { .. } => Some(WuStatus::Blocked),
            WuEvent::Complete { .. } => Some(WuStatus::Done),
            WuEvent::Checkpoint { .. } | WuEvent::Spawn { .. } => None,
        }
    }

    /// Kind-specific field validation applied before append.
    pub fn validate(&self) -> Result<()> {
        let complain = |msg: &str| Err(LumenError::validation(Some(self.wu_id()), msg));
        match self {
            WuEvent::Create { lane, title, .. } | WuEvent::Claim { lane, title, .. } => {
                if lane.trim().is_empty() {
                    return complain("event lane must not be empty");
                }
                if title.trim().is_empty() {
                    return complain("event title must not be empty");
                }
            }
            WuEvent::Block { reason, .. } => {
                if reason.trim().is_empty() {
                    return complain("block reason must not be empty");
                }
            }
            WuEvent::Checkpoint { note, .. } => {
                if note.trim().is_empty() {
                    return complain("checkpoint note must not be empty");
                }
            }
            WuEvent::Spawn { spawn_id, .. } => {
                if spawn_id.trim().is_empty() {
                    return complain("spawn id must not be empty");
                }
            }
            WuEvent::Release { .. } | WuEvent::Unblock { .. } | WuEvent::Complete { .. } => {}
        }
        Ok(())
    }
}

/// Outcome of bootstrapping the event log from YAML documents.
#[derive(Debug, Default)]
pub struct BootstrapOutcome {
    pub events_written: usize,
    /// Files skipped (template, malformed YAML) with the reason.
    pub skipped: Vec<(PathBuf, String)>,
    /// Set when the log was already populated; nothing was written.
    pub refused: Option<String>,
}

/// The append-only event store.
#[derive(Debug, Clone)]
pub struct EventStore {
    path: PathBuf,
}

impl EventStore {
    pub fn new(paths: &RepoPaths) -> Self {
        Self {
            path: paths.events_file(),
        }
    }

    pub fn at_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Validate and append one event.
    pub fn append(&self, event: &WuEvent) -> Result<()> {
        event.validate()?;
        let line = serde_json::to_string(event)
            .map_err(|e| LumenError::validation(Some(event.wu_id()), format!("serialise event: {e}")))?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                LumenError::validation(None, format!("create {}: {e}", parent.display()))
            })?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| {
                LumenError::validation(None, format!("open {}: {e}", self.path.display()))
            })?;
        writeln!(file, "{line}").map_err(|e| {
            LumenError::validation(None, format!("append to {}: {e}", self.path.display()))
        })?;
        Ok(())
    }

    /// Read all events in append order, skipping malformed lines.
    pub fn read_all(&self) -> Result<Vec<WuEvent>> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(LumenError::validation(
                    None,
                    format!("read {}: {e}", self.path.display()),
                ));
            }
        };
        let mut events = Vec::new();
        for (lineno, line) in raw.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<WuEvent>(line) {
                Ok(event) => events.push(event),
                Err(e) => {
                    log::warn!(
                        "skipping malformed event at {}:{}: {e}",
                        self.path.display(),
                        lineno + 1
                    );
                }
            }
        }
        Ok(events)
    }

    /// Derive a WU's runtime status by folding its events in order.
    ///
    /// `None` means no relevant events: callers fall back to YAML status.
    pub fn derive_status(&self, wu_id: WuId) -> Result<Option<WuStatus>> {
        let mut status = None;
        for event in self.read_all()? {
            if event.wu_id() == wu_id {
                if let Some(next) = event.derived_status() {
                    status = Some(next);
                }
            }
        }
        Ok(status)
    }

    /// Last event for a WU, optionally restricted to one kind.
    pub fn last_event(&self, wu_id: WuId, kind: Option<&str>) -> Result<Option<WuEvent>> {
        Ok(self
            .read_all()?
            .into_iter()
            .filter(|e| e.wu_id() == wu_id)
            .filter(|e| kind.is_none_or(|k| e.kind() == k))
            .next_back())
    }

    /// WU ids whose derived status is in_progress or blocked.
    pub fn active_wu_ids(&self) -> Result<BTreeSet<WuId>> {
        let mut statuses: std::collections::BTreeMap<WuId, WuStatus> = Default::default();
        for event in self.read_all()? {
            if let Some(next) = event.derived_status() {
                statuses.insert(event.wu_id(), next);
            }
        }
        Ok(statuses
            .into_iter()
            .filter(|(_, status)| status.is_active())
            .map(|(id, _)| id)
            .collect())
    }

    /// Synthesise an event log for a repository that predates event sourcing.
    ///
    /// ready WUs get nothing; in_progress get a claim; blocked get
    /// claim+block; done/cancelled get claim+complete. Refuses when the log
    /// already has events (a second bootstrap would double every WU's
    /// history).
    pub fn bootstrap_from_yaml(&self, wu_dir: &Path) -> Result<BootstrapOutcome> {
        let mut outcome = BootstrapOutcome::default();

        if !self.read_all()?.is_empty() {
            outcome.refused = Some(format!(
                "event log {} already populated; refusing to bootstrap",
                self.path.display()
            ));
            return Ok(outcome);
        }

        let mut entries: Vec<PathBuf> = match std::fs::read_dir(wu_dir) {
            Ok(iter) => iter
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("yaml"))
                .collect(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                return Err(LumenError::validation(
                    None,
                    format!("read {}: {e}", wu_dir.display()),
                ));
            }
        };
        entries.sort();

        for path in entries {
            if path.file_name().and_then(|n| n.to_str()) == Some("TEMPLATE.yaml") {
                outcome.skipped.push((path, "template".to_string()));
                continue;
            }
            let wu = match super::schema::load_work_unit(&path) {
                Ok(normalized) => normalized.wu,
                Err(e) => {
                    outcome.skipped.push((path, e.to_string()));
                    continue;
                }
            };

            let claim_at = wu
                .created
                .and_hms_opt(0, 0, 0)
                .map(|naive| naive.and_utc())
                .unwrap_or_else(utils::now_datetime);
            let complete_at = wu.completed_at.unwrap_or_else(utils::now_datetime);

            let claim = WuEvent::Claim {
                wu_id: wu.id,
                timestamp: claim_at,
                lane: wu.lane.clone(),
                title: wu.title.clone(),
            };

            match wu.status {
                WuStatus::Ready | WuStatus::Waiting => {}
                WuStatus::InProgress => {
                    self.append(&claim)?;
                    outcome.events_written += 1;
                }
                WuStatus::Blocked => {
                    self.append(&claim)?;
                    self.append(&WuEvent::Block {
                        wu_id: wu.id,
                        timestamp: claim_at,
                        reason: "bootstrap: blocked in YAML".to_string(),
                    })?;
                    outcome.events_written += 2;
                }
                WuStatus::Done | WuStatus::Cancelled => {
                    self.append(&claim)?;
                    self.append(&WuEvent::Complete {
                        wu_id: wu.id,
                        timestamp: complete_at,
                    })?;
                    outcome.events_written += 2;
                }
            }
        }

        Ok(outcome)
    }
}
