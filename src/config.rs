//! Repository configuration.
//!
//! `lumenflow.yaml` at the repository root is checked into git and shared by
//! every agent working the repo. It declares the lanes (name, WIP limit,
//! code paths) and records the lane lifecycle state the engine has inferred.
//! Engine tuning knobs are compiled-in defaults; the config file can override
//! none of them today, which keeps every agent in a repo running the same
//! policy.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{LumenError, Result};
use crate::paths::RepoPaths;

/// Lane lifecycle state, classified from on-disk artifacts.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum LaneLifecycle {
    /// No lane artifacts exist yet.
    Unconfigured,
    /// Partial or invalid artifacts, or explicitly marked draft.
    Draft,
    /// Definitions and inference are present and valid; delivery WUs may be
    /// created.
    Locked,
}

/// One lane definition under `lanes.definitions`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LaneDef {
    /// Lane name of the form `Category: Name`.
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wip_limit: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub code_paths: Vec<String>,
}

/// Persisted lifecycle record under `lanes.lifecycle`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LaneLifecycleRecord {
    pub status: LaneLifecycle,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    /// Set when the status was inferred rather than declared.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub migrated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub migration_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct LanesSection {
    #[serde(default)]
    pub definitions: Vec<LaneDef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lifecycle: Option<LaneLifecycleRecord>,
}

/// Root of `lumenflow.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct LumenflowConfig {
    #[serde(default)]
    pub lanes: LanesSection,
}

impl LumenflowConfig {
    /// Load from `lumenflow.yaml` under the repo root.
    ///
    /// Returns `Ok(None)` when the file does not exist; a present but
    /// unparseable file is a validation error, not a silent default.
    pub fn load(paths: &RepoPaths) -> Result<Option<Self>> {
        Self::load_from(&paths.config_file())
    }

    pub fn load_from(path: &Path) -> Result<Option<Self>> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(LumenError::validation(
                    None,
                    format!("failed to read {}: {e}", path.display()),
                ));
            }
        };
        let config: Self = serde_yaml::from_str(&raw).map_err(|e| {
            LumenError::validation(None, format!("invalid {}: {e}", path.display()))
        })?;
        Ok(Some(config))
    }

    pub fn save(&self, paths: &RepoPaths) -> Result<()> {
        let path = paths.config_file();
        let yaml = serde_yaml::to_string(self)
            .map_err(|e| LumenError::validation(None, format!("serialise lumenflow.yaml: {e}")))?;
        std::fs::write(&path, yaml).map_err(|e| {
            LumenError::validation(None, format!("failed to write {}: {e}", path.display()))
        })
    }

    pub fn lane(&self, name: &str) -> Option<&LaneDef> {
        self.lanes.definitions.iter().find(|l| l.name == name)
    }
}

/// Branch drift thresholds (commits behind main) for context reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BranchDriftThresholds {
    pub info: u32,
    pub warning: u32,
    pub max: u32,
}

/// Severity of a lane branch's drift behind main.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum BranchDriftLevel {
    None,
    Info,
    Warning,
    ExceedsMax,
}

impl BranchDriftThresholds {
    pub fn classify(&self, behind: u32) -> BranchDriftLevel {
        if behind >= self.max {
            BranchDriftLevel::ExceedsMax
        } else if behind >= self.warning {
            BranchDriftLevel::Warning
        } else if behind >= self.info {
            BranchDriftLevel::Info
        } else {
            BranchDriftLevel::None
        }
    }
}

/// Compiled-in engine defaults.
#[derive(Debug, Clone)]
pub struct EngineDefaults {
    /// Read signals older than this are dropped by cleanup.
    pub signal_ttl: Duration,
    /// Unread signals older than this are dropped by cleanup.
    pub signal_unread_ttl: Duration,
    /// Hard cap on retained signals; newest win.
    pub signal_max_entries: usize,
    /// Generic `wu:*` commands check signals at most once per this window.
    pub generic_check_throttle: Duration,
    /// Deadline for the optional remote signal pull.
    pub remote_pull_timeout: Duration,
    /// Consecutive remote failures before the circuit opens.
    pub remote_circuit_failure_threshold: u32,
    /// How long an open remote circuit stays open.
    pub remote_circuit_open: Duration,
    pub max_commit_subject: usize,
    /// Soft budget for context resolution; exceeding it is reported, not fatal.
    pub context_computation: Duration,
    pub branch_drift: BranchDriftThresholds,
}

impl Default for EngineDefaults {
    fn default() -> Self {
        Self {
            signal_ttl: Duration::from_secs(7 * 24 * 3600),
            signal_unread_ttl: Duration::from_secs(30 * 24 * 3600),
            signal_max_entries: 500,
            generic_check_throttle: Duration::from_millis(30_000),
            remote_pull_timeout: Duration::from_millis(200),
            remote_circuit_failure_threshold: 3,
            remote_circuit_open: Duration::from_millis(60_000),
            max_commit_subject: 100,
            context_computation: Duration::from_millis(100),
            branch_drift: BranchDriftThresholds {
                info: 10,
                warning: 15,
                max: 20,
            },
        }
    }
}
