//! Work Unit data model.
//!
//! A Work Unit (WU) is the unit of tracked work: a YAML spec under the WU
//! directory, a lifecycle status, and (once claimed) a lane branch and
//! worktree. This module defines the identifier, the closed status/type
//! enums, and the persisted document shape. Validation and normalisation live
//! in [`schema`]; the transition table in [`state`]; the event log in
//! [`store`].

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub mod schema;
pub mod state;
pub mod store;

/// Work Unit identifier: `WU-<N>` with a non-zero number.
///
/// Display form is upper-case (`WU-7`); branch and worktree names use
/// [`WuId::lower`] (`wu-7`). Parsing is case-insensitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WuId(u32);

impl WuId {
    pub fn new(n: u32) -> Option<Self> {
        (n != 0).then_some(Self(n))
    }

    pub fn number(self) -> u32 {
        self.0
    }

    /// Lower-case form used in branch names and worktree directories.
    pub fn lower(self) -> String {
        format!("wu-{}", self.0)
    }

    /// Extract a WU id from free text (directory names, branch names).
    ///
    /// Matches `wu-<digits>` case-insensitively on a word boundary, so
    /// `core-engine-wu-7` resolves to `WU-7` but `wu-2049` never matches a
    /// search for `WU-204`.
    pub fn extract(text: &str) -> Option<Self> {
        static RE: once_cell::sync::Lazy<regex::Regex> = once_cell::sync::Lazy::new(|| {
            regex::Regex::new(r"(?i)\bwu-(\d+)\b").expect("static regex")
        });
        let caps = RE.captures(text)?;
        caps[1].parse::<u32>().ok().and_then(Self::new)
    }
}

impl fmt::Display for WuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WU-{}", self.0)
    }
}

impl FromStr for WuId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix("WU-")
            .or_else(|| s.strip_prefix("wu-"))
            .ok_or_else(|| format!("expected WU-<N>, got '{s}'"))?;
        let n: u32 = rest
            .parse()
            .map_err(|_| format!("expected WU-<N>, got '{s}'"))?;
        Self::new(n).ok_or_else(|| format!("WU number must be non-zero, got '{s}'"))
    }
}

impl Serialize for WuId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for WuId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// WU lifecycle status.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum WuStatus {
    Ready,
    InProgress,
    Blocked,
    Waiting,
    Done,
    Cancelled,
}

impl WuStatus {
    /// Terminal statuses have no outgoing transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, WuStatus::Done | WuStatus::Cancelled)
    }

    /// Active statuses hold a lane and protect their signals from cleanup.
    pub fn is_active(self) -> bool {
        matches!(self, WuStatus::InProgress | WuStatus::Blocked)
    }
}

/// WU work type.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum WuType {
    Feature,
    Bug,
    Documentation,
    Process,
    Tooling,
    Chore,
    Refactor,
}

impl WuType {
    /// Types whose definition of done includes tests.
    pub fn requires_tests(self) -> bool {
        matches!(self, WuType::Feature | WuType::Bug | WuType::Refactor)
    }
}

/// Priority band, P0 (highest) through P3.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
pub enum Priority {
    P0,
    P1,
    P2,
    P3,
}

/// How the WU was claimed, which selects the integration mode at completion.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum ClaimedMode {
    /// Default: isolated worktree, lane branch merged to main via push-only
    /// micro-worktree.
    Worktree,
    /// Lane branch without a worktree; merged to main the same way.
    BranchOnly,
    /// Lane branch pushed and a PR opened; main is never touched locally.
    BranchPr,
}

/// The persisted WU document (`<wuDir>/WU-<N>.yaml`).
///
/// YAML is the source of truth for the *spec*; runtime status is derived from
/// the event log and reconciled back into this document at claim, block, and
/// completion boundaries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkUnit {
    pub id: WuId,
    pub title: String,
    /// Lane name of the form `Category: Name`.
    pub lane: String,
    #[serde(rename = "type")]
    pub kind: WuType,
    pub status: WuStatus,
    pub priority: Priority,
    pub created: NaiveDate,
    /// Set at completion; `completed` is kept in sync with its date part.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<NaiveDate>,
    /// True once done; a locked WU's YAML is never edited again.
    #[serde(default)]
    pub locked: bool,
    pub description: String,
    #[serde(default)]
    pub acceptance: Vec<String>,
    /// Globs naming the code this WU is allowed to touch.
    #[serde(default)]
    pub code_paths: Vec<String>,
    #[serde(default)]
    pub tests: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_mode: Option<ClaimedMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worktree_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub spec_refs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<String>,
    /// Initiative this WU belongs to, if any. The reverse lookup is derived
    /// on demand; only the child side is persisted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initiative: Option<String>,
}
