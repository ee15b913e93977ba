//! Signal bus.
//!
//! Append-only coordination messages between agents. Two JSONL files:
//! `signals.jsonl` holds the signals, `signal-receipts.jsonl` holds read
//! receipts. Read state is the overlay `inline_read OR receipt_exists`, so
//! marking a signal read never rewrites the signal file; both files stay
//! append-only and concurrent writers need no locks. Cleanup is the only
//! rewrite of the signals file, and it never touches receipts.

pub mod middleware;

use std::collections::{BTreeSet, HashSet};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{LumenError, Result};
use crate::paths::RepoPaths;
use crate::utils;
use crate::wu::WuId;

/// One coordination message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    /// `sig-` + 8 hex chars.
    pub id: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
    /// Inline read flag; the effective state also consults receipts.
    #[serde(default)]
    pub read: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wu_id: Option<WuId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lane: Option<String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<String>,
}

/// A read receipt: one appended line per newly-read signal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalReceipt {
    pub signal_id: String,
    pub read_at: DateTime<Utc>,
}

/// Fields of a signal the caller controls at creation.
#[derive(Debug, Default, Clone)]
pub struct NewSignal {
    pub message: String,
    pub wu_id: Option<WuId>,
    pub lane: Option<String>,
    pub kind: Option<String>,
    pub sender: Option<String>,
    pub target_agent: Option<String>,
    pub origin: Option<String>,
    pub remote_id: Option<String>,
}

/// Filters for [`SignalBus::load_signals`].
#[derive(Debug, Default, Clone)]
pub struct SignalFilter {
    pub wu_id: Option<WuId>,
    pub lane: Option<String>,
    pub unread_only: bool,
    pub since: Option<DateTime<Utc>>,
}

/// Options for [`SignalBus::cleanup_signals`].
#[derive(Debug, Clone)]
pub struct CleanupOptions {
    pub ttl: std::time::Duration,
    pub unread_ttl: std::time::Duration,
    pub max_entries: usize,
    /// Signals bound to these WUs are always retained.
    pub active_wu_ids: BTreeSet<WuId>,
    pub dry_run: bool,
}

impl Default for CleanupOptions {
    fn default() -> Self {
        let defaults = crate::config::EngineDefaults::default();
        Self {
            ttl: defaults.signal_ttl,
            unread_ttl: defaults.signal_unread_ttl,
            max_entries: defaults.signal_max_entries,
            active_wu_ids: BTreeSet::new(),
            dry_run: false,
        }
    }
}

/// Per-reason removal counts.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct CleanupBreakdown {
    pub ttl_expired: usize,
    pub unread_ttl_expired: usize,
    pub over_capacity: usize,
    /// Signals that would have expired but were kept for an active WU.
    pub active_wu_protected: usize,
}

#[derive(Debug, Default)]
pub struct CleanupReport {
    pub removed_ids: Vec<String>,
    pub retained_ids: Vec<String>,
    pub breakdown: CleanupBreakdown,
}

#[derive(Debug, Clone)]
pub struct SignalBus {
    signals_path: PathBuf,
    receipts_path: PathBuf,
}

fn append_line(path: &PathBuf, line: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| LumenError::validation(None, format!("create {}: {e}", parent.display())))?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| LumenError::validation(None, format!("open {}: {e}", path.display())))?;
    writeln!(file, "{line}")
        .map_err(|e| LumenError::validation(None, format!("append to {}: {e}", path.display())))
}

fn read_jsonl<T: serde::de::DeserializeOwned>(path: &PathBuf) -> Result<Vec<T>> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(LumenError::validation(
                None,
                format!("read {}: {e}", path.display()),
            ));
        }
    };
    let mut items = Vec::new();
    for (lineno, line) in raw.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(line) {
            Ok(item) => items.push(item),
            Err(e) => log::warn!(
                "skipping malformed line at {}:{}: {e}",
                path.display(),
                lineno + 1
            ),
        }
    }
    Ok(items)
}

impl SignalBus {
    pub fn new(paths: &RepoPaths) -> Self {
        Self {
            signals_path: paths.signals_file(),
            receipts_path: paths.receipts_file(),
        }
    }

    pub fn at_paths(signals: impl Into<PathBuf>, receipts: impl Into<PathBuf>) -> Self {
        Self {
            signals_path: signals.into(),
            receipts_path: receipts.into(),
        }
    }

    /// Validate and append a new signal; returns the stored record.
    pub fn create_signal(&self, draft: NewSignal) -> Result<Signal> {
        if draft.message.trim().is_empty() {
            return Err(LumenError::validation(None, "signal message must not be empty"));
        }
        let signal = Signal {
            id: format!("sig-{:08x}", rand::random::<u32>()),
            message: draft.message,
            created_at: utils::now_datetime(),
            read: false,
            wu_id: draft.wu_id,
            lane: draft.lane,
            kind: draft.kind,
            sender: draft.sender,
            target_agent: draft.target_agent,
            origin: draft.origin,
            remote_id: draft.remote_id,
        };
        let line = serde_json::to_string(&signal)
            .map_err(|e| LumenError::validation(None, format!("serialise signal: {e}")))?;
        append_line(&self.signals_path, &line)?;
        Ok(signal)
    }

    fn receipt_set(&self) -> Result<HashSet<String>> {
        Ok(read_jsonl::<SignalReceipt>(&self.receipts_path)?
            .into_iter()
            .map(|r| r.signal_id)
            .collect())
    }

    /// Load signals chronologically with the receipt overlay and filters
    /// applied.
    pub fn load_signals(&self, filter: &SignalFilter) -> Result<Vec<Signal>> {
        let receipts = self.receipt_set()?;
        let mut signals: Vec<Signal> = read_jsonl(&self.signals_path)?;
        for signal in &mut signals {
            signal.read = signal.read || receipts.contains(&signal.id);
        }
        signals.retain(|s| {
            filter.wu_id.is_none_or(|id| s.wu_id == Some(id))
                && filter
                    .lane
                    .as_deref()
                    .is_none_or(|lane| s.lane.as_deref() == Some(lane))
                && (!filter.unread_only || !s.read)
                && filter.since.is_none_or(|since| s.created_at >= since)
        });
        signals.sort_by_key(|s| s.created_at);
        Ok(signals)
    }

    /// Append one receipt per signal that is truly unread. Passing the same
    /// id twice (in one call or across calls) yields exactly one receipt.
    /// Returns the number of receipts written.
    pub fn mark_signals_as_read(&self, ids: &[String]) -> Result<usize> {
        let receipts = self.receipt_set()?;
        let inline_read: HashSet<String> = read_jsonl::<Signal>(&self.signals_path)?
            .into_iter()
            .filter(|s| s.read)
            .map(|s| s.id)
            .collect();

        let mut written = 0;
        let mut seen_this_call = HashSet::new();
        let now = utils::now_datetime();
        for id in ids {
            if receipts.contains(id) || inline_read.contains(id) || !seen_this_call.insert(id) {
                continue;
            }
            let receipt = SignalReceipt {
                signal_id: id.clone(),
                read_at: now,
            };
            let line = serde_json::to_string(&receipt)
                .map_err(|e| LumenError::validation(None, format!("serialise receipt: {e}")))?;
            append_line(&self.receipts_path, &line)?;
            written += 1;
        }
        Ok(written)
    }

    /// Apply retention policy: read-TTL, unread-TTL, then the entry cap.
    /// Signals bound to an active WU are always retained. Receipts are never
    /// rewritten. In dry-run mode the report is computed but the file is left
    /// alone.
    pub fn cleanup_signals(&self, options: &CleanupOptions) -> Result<CleanupReport> {
        let receipts = self.receipt_set()?;
        let mut signals: Vec<Signal> = read_jsonl(&self.signals_path)?;
        for signal in &mut signals {
            signal.read = signal.read || receipts.contains(&signal.id);
        }

        let now = utils::now_datetime();
        let ttl = chrono::Duration::from_std(options.ttl).unwrap_or(chrono::Duration::MAX);
        let unread_ttl =
            chrono::Duration::from_std(options.unread_ttl).unwrap_or(chrono::Duration::MAX);

        let mut report = CleanupReport::default();
        let protected = |signal: &Signal| {
            signal
                .wu_id
                .is_some_and(|id| options.active_wu_ids.contains(&id))
        };

        let mut kept: Vec<Signal> = Vec::with_capacity(signals.len());
        for signal in signals {
            let age = now - signal.created_at;
            let expired = if signal.read {
                (age > ttl).then_some(&mut report.breakdown.ttl_expired)
            } else {
                (age > unread_ttl).then_some(&mut report.breakdown.unread_ttl_expired)
            };
            match expired {
                Some(counter) if !protected(&signal) => {
                    *counter += 1;
                    report.removed_ids.push(signal.id);
                }
                Some(_) => {
                    report.breakdown.active_wu_protected += 1;
                    kept.push(signal);
                }
                None => kept.push(signal),
            }
        }

        if kept.len() > options.max_entries {
            // Oldest unprotected entries go first
            kept.sort_by_key(|s| s.created_at);
            let mut overflow = kept.len() - options.max_entries;
            let mut survivors = Vec::with_capacity(options.max_entries);
            for signal in kept {
                if overflow > 0 && !protected(&signal) {
                    overflow -= 1;
                    report.breakdown.over_capacity += 1;
                    report.removed_ids.push(signal.id);
                } else {
                    survivors.push(signal);
                }
            }
            kept = survivors;
        }

        kept.sort_by_key(|s| s.created_at);
        report.retained_ids = kept.iter().map(|s| s.id.clone()).collect();

        if !options.dry_run {
            let mut out = String::new();
            for signal in &kept {
                let line = serde_json::to_string(signal)
                    .map_err(|e| LumenError::validation(None, format!("serialise signal: {e}")))?;
                out.push_str(&line);
                out.push('\n');
            }
            if let Some(parent) = self.signals_path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    LumenError::validation(None, format!("create {}: {e}", parent.display()))
                })?;
            }
            std::fs::write(&self.signals_path, out).map_err(|e| {
                LumenError::validation(
                    None,
                    format!("rewrite {}: {e}", self.signals_path.display()),
                )
            })?;
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bus() -> (tempfile::TempDir, SignalBus) {
        let dir = tempfile::tempdir().unwrap();
        let bus = SignalBus::at_paths(
            dir.path().join("signals.jsonl"),
            dir.path().join("signal-receipts.jsonl"),
        );
        (dir, bus)
    }

    fn wu(n: u32) -> WuId {
        WuId::new(n).unwrap()
    }

    fn draft(message: &str, wu_id: Option<WuId>) -> NewSignal {
        NewSignal {
            message: message.to_string(),
            wu_id,
            ..Default::default()
        }
    }

    /// Rewrite one signal's created_at to age it artificially.
    fn age_signal(bus: &SignalBus, id: &str, days: i64) {
        let path = bus.signals_path.clone();
        let raw = std::fs::read_to_string(&path).unwrap();
        let out: String = raw
            .lines()
            .map(|line| {
                let mut value: serde_json::Value = serde_json::from_str(line).unwrap();
                if value["id"] == id {
                    let old = utils::now_datetime() - chrono::Duration::days(days);
                    value["created_at"] = serde_json::json!(old);
                }
                format!("{value}\n")
            })
            .collect();
        std::fs::write(&path, out).unwrap();
    }

    #[test]
    fn create_assigns_sig_id_and_appends() {
        let (_dir, bus) = bus();
        let signal = bus.create_signal(draft("lane free", Some(wu(1)))).unwrap();
        assert!(signal.id.starts_with("sig-"));
        assert_eq!(signal.id.len(), 4 + 8);
        assert!(signal.id[4..].chars().all(|c| c.is_ascii_hexdigit()));

        let loaded = bus.load_signals(&SignalFilter::default()).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].message, "lane free");
    }

    #[test]
    fn empty_message_is_rejected() {
        let (_dir, bus) = bus();
        assert!(bus.create_signal(draft("   ", None)).is_err());
    }

    #[test]
    fn filters_apply() {
        let (_dir, bus) = bus();
        bus.create_signal(draft("a", Some(wu(1)))).unwrap();
        bus.create_signal(NewSignal {
            message: "b".to_string(),
            lane: Some("Core: Engine".to_string()),
            ..Default::default()
        })
        .unwrap();

        let by_wu = bus
            .load_signals(&SignalFilter {
                wu_id: Some(wu(1)),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(by_wu.len(), 1);
        assert_eq!(by_wu[0].message, "a");

        let by_lane = bus
            .load_signals(&SignalFilter {
                lane: Some("Core: Engine".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(by_lane.len(), 1);
        assert_eq!(by_lane[0].message, "b");
    }

    #[test]
    fn receipts_overlay_read_state() {
        let (_dir, bus) = bus();
        let s = bus.create_signal(draft("to read", None)).unwrap();
        assert_eq!(
            bus.load_signals(&SignalFilter {
                unread_only: true,
                ..Default::default()
            })
            .unwrap()
            .len(),
            1
        );

        bus.mark_signals_as_read(&[s.id.clone()]).unwrap();

        let unread = bus
            .load_signals(&SignalFilter {
                unread_only: true,
                ..Default::default()
            })
            .unwrap();
        assert!(unread.is_empty());
        let all = bus.load_signals(&SignalFilter::default()).unwrap();
        assert!(all[0].read, "receipt overlays inline read=false");
    }

    #[test]
    fn mark_as_read_is_idempotent() {
        let (_dir, bus) = bus();
        let s = bus.create_signal(draft("once", None)).unwrap();

        // Duplicate ids within one call and across calls
        let written = bus
            .mark_signals_as_read(&[s.id.clone(), s.id.clone()])
            .unwrap();
        assert_eq!(written, 1);
        let written = bus.mark_signals_as_read(&[s.id.clone()]).unwrap();
        assert_eq!(written, 0);

        let receipts = std::fs::read_to_string(&bus.receipts_path).unwrap();
        assert_eq!(receipts.lines().count(), 1);
    }

    #[test]
    fn cleanup_removes_expired_read_signals() {
        let (_dir, bus) = bus();
        let old = bus.create_signal(draft("old", None)).unwrap();
        bus.create_signal(draft("fresh", None)).unwrap();
        bus.mark_signals_as_read(&[old.id.clone()]).unwrap();
        age_signal(&bus, &old.id, 60);

        let report = bus.cleanup_signals(&CleanupOptions::default()).unwrap();
        assert_eq!(report.removed_ids, vec![old.id]);
        assert_eq!(report.breakdown.ttl_expired, 1);
        assert_eq!(bus.load_signals(&SignalFilter::default()).unwrap().len(), 1);
    }

    #[test]
    fn cleanup_protects_active_wus() {
        let (_dir, bus) = bus();
        let a = bus.create_signal(draft("for WU-1", Some(wu(1)))).unwrap();
        let b = bus.create_signal(draft("for WU-2", Some(wu(2)))).unwrap();
        bus.mark_signals_as_read(&[a.id.clone(), b.id.clone()]).unwrap();
        age_signal(&bus, &a.id, 60);
        age_signal(&bus, &b.id, 60);

        let report = bus
            .cleanup_signals(&CleanupOptions {
                active_wu_ids: BTreeSet::from([wu(1)]),
                ..Default::default()
            })
            .unwrap();

        assert_eq!(report.removed_ids, vec![b.id.clone()]);
        assert!(report.retained_ids.contains(&a.id));
        assert_eq!(report.breakdown.ttl_expired, 1);
        assert_eq!(report.breakdown.active_wu_protected, 1);
    }

    #[test]
    fn cleanup_unread_ttl() {
        let (_dir, bus) = bus();
        let stale = bus.create_signal(draft("never read", None)).unwrap();
        age_signal(&bus, &stale.id, 40);

        let report = bus.cleanup_signals(&CleanupOptions::default()).unwrap();
        assert_eq!(report.breakdown.unread_ttl_expired, 1);
        assert_eq!(report.removed_ids, vec![stale.id]);
    }

    #[test]
    fn cleanup_enforces_entry_cap_newest_win() {
        let (_dir, bus) = bus();
        let mut ids = Vec::new();
        for i in 0..5 {
            ids.push(bus.create_signal(draft(&format!("s{i}"), None)).unwrap().id);
        }
        // Make ordering unambiguous
        for (i, id) in ids.iter().enumerate() {
            age_signal(&bus, id, 5 - i as i64);
        }

        let report = bus
            .cleanup_signals(&CleanupOptions {
                max_entries: 3,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(report.breakdown.over_capacity, 2);
        assert_eq!(report.retained_ids.len(), 3);
        let remaining = bus.load_signals(&SignalFilter::default()).unwrap();
        assert_eq!(remaining.len(), 3);
        assert_eq!(remaining.last().unwrap().message, "s4");
    }

    #[test]
    fn dry_run_reports_without_rewriting() {
        let (_dir, bus) = bus();
        let old = bus.create_signal(draft("old", None)).unwrap();
        bus.mark_signals_as_read(&[old.id.clone()]).unwrap();
        age_signal(&bus, &old.id, 60);

        let report = bus
            .cleanup_signals(&CleanupOptions {
                dry_run: true,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(report.removed_ids.len(), 1);
        assert_eq!(bus.load_signals(&SignalFilter::default()).unwrap().len(), 1);
    }

    #[test]
    fn cleanup_leaves_receipts_untouched() {
        let (_dir, bus) = bus();
        let old = bus.create_signal(draft("old", None)).unwrap();
        bus.mark_signals_as_read(&[old.id.clone()]).unwrap();
        age_signal(&bus, &old.id, 60);
        let receipts_before = std::fs::read_to_string(&bus.receipts_path).unwrap();

        bus.cleanup_signals(&CleanupOptions::default()).unwrap();
        let receipts_after = std::fs::read_to_string(&bus.receipts_path).unwrap();
        assert_eq!(receipts_before, receipts_after);
    }

    #[test]
    fn blank_lines_are_tolerated() {
        let (_dir, bus) = bus();
        bus.create_signal(draft("a", None)).unwrap();
        let mut raw = std::fs::read_to_string(&bus.signals_path).unwrap();
        raw.push_str("\n\n");
        std::fs::write(&bus.signals_path, raw).unwrap();
        bus.create_signal(draft("b", None)).unwrap();
        assert_eq!(bus.load_signals(&SignalFilter::default()).unwrap().len(), 2);
    }
}
