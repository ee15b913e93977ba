//! WU YAML validation, normalisation, and the auto-fixer.
//!
//! Three layers, applied in order when a document is loaded for mutation:
//!
//! 1. The **auto-fixer** works on raw YAML values and repairs mechanical
//!    drift a typed parse would choke on (id casing, status aliases, missing
//!    collection defaults). Applying the detected fixes twice is a no-op.
//! 2. **Schema validation** parses into [`WorkUnit`] and checks the §3-style
//!    structural invariants (lane form, locked⇒done, done⇒completed_at).
//! 3. **Done validation** checks completeness just before completion
//!    (description length, acceptance, tests for code-bearing types).

use std::path::Path;

use serde_yaml::Value;

use crate::error::{LumenError, Result};

use super::{WorkUnit, WuStatus};

/// Minimum description length for a deliverable WU.
pub const MIN_DESCRIPTION_LEN: usize = 50;

/// One mechanical issue the auto-fixer knows how to repair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FixableIssue {
    /// `id` not in canonical `WU-<N>` casing.
    IdCasing { found: String },
    /// `status` uses a hyphenated alias (`in-progress`).
    StatusAlias { found: String },
    /// `priority` is lower-case (`p1`).
    PriorityCasing { found: String },
    /// A list-valued field is missing entirely.
    MissingList { field: &'static str },
    /// `locked` missing (defaults to false).
    MissingLocked,
    /// `completed` absent or out of sync with `completed_at`.
    CompletedDateOutOfSync { expected: String },
}

impl FixableIssue {
    pub fn describe(&self) -> String {
        match self {
            FixableIssue::IdCasing { found } => format!("id '{found}' not in WU-<N> casing"),
            FixableIssue::StatusAlias { found } => format!("status alias '{found}'"),
            FixableIssue::PriorityCasing { found } => format!("priority '{found}' not upper-case"),
            FixableIssue::MissingList { field } => format!("missing list field '{field}'"),
            FixableIssue::MissingLocked => "missing 'locked' flag".to_string(),
            FixableIssue::CompletedDateOutOfSync { expected } => {
                format!("'completed' out of sync, expected {expected}")
            }
        }
    }
}

fn str_field<'a>(doc: &'a Value, key: &str) -> Option<&'a str> {
    doc.get(key).and_then(Value::as_str)
}

/// Detect mechanical issues in a raw WU document.
pub fn detect_fixable_issues(doc: &Value) -> Vec<FixableIssue> {
    let mut issues = Vec::new();

    if let Some(id) = str_field(doc, "id") {
        let canonical = id
            .parse::<super::WuId>()
            .map(|parsed| parsed.to_string())
            .unwrap_or_else(|_| id.to_string());
        if canonical != id {
            issues.push(FixableIssue::IdCasing {
                found: id.to_string(),
            });
        }
    }

    if let Some(status) = str_field(doc, "status") {
        if status.contains('-') {
            issues.push(FixableIssue::StatusAlias {
                found: status.to_string(),
            });
        }
    }

    if let Some(priority) = str_field(doc, "priority") {
        if priority.starts_with('p') {
            issues.push(FixableIssue::PriorityCasing {
                found: priority.to_string(),
            });
        }
    }

    for field in ["acceptance", "code_paths", "tests"] {
        if doc.get(field).is_none() {
            issues.push(FixableIssue::MissingList { field });
        }
    }

    if doc.get("locked").is_none() {
        issues.push(FixableIssue::MissingLocked);
    }

    // completed must mirror the date part of completed_at
    if let Some(completed_at) = str_field(doc, "completed_at") {
        let expected = completed_at.split('T').next().unwrap_or(completed_at);
        let completed = str_field(doc, "completed");
        if completed != Some(expected) {
            issues.push(FixableIssue::CompletedDateOutOfSync {
                expected: expected.to_string(),
            });
        }
    }

    issues
}

/// Apply the detected fixes in place. Returns true when the document changed.
///
/// `apply_fixes(doc, &detect_fixable_issues(doc))` twice in a row leaves the
/// document unchanged on the second pass.
pub fn apply_fixes(doc: &mut Value, issues: &[FixableIssue]) -> bool {
    let Some(map) = doc.as_mapping_mut() else {
        return false;
    };
    let mut changed = false;

    for issue in issues {
        match issue {
            FixableIssue::IdCasing { found } => {
                if let Ok(id) = found.parse::<super::WuId>() {
                    map.insert("id".into(), Value::String(id.to_string()));
                    changed = true;
                }
            }
            FixableIssue::StatusAlias { found } => {
                map.insert("status".into(), Value::String(found.replace('-', "_")));
                changed = true;
            }
            FixableIssue::PriorityCasing { found } => {
                map.insert("priority".into(), Value::String(found.to_ascii_uppercase()));
                changed = true;
            }
            FixableIssue::MissingList { field } => {
                map.insert((*field).into(), Value::Sequence(Vec::new()));
                changed = true;
            }
            FixableIssue::MissingLocked => {
                map.insert("locked".into(), Value::Bool(false));
                changed = true;
            }
            FixableIssue::CompletedDateOutOfSync { expected } => {
                map.insert("completed".into(), Value::String(expected.clone()));
                changed = true;
            }
        }
    }

    changed
}

/// Outcome of loading + normalising a WU document.
#[derive(Debug)]
pub struct NormalizedWu {
    pub wu: WorkUnit,
    /// True when the auto-fixer changed the document; callers re-write the
    /// normalised YAML in that case.
    pub changed: bool,
    pub fixes: Vec<FixableIssue>,
}

/// Parse, auto-fix, and validate a WU YAML string.
pub fn validate_and_normalize(raw: &str) -> Result<NormalizedWu> {
    let mut doc: Value = serde_yaml::from_str(raw)
        .map_err(|e| LumenError::validation(None, format!("invalid WU YAML: {e}")))?;

    let fixes = detect_fixable_issues(&doc);
    let changed = apply_fixes(&mut doc, &fixes);

    let wu: WorkUnit = serde_yaml::from_value(doc)
        .map_err(|e| LumenError::validation(None, format!("invalid WU document: {e}")))?;

    validate_work_unit(&wu)?;

    Ok(NormalizedWu { wu, changed, fixes })
}

/// Load a WU from disk, applying the auto-fixer.
pub fn load_work_unit(path: &Path) -> Result<NormalizedWu> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            LumenError::not_found("WU YAML", Some(path.to_path_buf()))
        } else {
            LumenError::validation(None, format!("failed to read {}: {e}", path.display()))
        }
    })?;
    validate_and_normalize(&raw)
}

/// Serialise a WU back to YAML.
pub fn to_yaml(wu: &WorkUnit) -> Result<String> {
    serde_yaml::to_string(wu)
        .map_err(|e| LumenError::validation(Some(wu.id), format!("serialise WU YAML: {e}")))
}

/// Structural invariants that hold for every WU regardless of lifecycle
/// position.
pub fn validate_work_unit(wu: &WorkUnit) -> Result<()> {
    if wu.title.trim().is_empty() {
        return Err(LumenError::validation(Some(wu.id), "title must not be empty"));
    }
    if !wu.lane.contains(':') {
        return Err(LumenError::validation(
            Some(wu.id),
            format!("lane '{}' must have the form 'Category: Name'", wu.lane),
        ));
    }
    if wu.locked && wu.status != WuStatus::Done {
        return Err(LumenError::validation(
            Some(wu.id),
            format!("locked WU must be done, found status {}", wu.status),
        ));
    }
    if wu.status == WuStatus::Done && wu.completed_at.is_none() {
        return Err(LumenError::validation(
            Some(wu.id),
            "done WU must carry completed_at",
        ));
    }
    if let (Some(completed), Some(completed_at)) = (wu.completed, wu.completed_at) {
        if completed != completed_at.date_naive() {
            return Err(LumenError::validation(
                Some(wu.id),
                "completed date does not match completed_at",
            ));
        }
    }
    Ok(())
}

/// Completeness checks applied immediately before completion.
pub fn validate_done(wu: &WorkUnit) -> Result<()> {
    if wu.description.trim().chars().count() < MIN_DESCRIPTION_LEN {
        return Err(LumenError::validation(
            Some(wu.id),
            format!(
                "description must be at least {MIN_DESCRIPTION_LEN} characters (found {})",
                wu.description.trim().chars().count()
            ),
        ));
    }
    if wu.acceptance.is_empty() {
        return Err(LumenError::validation(
            Some(wu.id),
            "acceptance criteria must not be empty",
        ));
    }
    if wu.kind.requires_tests() && wu.tests.is_empty() {
        return Err(LumenError::validation(
            Some(wu.id),
            format!("{} WU must declare tests", wu.kind),
        ));
    }
    Ok(())
}
