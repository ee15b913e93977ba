//! Section-scoped edits to the backlog and status markdown.
//!
//! `backlog.md` and `status.md` are human-editable; the engine only ever
//! touches whole lines inside one `## ` section, and a line belongs to a WU
//! only when it contains the exact substring `(wu/WU-<N>.yaml)`. The
//! parenthesised form prevents prefix collisions: removing WU-208 must leave
//! a WU-2087 line untouched.

use crate::wu::{WuId, WorkUnit};

/// Heading of the in-progress section.
pub const IN_PROGRESS_SECTION: &str = "## 🔧 In progress";
/// Heading of the done section.
pub const DONE_SECTION: &str = "## ✅ Done";

/// The exact substring that ties a markdown line to a WU.
pub fn wu_marker(id: WuId) -> String {
    format!("(wu/{id}.yaml)")
}

/// Render the engine's line for a WU inside a section.
pub fn wu_line(wu: &WorkUnit) -> String {
    format!("- {id} — {title} (wu/{id}.yaml)", id = wu.id, title = wu.title)
}

/// Line range `[start, end)` of a section's body (excluding the heading).
///
/// The body runs until the next `## ` heading or end of file. Returns `None`
/// when the heading is absent.
fn section_body(lines: &[&str], section: &str) -> Option<(usize, usize)> {
    let start = lines.iter().position(|l| l.trim_end() == section)? + 1;
    let end = lines[start..]
        .iter()
        .position(|l| l.starts_with("## "))
        .map(|off| start + off)
        .unwrap_or(lines.len());
    Some((start, end))
}

/// Whether a section lists the WU.
pub fn section_contains(content: &str, section: &str, id: WuId) -> bool {
    let marker = wu_marker(id);
    let lines: Vec<&str> = content.lines().collect();
    match section_body(&lines, section) {
        Some((start, end)) => lines[start..end].iter().any(|l| l.contains(&marker)),
        None => false,
    }
}

/// Remove every line for the WU from one section. Returns the new content
/// and whether anything changed. Lines outside the section are untouched.
pub fn remove_wu_from_section(content: &str, section: &str, id: WuId) -> (String, bool) {
    let marker = wu_marker(id);
    let lines: Vec<&str> = content.lines().collect();
    let Some((start, end)) = section_body(&lines, section) else {
        return (content.to_string(), false);
    };

    let mut out: Vec<&str> = Vec::with_capacity(lines.len());
    let mut changed = false;
    for (i, line) in lines.iter().enumerate() {
        if i >= start && i < end && line.contains(&marker) {
            changed = true;
            continue;
        }
        out.push(line);
    }

    let mut result = out.join("\n");
    if content.ends_with('\n') {
        result.push('\n');
    }
    (result, changed)
}

/// Append a line under a section, creating the section at the end of the
/// document when missing. Returns the new content and whether it changed
/// (appending a line already present in the section is a no-op).
pub fn append_wu_to_section(content: &str, section: &str, line: &str, id: WuId) -> (String, bool) {
    if section_contains(content, section, id) {
        return (content.to_string(), false);
    }

    let lines: Vec<&str> = content.lines().collect();
    let mut out: Vec<String> = lines.iter().map(|l| l.to_string()).collect();

    match section_body(&lines, section) {
        Some((start, end)) => {
            // Insert before trailing blank lines so the section stays tight
            let mut insert_at = end;
            while insert_at > start && out[insert_at - 1].trim().is_empty() {
                insert_at -= 1;
            }
            out.insert(insert_at, line.to_string());
        }
        None => {
            if !out.is_empty() && !out.last().is_some_and(|l| l.trim().is_empty()) {
                out.push(String::new());
            }
            out.push(section.to_string());
            out.push(String::new());
            out.push(line.to_string());
        }
    }

    let mut result = out.join("\n");
    result.push('\n');
    (result, true)
}

/// Every section heading whose body lists the WU.
pub fn sections_listing(content: &str, id: WuId) -> Vec<String> {
    let marker = wu_marker(id);
    let mut sections = Vec::new();
    let mut current: Option<&str> = None;
    for line in content.lines() {
        if line.starts_with("## ") {
            current = Some(line.trim_end());
        } else if line.contains(&marker) {
            if let Some(section) = current {
                if !sections.iter().any(|s| s == section) {
                    sections.push(section.to_string());
                }
            }
        }
    }
    sections
}
