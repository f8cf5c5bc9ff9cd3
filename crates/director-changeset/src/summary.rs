//! Per-section summary of a manifest change, as shown before a deploy.

use std::fmt;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::diff::{Changeset, Differ};

/// Sections reported first, in this order, when present on either side.
const SECTION_ORDER: &[&str] = &[
    "release",
    "releases",
    "compilation",
    "update",
    "resource_pools",
    "networks",
    "jobs",
    "instance_groups",
    "properties",
];

/// Identity keys that are never reported.
const SKIPPED: &[&str] = &["name", "director_uuid"];

#[derive(Debug, Clone, Serialize)]
pub struct SectionSummary {
    pub key: String,
    pub title: String,
    pub changes: Changeset,
}

impl SectionSummary {
    pub fn has_changes(&self) -> bool {
        self.changes.has_changes()
    }
}

impl fmt::Display for SectionSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.title)?;
        if self.changes.is_empty() {
            return writeln!(f, "No changes");
        }
        write!(f, "{}", self.changes)
    }
}

/// `resource_pools` becomes `Resource pools`.
pub fn section_title(key: &str) -> String {
    let spaced = key.replace(['-', '_'], " ");
    let mut chars = spaced.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    }
}

/// Diff two manifests section by section.
pub fn summarize(old: &Value, new: &Value, redact: bool) -> Vec<SectionSummary> {
    let empty = Map::new();
    let old = old.as_object().unwrap_or(&empty);
    let new = new.as_object().unwrap_or(&empty);

    let mut keys: Vec<&str> = SECTION_ORDER
        .iter()
        .copied()
        .filter(|k| old.contains_key(*k) || new.contains_key(*k))
        .collect();
    for key in old.keys().chain(new.keys()) {
        let key = key.as_str();
        if !SKIPPED.contains(&key) && !keys.contains(&key) {
            keys.push(key);
        }
    }

    let differ = Differ::changes(redact);
    keys.into_iter()
        .map(|key| {
            let (a, b) = (old.get(key), new.get(key));
            let redacted = [a, b].into_iter().flatten().any(|v| differ.redacts_section(key, v));
            let mut lines = Vec::new();
            differ.diff_root(a.filter(|v| !v.is_null()), b.filter(|v| !v.is_null()), redacted, &mut lines);
            SectionSummary {
                key: key.to_string(),
                title: section_title(key),
                changes: Changeset::from_lines(lines),
            }
        })
        .collect()
}

/// Text block with one titled paragraph per section.
pub fn render_summary(sections: &[SectionSummary]) -> String {
    sections
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\n")
}
