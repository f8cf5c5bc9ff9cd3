//! Line-level structural diff.

use std::fmt;

use serde::ser::{Serialize, Serializer};
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::redact::{redacts_subtree, REDACTED};
use crate::render::{entry_text, is_leaf, leaf_text, string_text};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Added,
    Removed,
}

/// One rendered row. `status` is `None` for context and unchanged rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line {
    pub indent: usize,
    pub text: String,
    pub status: Option<Status>,
}

impl Line {
    pub fn new(indent: usize, text: impl Into<String>, status: Option<Status>) -> Self {
        Self {
            indent,
            text: text.into(),
            status,
        }
    }

    pub fn is_added(&self) -> bool {
        self.status == Some(Status::Added)
    }

    pub fn is_removed(&self) -> bool {
        self.status == Some(Status::Removed)
    }
}

impl fmt::Display for Line {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:width$}{}", "", self.text, width = self.indent)
    }
}

/// Ordered diff lines between two documents.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Changeset {
    lines: Vec<Line>,
}

impl Changeset {
    /// Changed lines plus the ancestor lines that locate them. Identical
    /// documents give an empty changeset.
    pub fn diff(old: &Value, new: &Value, redact: bool) -> Self {
        Self::build(old, new, Differ::changes(redact))
    }

    /// Like [`Changeset::diff`] but every unchanged line is kept too, so the
    /// old and new views render the complete documents.
    pub fn full(old: &Value, new: &Value, redact: bool) -> Self {
        Self::build(old, new, Differ { redact, unchanged: true })
    }

    fn build(old: &Value, new: &Value, differ: Differ) -> Self {
        let mut lines = Vec::new();
        differ.diff_root(root(old), root(new), false, &mut lines);
        Self { lines }
    }

    pub(crate) fn from_lines(lines: Vec<Line>) -> Self {
        Self { lines }
    }

    pub fn lines(&self) -> &[Line] {
        &self.lines
    }

    pub fn into_lines(self) -> Vec<Line> {
        self.lines
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn has_changes(&self) -> bool {
        self.lines.iter().any(|l| l.status.is_some())
    }

    /// Every line that is not an addition, i.e. the old side.
    pub fn old_view(&self) -> Vec<String> {
        self.lines
            .iter()
            .filter(|l| !l.is_added())
            .map(Line::to_string)
            .collect()
    }

    /// Every line that is not a removal, i.e. the new side.
    pub fn new_view(&self) -> Vec<String> {
        self.lines
            .iter()
            .filter(|l| !l.is_removed())
            .map(Line::to_string)
            .collect()
    }

    /// `(text, status)` pairs as returned by the diff endpoints.
    pub fn to_pairs(&self) -> Vec<(String, Option<Status>)> {
        self.lines.iter().map(|l| (l.to_string(), l.status)).collect()
    }
}

impl Serialize for Changeset {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.lines.iter().map(|l| (l.to_string(), l.status)))
    }
}

impl fmt::Display for Changeset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for line in &self.lines {
            let marker = match line.status {
                Some(Status::Added) => '+',
                Some(Status::Removed) => '-',
                None => ' ',
            };
            writeln!(f, "{marker} {line}")?;
        }
        Ok(())
    }
}

/// A null document diffs as if absent.
fn root(value: &Value) -> Option<&Value> {
    (!value.is_null()).then_some(value)
}

/// Identity of an array element: its `name`, or `range` for subnets.
fn identity(value: &Value) -> Option<(&'static str, &Value)> {
    let map = value.as_object()?;
    ["name", "range"].into_iter().find_map(|key| {
        map.get(key)
            .filter(|id| is_leaf(id) && !id.is_null())
            .map(|id| (key, id))
    })
}

fn without(map: &Map<String, Value>, key: &str) -> Map<String, Value> {
    map.iter()
        .filter(|(k, _)| k.as_str() != key)
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Move the first line of a rendered element behind a `- ` bullet.
fn bullet(line: &mut Line, indent: usize) {
    line.indent = indent;
    line.text = if line.text.is_empty() {
        "-".to_string()
    } else {
        format!("- {}", line.text)
    };
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Differ {
    /// Hide sensitive leaves behind the placeholder.
    redact: bool,
    /// Emit unchanged lines as well.
    unchanged: bool,
}

impl Differ {
    pub(crate) fn changes(redact: bool) -> Self {
        Self {
            redact,
            unchanged: false,
        }
    }

    pub(crate) fn unredacted() -> Self {
        Self {
            redact: false,
            unchanged: true,
        }
    }

    /// Whether a top-level section is hidden entirely.
    pub(crate) fn redacts_section(&self, key: &str, value: &Value) -> bool {
        self.below(key, value, false)
    }

    fn leaf(&self, value: &Value, redacted: bool) -> String {
        if redacted && !value.is_object() && !value.is_array() {
            REDACTED.to_string()
        } else {
            leaf_text(value)
        }
    }

    /// Redaction state for the children of `key`.
    fn below(&self, key: &str, value: &Value, redacted: bool) -> bool {
        redacted || (self.redact && redacts_subtree(key, value))
    }

    // ── Rendering ────────────────────────────────────────────────

    pub(crate) fn render_root(&self, value: &Value, redacted: bool, status: Option<Status>, out: &mut Vec<Line>) {
        match value {
            Value::Object(map) => self.render_map(map, 0, redacted, status, out),
            Value::Array(items) if !items.is_empty() => self.render_items(items, 0, redacted, status, out),
            leaf => out.push(Line::new(0, self.leaf(leaf, redacted), status)),
        }
    }

    fn render_entry(
        &self,
        key: &str,
        value: &Value,
        indent: usize,
        redacted: bool,
        status: Option<Status>,
        out: &mut Vec<Line>,
    ) {
        let inner = self.below(key, value, redacted);
        let key_text = string_text(key);
        match value {
            Value::Object(map) if !map.is_empty() => {
                out.push(Line::new(indent, format!("{key_text}:"), status));
                self.render_map(map, indent + 2, inner, status, out);
            }
            Value::Array(items) if !items.is_empty() => {
                out.push(Line::new(indent, format!("{key_text}:"), status));
                self.render_items(items, indent, inner, status, out);
            }
            leaf => out.push(Line::new(indent, entry_text(&key_text, &self.leaf(leaf, inner)), status)),
        }
    }

    fn render_map(
        &self,
        map: &Map<String, Value>,
        indent: usize,
        redacted: bool,
        status: Option<Status>,
        out: &mut Vec<Line>,
    ) {
        for (key, value) in map {
            self.render_entry(key, value, indent, redacted, status, out);
        }
    }

    /// Array elements render at the indent of their parent key.
    fn render_items(&self, items: &[Value], indent: usize, redacted: bool, status: Option<Status>, out: &mut Vec<Line>) {
        for item in items {
            self.render_item(item, indent, redacted, status, out);
        }
    }

    fn render_item(&self, item: &Value, indent: usize, redacted: bool, status: Option<Status>, out: &mut Vec<Line>) {
        let start = out.len();
        match item {
            Value::Object(map) if !map.is_empty() => self.render_map(map, indent + 2, redacted, status, out),
            Value::Array(items) if !items.is_empty() => self.render_items(items, indent + 2, redacted, status, out),
            leaf => out.push(Line::new(indent + 2, self.leaf(leaf, redacted), status)),
        }
        bullet(&mut out[start], indent);
    }

    // ── Diffing ──────────────────────────────────────────────────

    pub(crate) fn diff_root(&self, old: Option<&Value>, new: Option<&Value>, redacted: bool, out: &mut Vec<Line>) {
        match (old, new) {
            (Some(Value::Object(a)), Some(Value::Object(b))) => self.diff_map(a, b, 0, redacted, out),
            (Some(Value::Array(a)), Some(Value::Array(b))) if !a.is_empty() && !b.is_empty() => {
                self.diff_items(a, b, 0, redacted, out)
            }
            (Some(a), Some(b)) if a == b => {
                if self.unchanged {
                    self.render_root(a, redacted, None, out);
                }
            }
            _ => {
                if let Some(a) = old {
                    self.render_root(a, redacted, Some(Status::Removed), out);
                }
                if let Some(b) = new {
                    self.render_root(b, redacted, Some(Status::Added), out);
                }
            }
        }
    }

    /// Keys are visited old-first; keys only in `new` follow in their order.
    fn diff_map(
        &self,
        old: &Map<String, Value>,
        new: &Map<String, Value>,
        indent: usize,
        redacted: bool,
        out: &mut Vec<Line>,
    ) {
        for (key, old_value) in old {
            match new.get(key) {
                Some(new_value) => self.diff_entry(key, old_value, new_value, indent, redacted, out),
                None => self.render_entry(key, old_value, indent, redacted, Some(Status::Removed), out),
            }
        }
        for (key, new_value) in new {
            if !old.contains_key(key) {
                self.render_entry(key, new_value, indent, redacted, Some(Status::Added), out);
            }
        }
    }

    fn diff_entry(&self, key: &str, old: &Value, new: &Value, indent: usize, redacted: bool, out: &mut Vec<Line>) {
        if old == new {
            if self.unchanged {
                self.render_entry(key, new, indent, redacted, None, out);
            }
            return;
        }
        let inner = self.below(key, old, redacted) || self.below(key, new, redacted);
        let mut children = Vec::new();
        match (old, new) {
            (Value::Object(a), Value::Object(b)) if !a.is_empty() && !b.is_empty() => {
                self.diff_map(a, b, indent + 2, inner, &mut children)
            }
            (Value::Array(a), Value::Array(b)) if !a.is_empty() && !b.is_empty() => {
                self.diff_items(a, b, indent, inner, &mut children)
            }
            _ => {
                self.render_entry(key, old, indent, redacted, Some(Status::Removed), out);
                self.render_entry(key, new, indent, redacted, Some(Status::Added), out);
                return;
            }
        }
        if !children.is_empty() {
            out.push(Line::new(indent, format!("{}:", string_text(key)), None));
            out.extend(children);
        }
    }

    /// Pair elements first (by identity, else by equality), then emit in
    /// new order with unpaired old elements flushed as removals just
    /// before the next paired element that follows them.
    fn diff_items(&self, old: &[Value], new: &[Value], indent: usize, redacted: bool, out: &mut Vec<Line>) {
        let mut taken = vec![false; old.len()];
        let pairing: Vec<Option<usize>> = new
            .iter()
            .map(|item| {
                let found = match identity(item) {
                    Some(id) => old
                        .iter()
                        .enumerate()
                        .position(|(j, o)| !taken[j] && identity(o) == Some(id)),
                    None => old.iter().enumerate().position(|(j, o)| !taken[j] && o == item),
                };
                if let Some(j) = found {
                    taken[j] = true;
                }
                found
            })
            .collect();

        let mut flushed = 0;
        for (item, paired) in new.iter().zip(&pairing) {
            let Some(j) = *paired else {
                self.render_item(item, indent, redacted, Some(Status::Added), out);
                continue;
            };
            for k in flushed..j {
                if !taken[k] {
                    self.render_item(&old[k], indent, redacted, Some(Status::Removed), out);
                }
            }
            flushed = flushed.max(j + 1);
            self.diff_item(&old[j], item, indent, redacted, out);
        }
        for k in flushed..old.len() {
            if !taken[k] {
                self.render_item(&old[k], indent, redacted, Some(Status::Removed), out);
            }
        }
    }

    fn diff_item(&self, old: &Value, new: &Value, indent: usize, redacted: bool, out: &mut Vec<Line>) {
        if old == new {
            if self.unchanged {
                self.render_item(new, indent, redacted, None, out);
            }
            return;
        }
        // Paired but unequal elements always carry an identity.
        let (Some((key, id)), Value::Object(a), Value::Object(b)) = (identity(new), old, new) else {
            return;
        };
        out.push(Line::new(
            indent,
            format!("- {}", entry_text(key, &self.leaf(id, redacted))),
            None,
        ));
        self.diff_map(&without(a, key), &without(b, key), indent + 2, redacted, out);
    }
}
