//! YAML-like text for leaves, and whole-document rendering.

use serde_json::Value;

use crate::diff::Differ;

/// Render a document as the lines a diff against an empty document would
/// mark added.
pub fn render(value: &Value) -> Vec<String> {
    let mut out = Vec::new();
    Differ::unredacted().render_root(value, false, None, &mut out);
    out.into_iter().map(|line| line.to_string()).collect()
}

/// Whether `value` renders on a single line.
pub(crate) fn is_leaf(value: &Value) -> bool {
    match value {
        Value::Object(map) => map.is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => true,
    }
}

pub(crate) fn leaf_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => string_text(s),
        Value::Array(_) => "[]".to_string(),
        Value::Object(_) => "{}".to_string(),
    }
}

/// A string as a plain YAML scalar when that reads back unchanged,
/// otherwise double-quoted.
pub(crate) fn string_text(s: &str) -> String {
    let plain = !s.is_empty()
        && !s.contains('\n')
        && s.trim() == s
        && matches!(
            serde_yaml::from_str::<serde_yaml::Value>(s),
            Ok(serde_yaml::Value::String(parsed)) if parsed == s
        );
    if plain {
        s.to_string()
    } else {
        Value::String(s.to_string()).to_string()
    }
}

/// `key: value`, or `key:` when the value renders empty.
pub(crate) fn entry_text(key: &str, value: &str) -> String {
    if value.is_empty() {
        format!("{key}:")
    } else {
        format!("{key}: {value}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ambiguous_strings_are_quoted() {
        assert_eq!(string_text("Tashkent"), "Tashkent");
        assert_eq!(string_text("10.10.0.0/24"), "10.10.0.0/24");
        assert_eq!(string_text("123"), "\"123\"");
        assert_eq!(string_text("true"), "\"true\"");
        assert_eq!(string_text(""), "\"\"");
        assert_eq!(string_text("a: b"), "\"a: b\"");
        assert_eq!(string_text("two\nlines"), "\"two\\nlines\"");
    }

    #[test]
    fn renders_nested_documents() {
        let doc = json!({
            "name": "dep",
            "azs": [{"name": "z1", "cloud_properties": {"datacenters": [{"name": "dc1"}]}}],
            "matrix": [["a", "b"], []],
            "empty": {},
            "nothing": null
        });
        assert_eq!(
            render(&doc),
            vec![
                "name: dep",
                "azs:",
                "- name: z1",
                "  cloud_properties:",
                "    datacenters:",
                "    - name: dc1",
                "matrix:",
                "- - a",
                "  - b",
                "- []",
                "empty: {}",
                "nothing:",
            ]
        );
    }
}
