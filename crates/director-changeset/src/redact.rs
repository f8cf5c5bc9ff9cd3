//! Sensitive value detection and redaction.

use serde_json::{Map, Value};

/// Placeholder rendered in place of a redacted value.
pub const REDACTED: &str = "<redacted>";

/// Hash keys whose whole subtree is treated as sensitive.
const SENSITIVE_SECTIONS: &[&str] = &["properties", "env"];

const SENSITIVE_WORDS: &[&str] = &["password", "secret", "token", "credential"];

/// Whether a key name alone marks its value as sensitive.
pub fn is_sensitive_key(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    key == "key" || key.ends_with("_key") || SENSITIVE_WORDS.iter().any(|w| key.contains(w))
}

/// Whether every leaf below `key` should be hidden.
///
/// `properties` and `env` only count when they hold a hash.
pub fn redacts_subtree(key: &str, value: &Value) -> bool {
    (SENSITIVE_SECTIONS.contains(&key) && value.is_object()) || is_sensitive_key(key)
}

/// Copy of `value` with every sensitive leaf replaced by [`REDACTED`].
pub fn redact_properties(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (key, child) in map {
                let child = if redacts_subtree(key, child) {
                    redact_all(child)
                } else {
                    redact_properties(child)
                };
                out.insert(key.clone(), child);
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(redact_properties).collect()),
        other => other.clone(),
    }
}

fn redact_all(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), redact_all(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(redact_all).collect()),
        _ => Value::String(REDACTED.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sensitive_names() {
        assert!(is_sensitive_key("password"));
        assert!(is_sensitive_key("admin_password"));
        assert!(is_sensitive_key("private_key"));
        assert!(is_sensitive_key("client_secret"));
        assert!(!is_sensitive_key("keys"));
        assert!(!is_sensitive_key("name"));
    }

    #[test]
    fn properties_and_env_are_redacted_at_every_level() {
        let manifest = json!({
            "name": "dep",
            "properties": {"cc": {"port": 9022, "hosts": ["a", "b"]}},
            "instance_groups": [{
                "name": "web",
                "instances": 2,
                "env": {"bosh": {"password": "foo"}},
                "jobs": [{"name": "nginx", "properties": {"tls": true}}]
            }]
        });
        let redacted = redact_properties(&manifest);
        assert_eq!(
            redacted,
            json!({
                "name": "dep",
                "properties": {"cc": {"port": "<redacted>", "hosts": ["<redacted>", "<redacted>"]}},
                "instance_groups": [{
                    "name": "web",
                    "instances": 2,
                    "env": {"bosh": {"password": "<redacted>"}},
                    "jobs": [{"name": "nginx", "properties": {"tls": "<redacted>"}}]
                }]
            })
        );
    }

    #[test]
    fn properties_that_are_not_a_hash_are_left_alone() {
        let manifest = json!({"properties": "plain", "env": ["x"]});
        assert_eq!(redact_properties(&manifest), manifest);
    }
}
