//! `((name))` placeholders.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};

use crate::error::{ResolveError, ResolveResult};

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\(\(([-\w/.:!]+)\)\)").expect("placeholder pattern compiles"));

/// A parsed `((!name.path.to.key))` reference.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Placeholder {
    /// Text between the parentheses.
    pub raw: String,
    /// Variable name, without the `!` prefix or the key path.
    pub name: String,
    /// Keys selected inside the variable's value (`((cert.ca))`).
    pub path: Vec<String>,
}

impl Placeholder {
    pub fn parse(raw: &str) -> ResolveResult<Self> {
        let body = raw.strip_prefix('!').unwrap_or(raw);
        let mut parts = body.split('.');
        let name = parts.next().unwrap_or_default();
        let path: Vec<String> = parts.map(str::to_string).collect();
        if name.is_empty() || path.iter().any(String::is_empty) {
            return Err(ResolveError::InvalidPlaceholder(raw.to_string()));
        }
        Ok(Self {
            raw: raw.to_string(),
            name: name.to_string(),
            path,
        })
    }

    /// Pick the referenced part of a variable's value.
    pub fn select(&self, value: &Value) -> ResolveResult<Value> {
        let mut current = value;
        for key in &self.path {
            current = current
                .get(key)
                .ok_or_else(|| ResolveError::VariableNotFound(self.raw.clone()))?;
        }
        Ok(current.clone())
    }
}

/// Every placeholder referenced anywhere in `value`, sorted and deduplicated.
pub fn placeholders(value: &Value) -> ResolveResult<Vec<Placeholder>> {
    let mut found = Vec::new();
    collect(value, &mut found)?;
    found.sort();
    found.dedup();
    Ok(found)
}

fn collect(value: &Value, out: &mut Vec<Placeholder>) -> ResolveResult<()> {
    match value {
        Value::String(s) => {
            for caps in PLACEHOLDER.captures_iter(s) {
                out.push(Placeholder::parse(&caps[1])?);
            }
        }
        Value::Array(items) => {
            for item in items {
                collect(item, out)?;
            }
        }
        Value::Object(map) => {
            for item in map.values() {
                collect(item, out)?;
            }
        }
        _ => {}
    }
    Ok(())
}

/// Replace placeholders in every string of `value`.
///
/// A string that is exactly one placeholder takes the variable's value
/// with its type. Placeholders embedded in longer text are spliced in as
/// text and must resolve to scalars.
pub fn interpolate<F>(value: &Value, lookup: &mut F) -> ResolveResult<Value>
where
    F: FnMut(&Placeholder) -> ResolveResult<Value>,
{
    match value {
        Value::String(s) => interpolate_str(s, lookup),
        Value::Array(items) => items
            .iter()
            .map(|item| interpolate(item, lookup))
            .collect::<ResolveResult<Vec<_>>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (key, item) in map {
                out.insert(key.clone(), interpolate(item, lookup)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

fn interpolate_str<F>(s: &str, lookup: &mut F) -> ResolveResult<Value>
where
    F: FnMut(&Placeholder) -> ResolveResult<Value>,
{
    if let Some(caps) = PLACEHOLDER.captures(s)
        && caps[0].len() == s.len()
    {
        return lookup(&Placeholder::parse(&caps[1])?);
    }

    let mut out = String::with_capacity(s.len());
    let mut last = 0;
    for caps in PLACEHOLDER.captures_iter(s) {
        let Some(whole) = caps.get(0) else { continue };
        out.push_str(&s[last..whole.start()]);
        let placeholder = Placeholder::parse(&caps[1])?;
        match lookup(&placeholder)? {
            Value::String(text) => out.push_str(&text),
            Value::Number(n) => out.push_str(&n.to_string()),
            Value::Bool(b) => out.push_str(&b.to_string()),
            _ => return Err(ResolveError::NonScalarInterpolation(placeholder.raw)),
        }
        last = whole.end();
    }
    if last == 0 {
        return Ok(Value::String(s.to_string()));
    }
    out.push_str(&s[last..]);
    Ok(Value::String(out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars(p: &Placeholder) -> ResolveResult<Value> {
        let value = match p.name.as_str() {
            "db_password" => json!("s3cret"),
            "port" => json!(5432),
            "cert" => json!({"ca": "CA", "certificate": "CERT"}),
            _ => return Err(ResolveError::VariableNotFound(p.name.clone())),
        };
        p.select(&value)
    }

    #[test]
    fn finds_placeholders_everywhere() {
        let doc = json!({
            "a": "((db_password))",
            "b": ["x", {"c": "host:((port))/((!port))"}],
            "d": "((cert.ca))",
            "e": 1
        });
        let names: Vec<String> = placeholders(&doc).unwrap().into_iter().map(|p| p.raw).collect();
        assert_eq!(names, vec!["!port", "cert.ca", "db_password", "port"]);
    }

    #[test]
    fn whole_string_placeholders_keep_their_type() {
        let doc = json!({"port": "((port))", "tls": "((cert))", "ca": "((cert.ca))"});
        let out = interpolate(&doc, &mut vars).unwrap();
        assert_eq!(
            out,
            json!({"port": 5432, "tls": {"ca": "CA", "certificate": "CERT"}, "ca": "CA"})
        );
    }

    #[test]
    fn embedded_placeholders_are_spliced_as_text() {
        let doc = json!("postgres://admin:((db_password))@db:((port))/app");
        assert_eq!(
            interpolate(&doc, &mut vars).unwrap(),
            json!("postgres://admin:s3cret@db:5432/app")
        );
        let err = interpolate(&json!("tls=((cert))"), &mut vars).unwrap_err();
        assert!(matches!(err, ResolveError::NonScalarInterpolation(ref raw) if raw == "cert"));
    }

    #[test]
    fn missing_variables_and_paths_fail() {
        assert!(matches!(
            interpolate(&json!("((nope))"), &mut vars),
            Err(ResolveError::VariableNotFound(_))
        ));
        assert!(matches!(
            interpolate(&json!("((cert.private_key))"), &mut vars),
            Err(ResolveError::VariableNotFound(_))
        ));
        assert!(matches!(Placeholder::parse("a..b"), Err(ResolveError::InvalidPlaceholder(_))));
    }
}
