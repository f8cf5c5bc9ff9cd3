//! Structured lock names: `lock:<type>:<resource components joined by ':'>`.

use serde::Serialize;

pub fn lock_name(kind: &str, resource: &[&str]) -> String {
    let mut name = format!("lock:{kind}");
    for part in resource {
        name.push(':');
        name.push_str(part);
    }
    name
}

pub fn deployment_lock(deployment: &str) -> String {
    lock_name("deployment", &[deployment])
}

pub fn release_lock(release: &str) -> String {
    lock_name("release", &[release])
}

pub fn stemcell_lock(name: &str, version: &str) -> String {
    lock_name("stemcells", &[name, version])
}

pub fn compile_lock(package_fingerprint: &str, stemcell_os: &str, stemcell_version: &str) -> String {
    lock_name("compile", &[package_fingerprint, stemcell_os, stemcell_version])
}

/// A lock name split into its type and resource components.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParsedLockName {
    #[serde(rename = "type")]
    pub kind: String,
    pub resource: Vec<String>,
}

pub fn parse_lock_name(name: &str) -> Option<ParsedLockName> {
    let rest = name.strip_prefix("lock:")?;
    let mut parts = rest.split(':');
    let kind = parts.next().filter(|k| !k.is_empty())?.to_string();
    Some(ParsedLockName {
        kind,
        resource: parts.map(str::to_string).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_round_trip_through_parse() {
        assert_eq!(deployment_lock("test-deployment"), "lock:deployment:test-deployment");
        let parsed = parse_lock_name(&compile_lock("abc", "ubuntu", "1.2")).unwrap();
        assert_eq!(parsed.kind, "compile");
        assert_eq!(parsed.resource, vec!["abc", "ubuntu", "1.2"]);
        assert!(parse_lock_name("deployment:foo").is_none());
        assert!(parse_lock_name("lock:").is_none());
    }
}
