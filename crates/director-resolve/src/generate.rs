//! Values for declared `variables:` that have never been versioned.
//!
//! Credentials generated here are opaque random material shaped like the
//! real thing. Issuing actual certificates and keys is the job of an
//! external config server.

use director_core::manifest::VariableSpec;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::error::{ResolveError, ResolveResult};

const DEFAULT_PASSWORD_LENGTH: usize = 20;

pub fn generate(spec: &VariableSpec) -> ResolveResult<Value> {
    let value = match spec.kind.as_str() {
        "password" => {
            let length = spec
                .options
                .get("length")
                .and_then(Value::as_u64)
                .map_or(DEFAULT_PASSWORD_LENGTH, |n| n as usize);
            Value::String(random_token(length))
        }
        "user" => {
            let username = spec
                .options
                .get("username")
                .and_then(Value::as_str)
                .map_or_else(|| spec.name.clone(), str::to_string);
            json!({"username": username, "password": random_token(DEFAULT_PASSWORD_LENGTH)})
        }
        "certificate" => {
            let seed = random_token(32);
            json!({
                "ca": pem("CERTIFICATE", &format!("ca/{seed}")),
                "certificate": pem("CERTIFICATE", &format!("cert/{seed}")),
                "private_key": pem("RSA PRIVATE KEY", &format!("key/{seed}")),
            })
        }
        "rsa" => {
            let seed = random_token(32);
            json!({
                "private_key": pem("RSA PRIVATE KEY", &format!("private/{seed}")),
                "public_key": pem("PUBLIC KEY", &format!("public/{seed}")),
            })
        }
        "ssh" => {
            let seed = random_token(32);
            let public_key = format!("ssh-rsa {}", digest(&format!("public/{seed}")));
            json!({
                "private_key": pem("RSA PRIVATE KEY", &format!("private/{seed}")),
                "public_key_fingerprint": fingerprint(&public_key),
                "public_key": public_key,
            })
        }
        other => {
            return Err(ResolveError::UnsupportedType {
                name: spec.name.clone(),
                kind: other.to_string(),
            });
        }
    };
    Ok(value)
}

fn random_token(length: usize) -> String {
    let mut token = String::with_capacity(length + 32);
    while token.len() < length {
        token.push_str(&uuid::Uuid::new_v4().simple().to_string());
    }
    token.truncate(length);
    token
}

fn digest(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}

fn pem(label: &str, seed: &str) -> String {
    format!("-----BEGIN {label}-----\n{}\n-----END {label}-----\n", digest(seed))
}

/// `aa:bb:...` over the first 16 digest bytes.
fn fingerprint(public_key: &str) -> String {
    let bytes = Sha256::digest(public_key.as_bytes());
    bytes[..16]
        .iter()
        .map(|b| hex::encode([*b]))
        .collect::<Vec<_>>()
        .join(":")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    fn spec(kind: &str, options: Value) -> VariableSpec {
        VariableSpec {
            name: "v".to_string(),
            kind: kind.to_string(),
            options: options.as_object().cloned().unwrap_or_else(Map::new),
        }
    }

    #[test]
    fn passwords_honor_length_and_differ() {
        let a = generate(&spec("password", json!({}))).unwrap();
        let b = generate(&spec("password", json!({}))).unwrap();
        assert_eq!(a.as_str().unwrap().len(), 20);
        assert_ne!(a, b);
        let long = generate(&spec("password", json!({"length": 50}))).unwrap();
        assert_eq!(long.as_str().unwrap().len(), 50);
    }

    #[test]
    fn structured_credentials_have_expected_keys() {
        let cert = generate(&spec("certificate", json!({"is_ca": true}))).unwrap();
        for key in ["ca", "certificate", "private_key"] {
            assert!(cert[key].as_str().unwrap().starts_with("-----BEGIN"));
        }
        let ssh = generate(&spec("ssh", json!({}))).unwrap();
        assert!(ssh["public_key"].as_str().unwrap().starts_with("ssh-rsa "));
        assert_eq!(ssh["public_key_fingerprint"].as_str().unwrap().split(':').count(), 16);
        let user = generate(&spec("user", json!({"username": "admin"}))).unwrap();
        assert_eq!(user["username"], "admin");
    }

    #[test]
    fn unknown_types_are_rejected() {
        assert!(matches!(
            generate(&spec("blob", json!({}))),
            Err(ResolveError::UnsupportedType { .. })
        ));
    }
}
