//! Canonical JSON and content hashing
//!
//! Component builds are deduplicated by the SHA-256 of the canonical JSON of
//! their definition block. Canonical here means object keys sorted by their
//! UTF-8 bytes, no insignificant whitespace, and serde_json's escaping for
//! strings and numbers.

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Encodes `value` as canonical JSON.
pub fn canonical_json<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    let value = serde_json::to_value(value)?;
    let mut out = String::new();
    write_canonical(&value, &mut out)?;
    Ok(out)
}

fn write_canonical(value: &Value, out: &mut String) -> Result<(), serde_json::Error> {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|(a, _), (b, _)| a.as_bytes().cmp(b.as_bytes()));
            out.push('{');
            for (i, (key, child)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key)?);
                out.push(':');
                write_canonical(child, out)?;
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, child) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(child, out)?;
            }
            out.push(']');
        }
        scalar => out.push_str(&serde_json::to_string(scalar)?),
    }
    Ok(())
}

/// Lowercase hex SHA-256 of the canonical JSON of `value`.
pub fn definition_hash<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    let encoded = canonical_json(value)?;
    Ok(hex::encode(Sha256::digest(encoded.as_bytes())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{ComponentBuildDefinition, GitRepository};
    use serde_json::json;

    #[test]
    fn test_canonical_json_sorts_keys_and_strips_whitespace() {
        let value = json!({"b": 1, "a": {"d": [1, 2, {"z": null, "y": "s"}], "c": true}});
        assert_eq!(
            canonical_json(&value).unwrap(),
            r#"{"a":{"c":true,"d":[1,2,{"y":"s","z":null}]},"b":1}"#
        );
    }

    #[test]
    fn test_canonical_json_escapes_strings() {
        let value = json!({"k": "line\n\"quoted\" é"});
        assert_eq!(canonical_json(&value).unwrap(), "{\"k\":\"line\\n\\\"quoted\\\" é\"}");
    }

    #[test]
    fn test_hash_is_lowercase_sha256_hex() {
        // sha256("{}")
        assert_eq!(
            definition_hash(&json!({})).unwrap(),
            "44136fa355b3678a1146ad16f7e8649e94fb4fc21fe77e8310c060f61caaff8a"
        );
    }

    #[test]
    fn test_hash_ignores_key_order() {
        let a = json!({"url": "u", "commit": "c1"});
        let b = json!({"commit": "c1", "url": "u"});
        assert_eq!(definition_hash(&a).unwrap(), definition_hash(&b).unwrap());
    }

    #[test]
    fn test_build_definition_hash_depends_on_content() {
        let build = |commit: &str| ComponentBuildDefinition {
            git_repository: Some(GitRepository {
                url: "https://example.com/r.git".to_string(),
                commit: Some(commit.to_string()),
                tag: None,
            }),
            command: Some("make".to_string()),
            language: Some("go".to_string()),
            docker_image: None,
        };
        assert_eq!(
            definition_hash(&build("c1")).unwrap(),
            definition_hash(&build("c1")).unwrap()
        );
        assert_ne!(
            definition_hash(&build("c1")).unwrap(),
            definition_hash(&build("c2")).unwrap()
        );
    }
}
