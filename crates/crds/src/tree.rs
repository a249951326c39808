//! Node paths
//!
//! A node path addresses a system or service inside a definition tree,
//! e.g. `/a/b/c`. The root system is `/`.

use crate::error::DefinitionError;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

const SEPARATOR: char = '/';

/// Validated path from the root of a definition tree to one of its nodes.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(try_from = "String", into = "String")]
pub struct NodePath(String);

impl NodePath {
    /// The root path `/`.
    #[must_use]
    pub fn root() -> Self {
        Self(SEPARATOR.to_string())
    }

    /// Validates and wraps a path.
    pub fn new(path: impl Into<String>) -> Result<Self, DefinitionError> {
        let path = path.into();
        if path.is_empty() {
            return Err(DefinitionError::InvalidPath {
                path,
                reason: "path cannot be empty",
            });
        }
        if !path.starts_with(SEPARATOR) {
            return Err(DefinitionError::InvalidPath {
                path,
                reason: "path must start with '/'",
            });
        }
        if path.len() > 1 && path[1..].split(SEPARATOR).any(str::is_empty) {
            return Err(DefinitionError::InvalidPath {
                path,
                reason: "path cannot contain an empty subpath",
            });
        }
        Ok(Self(path))
    }

    /// Converts a domain (`c.b.a`) back into the path it was derived from (`/a/b/c`).
    pub fn from_domain(domain: &str) -> Result<Self, DefinitionError> {
        let path: String = domain
            .split('.')
            .rev()
            .map(|part| format!("{SEPARATOR}{part}"))
            .collect();
        Self::new(path)
    }

    /// Path of the child `name` of this node.
    #[must_use]
    pub fn child(&self, name: &str) -> Self {
        if self.is_root() {
            Self(format!("{SEPARATOR}{name}"))
        } else {
            Self(format!("{}{SEPARATOR}{name}", self.0))
        }
    }

    /// Subpaths making up this path; empty for the root.
    #[must_use]
    pub fn subpaths(&self) -> Vec<&str> {
        if self.is_root() {
            return Vec::new();
        }
        self.0[1..].split(SEPARATOR).collect()
    }

    /// Whether this is the root path.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.0.len() == 1
    }

    /// Reversed, dotted and lowercased form used for DNS-style names.
    #[must_use]
    pub fn to_domain(&self) -> String {
        self.subpaths()
            .iter()
            .rev()
            .map(|part| part.to_lowercase())
            .collect::<Vec<_>>()
            .join(".")
    }

    /// Borrow the path as a string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for NodePath {
    type Error = DefinitionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<NodePath> for String {
    fn from(value: NodePath) -> Self {
        value.0
    }
}

impl fmt::Display for NodePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_is_a_string() {
        let schema = serde_json::to_value(schemars::schema_for!(NodePath)).unwrap();
        assert_eq!(schema["type"], "string");
    }

    #[test]
    fn test_rejects_malformed_paths() {
        for bad in ["", "foo/bar", "/foo//bar", "/foo/bar/"] {
            assert!(NodePath::new(bad).is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn test_accepts_root_and_nested_paths() {
        assert!(NodePath::new("/").is_ok_and(|p| p.is_root()));
        let path = NodePath::new("/foo/Bar/BUZZ").unwrap();
        assert_eq!(path.subpaths(), vec!["foo", "Bar", "BUZZ"]);
    }

    #[test]
    fn test_child_of_root_and_nested() {
        let root = NodePath::root();
        assert_eq!(root.child("a").as_str(), "/a");
        assert_eq!(root.child("a").child("b").as_str(), "/a/b");
    }

    #[test]
    fn test_domain_conversion() {
        let path = NodePath::new("/a/B/c").unwrap();
        assert_eq!(path.to_domain(), "c.b.a");
        assert_eq!(NodePath::from_domain("c.b.a").unwrap().as_str(), "/a/b/c");
        assert!(NodePath::from_domain(".b.a").is_err());
    }

    #[test]
    fn test_serde_as_map_key() {
        let mut map = std::collections::BTreeMap::new();
        map.insert(NodePath::new("/api").unwrap(), 1);
        let json = serde_json::to_string(&map).unwrap();
        assert_eq!(json, r#"{"/api":1}"#);

        let back: std::collections::BTreeMap<NodePath, i32> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, map);
        assert!(serde_json::from_str::<NodePath>(r#""api""#).is_err());
    }
}
