//! Namespaced function identifiers.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("function key must be `namespace/name`, got {0:?}")]
    Malformed(String),
}

/// Identifies a function as `namespace/name`.
///
/// Serialized as the plain `namespace/name` string so it can be used as a
/// map key in the optimizer's JSON payloads.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FunctionKey {
    pub namespace: String,
    pub name: String,
}

impl FunctionKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// The `/function/<ns>/<name>` path prefix that routes to this function.
    pub fn path_prefix(&self) -> String {
        format!("/function/{}/{}", self.namespace, self.name)
    }
}

impl fmt::Display for FunctionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl FromStr for FunctionKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((ns, name)) if !ns.is_empty() && !name.is_empty() && !name.contains('/') => {
                Ok(Self::new(ns, name))
            }
            _ => Err(KeyError::Malformed(s.to_string())),
        }
    }
}

impl TryFrom<String> for FunctionKey {
    type Error = KeyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<FunctionKey> for String {
    fn from(key: FunctionKey) -> Self {
        key.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display_round_trip() {
        let key: FunctionKey = "openfaas-fn/figlet".parse().unwrap();
        assert_eq!(key.namespace, "openfaas-fn");
        assert_eq!(key.name, "figlet");
        assert_eq!(key.to_string(), "openfaas-fn/figlet");
    }

    #[test]
    fn rejects_missing_namespace() {
        assert!("figlet".parse::<FunctionKey>().is_err());
        assert!("/figlet".parse::<FunctionKey>().is_err());
        assert!("ns/".parse::<FunctionKey>().is_err());
        assert!("a/b/c".parse::<FunctionKey>().is_err());
    }

    #[test]
    fn serializes_as_plain_string_map_key() {
        let mut map = std::collections::BTreeMap::new();
        map.insert(FunctionKey::new("ns", "fn"), true);
        let json = serde_json::to_string(&map).unwrap();
        assert_eq!(json, r#"{"ns/fn":true}"#);

        let back: std::collections::BTreeMap<FunctionKey, bool> =
            serde_json::from_str(&json).unwrap();
        assert_eq!(back, map);
    }

    #[test]
    fn path_prefix() {
        let key = FunctionKey::new("foo", "bar");
        assert_eq!(key.path_prefix(), "/function/foo/bar");
    }
}
