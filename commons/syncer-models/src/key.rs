use std::fmt;
use std::str::FromStr;

use kube::{Resource, ResourceExt};

/// Namespace/name pair identifying a namespaced object. Used as the unit of
/// work on the controller queue.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key of any resource; cluster-scoped objects get an empty namespace.
    pub fn of<K: Resource>(obj: &K) -> Self {
        Self {
            namespace: obj.namespace().unwrap_or_default(),
            name: obj.name_any(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
#[error("malformed object key `{0}`, expected <namespace>/<name>")]
pub struct KeyParseError(pub String);

impl FromStr for ObjectKey {
    type Err = KeyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((ns, name))
                if !ns.is_empty() && !name.is_empty() && !name.contains('/') =>
            {
                Ok(ObjectKey::new(ns, name))
            }
            _ => Err(KeyParseError(s.to_string())),
        }
    }
}
