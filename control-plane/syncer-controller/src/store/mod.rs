//! Kind-generic read (cache) and write capabilities the reconciler works
//! against. Implemented once over kube reflector stores and the API server
//! (`cluster`), and once in memory for tests (`memory`).

pub mod cluster;
pub mod memory;

use std::collections::BTreeMap;
use std::sync::Arc;

use kube::ResourceExt;
use async_trait::async_trait;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    /// Version mismatch or an object that already exists
    #[error("conflict: {0}")]
    Conflict(String),
    /// The store rejected the object as malformed
    #[error("invalid: {0}")]
    Invalid(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Read-only, eventually consistent view of one object kind.
pub trait ObjectCache<K>: Send + Sync {
    /// Cluster-scoped objects are looked up with an empty namespace.
    fn get(&self, namespace: &str, name: &str) -> Option<Arc<K>>;

    fn list(&self, selector: &Selector) -> Vec<Arc<K>>;
}

/// Writes against the authoritative store. `update` carries the expected
/// version in `metadata.resourceVersion`.
#[async_trait]
pub trait ObjectWriter<K>: Send + Sync {
    /// Read straight from the authoritative store, bypassing the cache.
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>, StoreError>;

    async fn create(&self, obj: &K) -> Result<K, StoreError>;

    async fn update(&self, obj: &K) -> Result<K, StoreError>;

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), StoreError>;

    /// Write only the status subresource.
    async fn update_status(&self, obj: &K) -> Result<K, StoreError>;
}

/// Label selector: every `match_labels` pair must be present with the same
/// value, every key in `exists` must be present.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Selector {
    pub match_labels: BTreeMap<String, String>,
    pub exists: Vec<String>,
}

impl Selector {
    pub fn everything() -> Self {
        Self::default()
    }

    pub fn has_label(key: &str) -> Self {
        Self {
            exists: vec![key.to_string()],
            ..Default::default()
        }
    }

    pub fn label_eq(key: &str, value: &str) -> Self {
        Self {
            match_labels: [(key.to_string(), value.to_string())]
                .into_iter()
                .collect(),
            ..Default::default()
        }
    }

    pub fn matches_labels(&self, labels: &BTreeMap<String, String>) -> bool {
        self.match_labels
            .iter()
            .all(|(k, v)| labels.get(k) == Some(v))
            && self.exists.iter().all(|k| labels.contains_key(k))
    }

    pub fn matches<K: ResourceExt>(&self, obj: &K) -> bool {
        self.matches_labels(obj.labels())
    }
}

/// Cache and writer for one kind, bundled for the converge helpers.
pub struct KindStore<K> {
    pub cache: Arc<dyn ObjectCache<K>>,
    pub writer: Arc<dyn ObjectWriter<K>>,
}

impl<K> Clone for KindStore<K> {
    fn clone(&self) -> Self {
        Self {
            cache: self.cache.clone(),
            writer: self.writer.clone(),
        }
    }
}

impl<K> KindStore<K> {
    pub fn new(
        cache: Arc<dyn ObjectCache<K>>,
        writer: Arc<dyn ObjectWriter<K>>,
    ) -> Self {
        Self { cache, writer }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn everything_matches_anything() {
        assert!(Selector::everything().matches_labels(&BTreeMap::new()));
        assert!(Selector::everything().matches_labels(&labels(&[("a", "b")])));
    }

    #[test]
    fn label_eq_and_exists() {
        let l = labels(&[("team", "a"), ("oaas.io/sync-owner", "uid-1")]);
        assert!(Selector::label_eq("team", "a").matches_labels(&l));
        assert!(!Selector::label_eq("team", "b").matches_labels(&l));
        assert!(Selector::has_label("oaas.io/sync-owner").matches_labels(&l));
        assert!(!Selector::has_label("missing").matches_labels(&l));
    }
}
