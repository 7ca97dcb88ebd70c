//! Desired state: which namespaces a source targets and what each target
//! should look like.

use std::collections::BTreeSet;

use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Secret};
use kube::ResourceExt;
use syncer_models::{OWNER_LABEL, SyncSource, TargetKind, TargetRef};

use super::target::{ManagedTarget, target_metadata};
use crate::store::{ObjectCache, Selector};

/// Resolves the set of destination namespaces for a source.
pub trait DestinationPolicy: Send + Sync {
    fn destinations(
        &self,
        source: &SyncSource,
        namespaces: &dyn ObjectCache<Namespace>,
    ) -> Destinations;
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Destinations {
    /// Existing, non-terminating namespaces to write into
    pub resolved: BTreeSet<String>,
    /// Explicitly listed namespaces that do not exist
    pub missing: BTreeSet<String>,
}

/// Explicit `destinations` plus every namespace matching
/// `namespaceSelector`. Terminating namespaces are skipped.
#[derive(Clone, Copy, Debug, Default)]
pub struct SpecDestinations;

impl DestinationPolicy for SpecDestinations {
    fn destinations(
        &self,
        source: &SyncSource,
        namespaces: &dyn ObjectCache<Namespace>,
    ) -> Destinations {
        let mut out = Destinations::default();
        for ns in &source.spec.destinations {
            match namespaces.get("", ns) {
                Some(found) if !is_terminating(&found) => {
                    out.resolved.insert(ns.clone());
                }
                Some(_) => {}
                None => {
                    out.missing.insert(ns.clone());
                }
            }
        }
        // An empty selector would match every namespace; treat it as unset.
        if let Some(labels) = source
            .spec
            .namespace_selector
            .as_ref()
            .filter(|l| !l.is_empty())
        {
            let selector = Selector {
                match_labels: labels.clone(),
                ..Default::default()
            };
            for ns in namespaces.list(&selector) {
                if !is_terminating(&ns) {
                    out.resolved.insert(ns.name_any());
                }
            }
        }
        out
    }
}

pub fn is_terminating(ns: &Namespace) -> bool {
    ns.metadata.deletion_timestamp.is_some()
        || ns.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Terminating")
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("destination `{0}` is not a valid namespace name")]
    InvalidNamespace(String),
    #[error("target name `{0}` is not a valid object name")]
    InvalidTargetName(String),
    #[error("data key `{0}` is not a valid key")]
    InvalidDataKey(String),
    #[error("label `{0}` is not a valid label")]
    InvalidLabel(String),
    #[error("label `{0}` is reserved for the controller")]
    ReservedLabel(String),
}

/// Check the parts of a source the API server schema cannot.
pub fn validate(source: &SyncSource) -> Result<(), ValidationError> {
    for ns in &source.spec.destinations {
        if !is_dns1123_label(ns) {
            return Err(ValidationError::InvalidNamespace(ns.clone()));
        }
    }
    let name = source.target_name();
    if !is_dns1123_subdomain(&name) {
        return Err(ValidationError::InvalidTargetName(name));
    }
    if let Some(key) = source.spec.data.keys().find(|k| !is_data_key(k)) {
        return Err(ValidationError::InvalidDataKey(key.clone()));
    }
    if source.spec.labels.contains_key(OWNER_LABEL) {
        return Err(ValidationError::ReservedLabel(OWNER_LABEL.to_string()));
    }
    if let Some((k, v)) = source
        .spec
        .labels
        .iter()
        .find(|(k, v)| !is_label_key(k) || !is_label_value(v))
    {
        return Err(ValidationError::InvalidLabel(format!("{k}={v}")));
    }
    Ok(())
}

fn is_label_segment(s: &str) -> bool {
    let bytes = s.as_bytes();
    let alnum = |b: &u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    match (bytes.first(), bytes.last()) {
        (Some(first), Some(last)) => {
            alnum(first) && alnum(last) && bytes.iter().all(|b| alnum(b) || *b == b'-')
        }
        _ => false,
    }
}

pub fn is_dns1123_label(s: &str) -> bool {
    s.len() <= 63 && is_label_segment(s)
}

pub fn is_dns1123_subdomain(s: &str) -> bool {
    s.len() <= 253 && s.split('.').all(is_label_segment)
}

/// `[-._a-zA-Z0-9]`, alphanumeric at both ends, at most 63 bytes.
fn is_label_name(s: &str) -> bool {
    let bytes = s.as_bytes();
    match (bytes.first(), bytes.last()) {
        (Some(first), Some(last)) => {
            s.len() <= 63
                && first.is_ascii_alphanumeric()
                && last.is_ascii_alphanumeric()
                && bytes
                    .iter()
                    .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
        }
        _ => false,
    }
}

/// Optional DNS subdomain prefix, then `/` and a label name.
pub fn is_label_key(s: &str) -> bool {
    match s.split_once('/') {
        Some((prefix, name)) => is_dns1123_subdomain(prefix) && is_label_name(name),
        None => is_label_name(s),
    }
}

pub fn is_label_value(s: &str) -> bool {
    s.is_empty() || is_label_name(s)
}

/// ConfigMap and Secret keys: `[-._a-zA-Z0-9]+`, at most 253 bytes.
pub fn is_data_key(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= 253
        && s != "."
        && s != ".."
        && s
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_'))
}

/// Everything a source should produce, sorted for deterministic writes.
#[derive(Clone, Debug, Default)]
pub struct DesiredState {
    pub config_maps: Vec<ConfigMap>,
    pub secrets: Vec<Secret>,
    pub missing: Vec<String>,
}

impl DesiredState {
    pub fn targets(&self) -> Vec<TargetRef> {
        let mut refs: Vec<TargetRef> = self
            .config_maps
            .iter()
            .map(target_ref)
            .chain(self.secrets.iter().map(target_ref))
            .collect();
        refs.sort();
        refs
    }
}

pub fn target_ref<K: ManagedTarget>(obj: &K) -> TargetRef {
    TargetRef {
        kind: K::KIND,
        namespace: obj.namespace().unwrap_or_default(),
        name: obj.name_any(),
    }
}

fn render_all<K: ManagedTarget>(source: &SyncSource, namespaces: &BTreeSet<String>) -> Vec<K> {
    namespaces
        .iter()
        .map(|ns| K::render(target_metadata(source, ns), &source.spec.data))
        .collect()
}

/// Pure function of the source and the namespace cache.
pub fn compute(
    source: &SyncSource,
    namespaces: &dyn ObjectCache<Namespace>,
    policy: &dyn DestinationPolicy,
) -> Result<DesiredState, ValidationError> {
    validate(source)?;
    let dests = policy.destinations(source, namespaces);
    let mut state = DesiredState {
        missing: dests.missing.into_iter().collect(),
        ..Default::default()
    };
    match source.spec.target_kind {
        TargetKind::ConfigMap => state.config_maps = render_all(source, &dests.resolved),
        TargetKind::Secret => state.secrets = render_all(source, &dests.resolved),
    }
    Ok(state)
}
