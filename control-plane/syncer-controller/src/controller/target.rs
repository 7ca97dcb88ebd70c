//! Kind-specific knowledge about target objects: how to render one from a
//! source payload, which parts of it the controller manages, and who owns it.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Debug;

use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use k8s_openapi::{ByteString, NamespaceResourceScope};
use kube::api::ObjectMeta;
use kube::{Resource, ResourceExt};
use syncer_models::{
    MANAGED_LABELS_ANNOTATION, OWNER_LABEL, SOURCE_ANNOTATION, SyncSource, TargetKind,
};

/// A namespaced kind the controller can write for a `SyncSource`.
pub trait ManagedTarget:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + Debug
    + Send
    + Sync
    + 'static
{
    const KIND: TargetKind;

    fn render(metadata: ObjectMeta, data: &BTreeMap<String, String>) -> Self;

    /// Payload equality, ignoring representation differences such as an
    /// absent vs. empty data map.
    fn payload_eq(observed: &Self, desired: &Self) -> bool;

    /// Overwrite the payload of `observed` with the payload of `desired`.
    fn copy_payload(desired: &Self, observed: &mut Self);
}

impl ManagedTarget for ConfigMap {
    const KIND: TargetKind = TargetKind::ConfigMap;

    fn render(metadata: ObjectMeta, data: &BTreeMap<String, String>) -> Self {
        ConfigMap {
            metadata,
            data: Some(data.clone()),
            ..Default::default()
        }
    }

    fn payload_eq(observed: &Self, desired: &Self) -> bool {
        let empty = BTreeMap::new();
        observed.data.as_ref().unwrap_or(&empty) == desired.data.as_ref().unwrap_or(&empty)
            && observed
                .binary_data
                .as_ref()
                .is_none_or(|b| b.is_empty())
    }

    fn copy_payload(desired: &Self, observed: &mut Self) {
        observed.data = desired.data.clone();
        observed.binary_data = None;
    }
}

impl ManagedTarget for Secret {
    const KIND: TargetKind = TargetKind::Secret;

    fn render(metadata: ObjectMeta, data: &BTreeMap<String, String>) -> Self {
        Secret {
            metadata,
            type_: Some("Opaque".to_string()),
            data: Some(
                data.iter()
                    .map(|(k, v)| (k.clone(), ByteString(v.as_bytes().to_vec())))
                    .collect(),
            ),
            ..Default::default()
        }
    }

    fn payload_eq(observed: &Self, desired: &Self) -> bool {
        let empty = BTreeMap::new();
        observed.data.as_ref().unwrap_or(&empty) == desired.data.as_ref().unwrap_or(&empty)
            && observed
                .string_data
                .as_ref()
                .is_none_or(|s| s.is_empty())
    }

    fn copy_payload(desired: &Self, observed: &mut Self) {
        observed.data = desired.data.clone();
        observed.string_data = None;
    }
}

/// Metadata every target of `source` carries: the user labels plus the
/// owner label, and the back-reference annotations.
pub fn target_metadata(source: &SyncSource, namespace: &str) -> ObjectMeta {
    let mut labels = source.spec.labels.clone();
    labels.insert(
        OWNER_LABEL.to_string(),
        source.uid().unwrap_or_default(),
    );
    let managed: Vec<&str> = source.spec.labels.keys().map(String::as_str).collect();
    let mut annotations = BTreeMap::new();
    annotations.insert(SOURCE_ANNOTATION.to_string(), source.key().to_string());
    annotations.insert(MANAGED_LABELS_ANNOTATION.to_string(), managed.join(","));
    ObjectMeta {
        name: Some(source.target_name()),
        namespace: Some(namespace.to_string()),
        labels: Some(labels),
        annotations: Some(annotations),
        ..Default::default()
    }
}

/// Label keys a previous reconcile recorded as controller-managed.
pub fn managed_label_keys<K: Resource>(obj: &K) -> BTreeSet<String> {
    obj.annotations()
        .get(MANAGED_LABELS_ANNOTATION)
        .map(|v| {
            v.split(',')
                .filter(|k| !k.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Labels we set earlier that the desired object no longer carries.
fn stale_labels<K: Resource>(observed: &K, desired: &K) -> Vec<String> {
    let previous = managed_label_keys(observed);
    previous
        .into_iter()
        .filter(|k| k != OWNER_LABEL && !desired.labels().contains_key(k))
        .filter(|k| observed.labels().contains_key(k))
        .collect()
}

fn contains_all(have: &BTreeMap<String, String>, want: &BTreeMap<String, String>) -> bool {
    want.iter().all(|(k, v)| have.get(k) == Some(v))
}

/// True when every managed field of `observed` already matches `desired`.
/// Fields the controller does not manage are ignored.
pub fn managed_eq<K: ManagedTarget>(observed: &K, desired: &K) -> bool {
    K::payload_eq(observed, desired)
        && contains_all(observed.labels(), desired.labels())
        && contains_all(observed.annotations(), desired.annotations())
        && stale_labels(observed, desired).is_empty()
}

/// `observed` with the managed fields of `desired` applied. Keeps the
/// observed resourceVersion so the write is conditional.
pub fn merge_managed<K: ManagedTarget>(observed: &K, desired: &K) -> K {
    let mut merged = observed.clone();
    K::copy_payload(desired, &mut merged);
    for key in stale_labels(observed, desired) {
        merged.labels_mut().remove(&key);
    }
    for (k, v) in desired.labels() {
        merged.labels_mut().insert(k.clone(), v.clone());
    }
    for (k, v) in desired.annotations() {
        merged.annotations_mut().insert(k.clone(), v.clone());
    }
    merged
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Ownership {
    /// Owner label carries the source UID
    Owned,
    /// Annotation names the source but the UID is from an earlier
    /// incarnation of it
    Adoptable,
    /// Belongs to someone else; the value describes who
    Foreign(String),
}

/// Identity a source stamps on its targets.
#[derive(Clone, Debug)]
pub struct Owner {
    uid: String,
    key: String,
}

impl Owner {
    pub fn of(source: &SyncSource) -> Self {
        Self {
            uid: source.uid().unwrap_or_default(),
            key: source.key().to_string(),
        }
    }

    pub fn ownership<K: Resource>(&self, obj: &K) -> Ownership {
        if obj.labels().get(OWNER_LABEL) == Some(&self.uid) {
            return Ownership::Owned;
        }
        match obj.annotations().get(SOURCE_ANNOTATION) {
            Some(key) if *key == self.key => Ownership::Adoptable,
            Some(other) => Ownership::Foreign(format!("SyncSource {other}")),
            None => Ownership::Foreign("an unmanaged object".to_string()),
        }
    }

    pub fn owns<K: Resource>(&self, obj: &K) -> bool {
        !matches!(self.ownership(obj), Ownership::Foreign(_))
    }
}
