//! In-memory store with the same optimistic-concurrency and finalizer
//! semantics as the API server. Splits the authoritative objects from the
//! informer view so stale caches can be simulated; counts writes and can
//! inject failures.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::{Resource, ResourceExt};
use syncer_models::SyncSource;

use super::{ObjectCache, ObjectWriter, Selector, StoreError};

/// Kinds with a status subresource keep spec and status writes apart.
pub trait StatusSubresource {
    fn copy_status(_from: &Self, _to: &mut Self) {}
}

impl StatusSubresource for ConfigMap {}
impl StatusSubresource for Secret {}
impl StatusSubresource for Namespace {}

impl StatusSubresource for SyncSource {
    fn copy_status(from: &Self, to: &mut Self) {
        to.status = from.status.clone();
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteOp {
    Create,
    Update,
    Delete,
    UpdateStatus,
}

/// Number of write attempts per operation, failed ones included.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WriteCalls {
    pub create: usize,
    pub update: usize,
    pub delete: usize,
    pub update_status: usize,
}

impl WriteCalls {
    pub fn total(&self) -> usize {
        self.create + self.update + self.delete + self.update_status
    }
}

type Key = (String, String);

struct MemState<K> {
    objects: BTreeMap<Key, K>,
    cache: BTreeMap<Key, Arc<K>>,
    auto_sync: bool,
    cache_selector: Option<Selector>,
    next_version: u64,
    next_uid: u64,
    calls: WriteCalls,
    failures: VecDeque<(WriteOp, StoreError)>,
}

pub struct MemoryStore<K> {
    state: Arc<Mutex<MemState<K>>>,
}

impl<K> Clone for MemoryStore<K> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

fn key_of<K: Resource>(obj: &K) -> Key {
    (obj.namespace().unwrap_or_default(), obj.name_any())
}

fn describe(key: &Key) -> String {
    if key.0.is_empty() {
        key.1.clone()
    } else {
        format!("{}/{}", key.0, key.1)
    }
}

fn now_time() -> Option<Time> {
    let ts = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
    serde_json::from_value(serde_json::Value::String(ts)).ok()
}

impl<K> Default for MemoryStore<K>
where
    K: Resource + StatusSubresource + Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> MemoryStore<K>
where
    K: Resource + StatusSubresource + Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MemState {
                objects: BTreeMap::new(),
                cache: BTreeMap::new(),
                auto_sync: true,
                cache_selector: None,
                next_version: 1,
                next_uid: 1,
                calls: WriteCalls::default(),
                failures: VecDeque::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemState<K>> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Insert or overwrite an object as if an external actor created it.
    /// Assigns a UID when missing and a fresh resource version.
    pub fn seed(&self, obj: K) -> K {
        let mut st = self.lock();
        let mut obj = obj;
        if obj.meta().uid.is_none() {
            obj.meta_mut().uid = Some(format!("uid-{}", st.next_uid));
            st.next_uid += 1;
        }
        st.stamp(&mut obj);
        let key = key_of(&obj);
        st.objects.insert(key, obj.clone());
        st.after_write();
        obj
    }

    /// Mutate the authoritative copy outside the controller, bumping the
    /// resource version. Not counted as a controller write.
    pub fn mutate<F>(&self, namespace: &str, name: &str, f: F) -> Option<K>
    where
        F: FnOnce(&mut K),
    {
        let mut st = self.lock();
        let key = (namespace.to_string(), name.to_string());
        let mut obj = st.objects.get(&key)?.clone();
        f(&mut obj);
        st.stamp(&mut obj);
        st.objects.insert(key, obj.clone());
        st.after_write();
        Some(obj)
    }

    /// Remove an object outside the controller, ignoring finalizers.
    pub fn purge(&self, namespace: &str, name: &str) -> Option<K> {
        let mut st = self.lock();
        let removed = st
            .objects
            .remove(&(namespace.to_string(), name.to_string()));
        st.after_write();
        removed
    }

    /// When disabled, writes are invisible to the cache until [`sync`].
    ///
    /// [`sync`]: MemoryStore::sync
    pub fn set_auto_sync(&self, enabled: bool) {
        self.lock().auto_sync = enabled;
    }

    /// Only objects matching `selector` become visible through the cache,
    /// like a watch restricted by a label selector.
    pub fn set_cache_selector(&self, selector: Selector) {
        let mut st = self.lock();
        st.cache_selector = Some(selector);
        st.sync_cache();
    }

    /// Bring the cache view up to date with the authoritative objects.
    pub fn sync(&self) {
        self.lock().sync_cache();
    }

    /// Fail the next `op` with `err`. Queued failures are consumed in order.
    pub fn fail_next(&self, op: WriteOp, err: StoreError) {
        self.lock().failures.push_back((op, err));
    }

    pub fn calls(&self) -> WriteCalls {
        self.lock().calls
    }

    pub fn reset_calls(&self) {
        self.lock().calls = WriteCalls::default();
    }

    /// Authoritative copy, regardless of the cache.
    pub fn stored(&self, namespace: &str, name: &str) -> Option<K> {
        self.lock()
            .objects
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Authoritative objects sorted by namespace/name.
    pub fn objects(&self) -> Vec<K> {
        self.lock().objects.values().cloned().collect()
    }

    pub fn keys(&self) -> Vec<String> {
        self.lock().objects.keys().map(describe).collect()
    }
}

impl<K> MemState<K>
where
    K: Resource + Clone,
{
    fn stamp(&mut self, obj: &mut K) {
        obj.meta_mut().resource_version = Some(self.next_version.to_string());
        self.next_version += 1;
    }

    fn after_write(&mut self) {
        if self.auto_sync {
            self.sync_cache();
        }
    }

    fn sync_cache(&mut self) {
        let selector = self.cache_selector.clone();
        self.cache = self
            .objects
            .iter()
            .filter(|(_, v)| selector.as_ref().is_none_or(|s| s.matches(*v)))
            .map(|(k, v)| (k.clone(), Arc::new(v.clone())))
            .collect();
    }

    fn injected(&mut self, op: WriteOp) -> Result<(), StoreError> {
        match self.failures.iter().position(|(o, _)| *o == op) {
            Some(idx) => match self.failures.remove(idx) {
                Some((_, err)) => Err(err),
                None => Ok(()),
            },
            None => Ok(()),
        }
    }
}

impl<K> ObjectCache<K> for MemoryStore<K>
where
    K: Resource + StatusSubresource + Clone + Send + Sync + 'static,
{
    fn get(&self, namespace: &str, name: &str) -> Option<Arc<K>> {
        self.lock()
            .cache
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    fn list(&self, selector: &Selector) -> Vec<Arc<K>> {
        self.lock()
            .cache
            .values()
            .filter(|o| selector.matches(&***o))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl<K> ObjectWriter<K> for MemoryStore<K>
where
    K: Resource + StatusSubresource + Clone + Send + Sync + 'static,
{
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>, StoreError> {
        Ok(self.stored(namespace, name))
    }

    async fn create(&self, obj: &K) -> Result<K, StoreError> {
        let mut st = self.lock();
        st.calls.create += 1;
        st.injected(WriteOp::Create)?;
        let key = key_of(obj);
        if st.objects.contains_key(&key) {
            return Err(StoreError::Conflict(format!(
                "{} already exists",
                describe(&key)
            )));
        }
        let mut created = obj.clone();
        created.meta_mut().uid = Some(format!("uid-{}", st.next_uid));
        st.next_uid += 1;
        created.meta_mut().generation = Some(1);
        created.meta_mut().deletion_timestamp = None;
        st.stamp(&mut created);
        st.objects.insert(key, created.clone());
        st.after_write();
        Ok(created)
    }

    async fn update(&self, obj: &K) -> Result<K, StoreError> {
        let mut st = self.lock();
        st.calls.update += 1;
        st.injected(WriteOp::Update)?;
        let key = key_of(obj);
        let Some(current) = st.objects.get(&key).cloned() else {
            return Err(StoreError::NotFound(describe(&key)));
        };
        if obj.meta().resource_version != current.meta().resource_version {
            return Err(StoreError::Conflict(format!(
                "{}: version {:?} is stale, current is {:?}",
                describe(&key),
                obj.meta().resource_version,
                current.meta().resource_version
            )));
        }
        let mut updated = obj.clone();
        K::copy_status(&current, &mut updated);
        updated.meta_mut().uid = current.meta().uid.clone();
        updated.meta_mut().generation = current.meta().generation;
        updated.meta_mut().deletion_timestamp =
            current.meta().deletion_timestamp.clone();
        st.stamp(&mut updated);
        let finalized = updated.meta().deletion_timestamp.is_some()
            && updated.finalizers().is_empty();
        if finalized {
            st.objects.remove(&key);
        } else {
            st.objects.insert(key, updated.clone());
        }
        st.after_write();
        Ok(updated)
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        let mut st = self.lock();
        st.calls.delete += 1;
        st.injected(WriteOp::Delete)?;
        let key = (namespace.to_string(), name.to_string());
        let Some(mut current) = st.objects.get(&key).cloned() else {
            return Err(StoreError::NotFound(describe(&key)));
        };
        if current.finalizers().is_empty() {
            st.objects.remove(&key);
        } else if current.meta().deletion_timestamp.is_none() {
            current.meta_mut().deletion_timestamp = now_time();
            st.stamp(&mut current);
            st.objects.insert(key, current);
        }
        st.after_write();
        Ok(())
    }

    async fn update_status(&self, obj: &K) -> Result<K, StoreError> {
        let mut st = self.lock();
        st.calls.update_status += 1;
        st.injected(WriteOp::UpdateStatus)?;
        let key = key_of(obj);
        let Some(mut current) = st.objects.get(&key).cloned() else {
            return Err(StoreError::NotFound(describe(&key)));
        };
        K::copy_status(obj, &mut current);
        st.stamp(&mut current);
        st.objects.insert(key, current.clone());
        st.after_write();
        Ok(current)
    }
}
