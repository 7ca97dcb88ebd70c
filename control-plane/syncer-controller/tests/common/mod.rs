#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Secret};
use kube::api::ObjectMeta;
use syncer_controller::controller::desired::SpecDestinations;
use syncer_controller::controller::reconcile::reconcile;
use syncer_controller::controller::{Action, ControllerContext, ReconcileError};
use syncer_controller::store::{KindStore, Selector};
use syncer_controller::store::memory::MemoryStore;
use syncer_models::{OWNER_LABEL, ObjectKey, SyncSource, SyncSourceSpec};

pub fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

pub fn spec(destinations: &[&str], data: &[(&str, &str)]) -> SyncSourceSpec {
    SyncSourceSpec {
        destinations: destinations.iter().map(|d| d.to_string()).collect(),
        data: labels(data),
        ..Default::default()
    }
}

pub fn source(namespace: &str, name: &str, spec: SyncSourceSpec) -> SyncSource {
    let mut s = SyncSource::new(name, spec);
    s.metadata.namespace = Some(namespace.to_string());
    s.metadata.generation = Some(1);
    s
}

pub fn namespace(name: &str, pairs: &[(&str, &str)]) -> Namespace {
    Namespace {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(labels(pairs)),
            ..Default::default()
        },
        ..Default::default()
    }
}

pub fn config_map(namespace: &str, name: &str, data: &[(&str, &str)]) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            namespace: Some(namespace.to_string()),
            name: Some(name.to_string()),
            ..Default::default()
        },
        data: Some(labels(data)),
        ..Default::default()
    }
}

/// Memory-backed stores wired into a controller context.
pub struct Harness {
    pub sources: MemoryStore<SyncSource>,
    pub namespaces: MemoryStore<Namespace>,
    pub config_maps: MemoryStore<ConfigMap>,
    pub secrets: MemoryStore<Secret>,
    pub ctx: Arc<ControllerContext>,
}

impl Harness {
    pub fn new(namespaces: &[&str]) -> Self {
        Self::scoped(namespaces, None)
    }

    pub fn scoped(namespaces: &[&str], watch_namespace: Option<&str>) -> Self {
        let sources = MemoryStore::<SyncSource>::new();
        let nss = MemoryStore::<Namespace>::new();
        let config_maps = MemoryStore::<ConfigMap>::new();
        let secrets = MemoryStore::<Secret>::new();
        for ns in namespaces {
            nss.seed(namespace(ns, &[]));
        }
        let ctx = Arc::new(ControllerContext {
            sources: Arc::new(sources.clone()),
            source_writer: Arc::new(sources.clone()),
            namespaces: Arc::new(nss.clone()),
            config_maps: KindStore::new(
                Arc::new(config_maps.clone()),
                Arc::new(config_maps.clone()),
            ),
            secrets: KindStore::new(Arc::new(secrets.clone()), Arc::new(secrets.clone())),
            policy: Arc::new(SpecDestinations),
            watch_namespace: watch_namespace.map(str::to_string),
        });
        Self {
            sources,
            namespaces: nss,
            config_maps,
            secrets,
            ctx,
        }
    }

    /// Like the cluster informers, only show targets carrying the owner
    /// label through the caches.
    pub fn watch_owned_targets_only(self) -> Self {
        self.config_maps
            .set_cache_selector(Selector::has_label(OWNER_LABEL));
        self.secrets
            .set_cache_selector(Selector::has_label(OWNER_LABEL));
        self
    }

    pub fn apply(&self, namespace: &str, name: &str, spec: SyncSourceSpec) -> ObjectKey {
        self.sources.seed(source(namespace, name, spec));
        ObjectKey::new(namespace, name)
    }

    /// Change the spec the way a user edit would.
    pub fn edit<F: FnOnce(&mut SyncSourceSpec)>(&self, key: &ObjectKey, f: F) {
        self.sources
            .mutate(&key.namespace, &key.name, |s| {
                f(&mut s.spec);
                s.metadata.generation = Some(s.metadata.generation.unwrap_or(0) + 1);
            })
            .expect("source exists");
    }

    pub async fn reconcile(&self, key: &ObjectKey) -> Result<Action, ReconcileError> {
        reconcile(&self.ctx, key).await
    }

    pub fn source(&self, key: &ObjectKey) -> Option<SyncSource> {
        self.sources.stored(&key.namespace, &key.name)
    }

    pub fn config_map(&self, namespace: &str, name: &str) -> Option<ConfigMap> {
        self.config_maps.stored(namespace, name)
    }

    pub fn secret(&self, namespace: &str, name: &str) -> Option<Secret> {
        self.secrets.stored(namespace, name)
    }

    /// Namespaces holding a ConfigMap called `name`.
    pub fn config_map_namespaces(&self, name: &str) -> Vec<String> {
        self.config_maps
            .objects()
            .into_iter()
            .filter(|c| c.metadata.name.as_deref() == Some(name))
            .filter_map(|c| c.metadata.namespace)
            .collect()
    }

    pub fn target_writes(&self) -> usize {
        self.config_maps.calls().total() + self.secrets.calls().total()
    }

    pub fn total_writes(&self) -> usize {
        self.target_writes() + self.sources.calls().total()
    }

    pub fn reset_calls(&self) {
        self.sources.reset_calls();
        self.config_maps.reset_calls();
        self.secrets.reset_calls();
    }
}

/// Poll `check` until it holds or `timeout` elapses.
pub async fn eventually<F: FnMut() -> bool>(timeout: Duration, mut check: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

// Env guard utilities
pub struct EnvGuard {
    key: &'static str,
    old: Option<String>,
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        unsafe {
            if let Some(ref v) = self.old {
                std::env::set_var(self.key, v);
            } else {
                std::env::remove_var(self.key);
            }
        }
    }
}

pub fn set_env(key: &'static str, val: &str) -> EnvGuard {
    let old = std::env::var(key).ok();
    unsafe {
        std::env::set_var(key, val);
    }
    EnvGuard { key, old }
}
