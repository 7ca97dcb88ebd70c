//! Watch-backed caches for every kind the controller reads, translating
//! each observed change into reconcile keys on the [`WorkQueue`].

use std::fmt::Debug;
use std::sync::Arc;

use futures_util::StreamExt;
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Secret};
use kube::runtime::reflector::{self, Store};
use kube::runtime::{WatchStreamExt, watcher};
use kube::{Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use syncer_models::{OWNER_LABEL, ObjectKey, SOURCE_ANNOTATION, SyncSource};
use tokio::task::JoinSet;
use tracing::{trace, warn};

use crate::queue::WorkQueue;
use crate::store::cluster::ReflectorCache;

/// Reflector stores plus the tasks driving their watches.
pub struct Informers {
    pub sources: Store<SyncSource>,
    pub config_maps: Store<ConfigMap>,
    pub secrets: Store<Secret>,
    pub namespaces: Store<Namespace>,
    tasks: JoinSet<()>,
}

impl Informers {
    /// Start all watches. SyncSources are watched cluster-wide unless
    /// `watch_namespace` is given; targets only when they carry the owner
    /// label.
    pub fn start(
        client: Client,
        watch_namespace: Option<&str>,
        queue: WorkQueue<ObjectKey>,
    ) -> Self {
        let mut tasks = JoinSet::new();

        let source_api: Api<SyncSource> = match watch_namespace {
            Some(ns) => Api::namespaced(client.clone(), ns),
            None => Api::all(client.clone()),
        };
        let sources = spawn_watch(
            &mut tasks,
            source_api,
            watcher::Config::default(),
            queue.clone(),
            |s: &SyncSource| vec![s.key()],
        );

        let owned = || watcher::Config::default().labels(OWNER_LABEL);
        let config_maps = spawn_watch(
            &mut tasks,
            Api::all(client.clone()),
            owned(),
            queue.clone(),
            owner_of::<ConfigMap>,
        );
        let secrets = spawn_watch(
            &mut tasks,
            Api::all(client.clone()),
            owned(),
            queue.clone(),
            owner_of::<Secret>,
        );

        // any namespace change may alter a source's destination set
        let all_sources = sources.clone();
        let namespaces = spawn_watch(
            &mut tasks,
            Api::all(client),
            watcher::Config::default(),
            queue,
            move |_: &Namespace| all_sources.state().iter().map(|s| s.key()).collect(),
        );

        Self {
            sources,
            config_maps,
            secrets,
            namespaces,
            tasks,
        }
    }

    /// Resolve once every cache has completed its initial list.
    pub async fn wait_until_ready(&self) -> anyhow::Result<()> {
        self.sources.wait_until_ready().await?;
        self.config_maps.wait_until_ready().await?;
        self.secrets.wait_until_ready().await?;
        self.namespaces.wait_until_ready().await?;
        Ok(())
    }

    pub fn shutdown(&mut self) {
        self.tasks.abort_all();
    }
}

/// Key of the source a target points back to, if any.
pub fn owner_of<K: Resource>(obj: &K) -> Vec<ObjectKey> {
    obj.annotations()
        .get(SOURCE_ANNOTATION)
        .and_then(|v| v.parse().ok())
        .into_iter()
        .collect()
}

fn spawn_watch<K, F>(
    tasks: &mut JoinSet<()>,
    api: Api<K>,
    config: watcher::Config,
    queue: WorkQueue<ObjectKey>,
    map: F,
) -> Store<K>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    F: Fn(&K) -> Vec<ObjectKey> + Send + Sync + 'static,
{
    let (reader, writer) = reflector::store::<K>();
    let kind = K::kind(&()).to_string();
    tasks.spawn(async move {
        watcher(api, config)
            .default_backoff()
            .reflect(writer)
            .touched_objects()
            .for_each(|event| {
                match event {
                    Ok(obj) => {
                        for key in map(&obj) {
                            trace!(%kind, object = %obj.name_any(), %key, "enqueue");
                            queue.add(key);
                        }
                    }
                    Err(e) => warn!(%kind, error = %e, "watch error"),
                }
                futures_util::future::ready(())
            })
            .await;
    });
    reader
}

/// Adapter exposing a reflector store through the crate's cache trait.
pub fn cache<K>(store: &Store<K>) -> Arc<ReflectorCache<K>>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    Arc::new(ReflectorCache::new(store.clone()))
}
