use std::fmt::Debug;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::runtime::reflector::{ObjectRef, Store};
use kube::{Client, Resource, ResourceExt};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::json;
use tracing::trace;

use super::{ObjectCache, ObjectWriter, Selector, StoreError};

/// [`ObjectCache`] over a reflector store fed by a watcher.
pub struct ReflectorCache<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    store: Store<K>,
}

impl<K> ReflectorCache<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    pub fn new(store: Store<K>) -> Self {
        Self { store }
    }
}

impl<K> ObjectCache<K> for ReflectorCache<K>
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    fn get(&self, namespace: &str, name: &str) -> Option<Arc<K>> {
        let mut obj_ref = ObjectRef::<K>::new(name);
        if !namespace.is_empty() {
            obj_ref = obj_ref.within(namespace);
        }
        self.store.get(&obj_ref)
    }

    fn list(&self, selector: &Selector) -> Vec<Arc<K>> {
        self.store
            .state()
            .into_iter()
            .filter(|o| selector.matches(&**o))
            .collect()
    }
}

/// [`ObjectWriter`] for a namespaced kind, talking to the API server.
pub struct ApiWriter<K> {
    client: Client,
    field_manager: String,
    _kind: PhantomData<fn() -> K>,
}

impl<K> ApiWriter<K> {
    pub fn new(client: Client, field_manager: impl Into<String>) -> Self {
        Self {
            client,
            field_manager: field_manager.into(),
            _kind: PhantomData,
        }
    }
}

impl<K> ApiWriter<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
{
    fn api(&self, namespace: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn post_params(&self) -> PostParams {
        PostParams {
            dry_run: false,
            field_manager: Some(self.field_manager.clone()),
        }
    }
}

#[async_trait]
impl<K> ObjectWriter<K> for ApiWriter<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static,
{
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>, StoreError> {
        trace!(%namespace, %name, "api: get");
        self.api(namespace)
            .get_opt(name)
            .await
            .map_err(map_kube_error)
    }

    async fn create(&self, obj: &K) -> Result<K, StoreError> {
        let ns = obj.namespace().unwrap_or_default();
        trace!(%ns, name = %obj.name_any(), "api: create");
        self.api(&ns)
            .create(&self.post_params(), obj)
            .await
            .map_err(map_kube_error)
    }

    async fn update(&self, obj: &K) -> Result<K, StoreError> {
        let ns = obj.namespace().unwrap_or_default();
        let name = obj.name_any();
        trace!(%ns, %name, version = ?obj.resource_version(), "api: replace");
        self.api(&ns)
            .replace(&name, &self.post_params(), obj)
            .await
            .map_err(map_kube_error)
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        trace!(%namespace, %name, "api: delete");
        self.api(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(map_kube_error)
    }

    async fn update_status(&self, obj: &K) -> Result<K, StoreError> {
        let ns = obj.namespace().unwrap_or_default();
        let name = obj.name_any();
        let value = serde_json::to_value(obj)
            .map_err(|e| StoreError::Invalid(e.to_string()))?;
        let patch = json!({
            "status": value.get("status").cloned().unwrap_or_default()
        });
        let pp = PatchParams {
            field_manager: Some(self.field_manager.clone()),
            ..Default::default()
        };
        trace!(%ns, %name, "api: patch status");
        self.api(&ns)
            .patch_status(&name, &pp, &Patch::Merge(&patch))
            .await
            .map_err(map_kube_error)
    }
}

/// Classify API server failures by HTTP status.
pub fn map_kube_error(err: kube::Error) -> StoreError {
    match err {
        kube::Error::Api(resp) => match resp.code {
            404 => StoreError::NotFound(resp.message),
            409 => StoreError::Conflict(resp.message),
            400 | 422 => StoreError::Invalid(resp.message),
            code => StoreError::Unavailable(format!("{} ({code})", resp.message)),
        },
        other => StoreError::Unavailable(other.to_string()),
    }
}
