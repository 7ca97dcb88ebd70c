//! Sweep for targets whose source disappeared without running its
//! finalizer (force-deleted, or removed while the controller was down).

use std::sync::Arc;

use kube::ResourceExt;
use syncer_models::{OWNER_LABEL, ObjectKey, SOURCE_ANNOTATION, SyncSource};
use tracing::{debug, info};

use super::target::ManagedTarget;
use super::{ControllerContext, ReconcileError};
use crate::store::{KindStore, ObjectCache, Selector, StoreError};

/// Delete orphaned targets of every kind. Returns how many were removed.
pub async fn collect_orphans(ctx: &ControllerContext) -> Result<usize, ReconcileError> {
    let scope = ctx.watch_namespace.as_deref();
    let mut removed = collect_kind(&ctx.config_maps, ctx.sources.as_ref(), scope).await?;
    removed += collect_kind(&ctx.secrets, ctx.sources.as_ref(), scope).await?;
    if removed > 0 {
        info!(removed, "collected orphaned targets");
    }
    Ok(removed)
}

async fn collect_kind<K: ManagedTarget>(
    store: &KindStore<K>,
    sources: &dyn ObjectCache<SyncSource>,
    scope: Option<&str>,
) -> Result<usize, ReconcileError> {
    let mut orphans: Vec<Arc<K>> = store
        .cache
        .list(&Selector::has_label(OWNER_LABEL))
        .into_iter()
        .filter(|t| is_orphan(&**t, sources, scope))
        .collect();
    orphans.sort_by_key(|o| ObjectKey::of(&**o));

    let mut removed = 0;
    for obj in orphans {
        let key = ObjectKey::of(&*obj);
        debug!(kind = %K::KIND, target = %key, "deleting orphaned target");
        match store.writer.delete(&key.namespace, &key.name).await {
            Ok(()) => removed += 1,
            Err(StoreError::NotFound(_)) => {}
            Err(e) => return Err(ReconcileError::target("delete", K::KIND, &key, e)),
        }
    }
    Ok(removed)
}

/// A target is orphaned when its annotation names a source the cache does
/// not know. Targets without a readable annotation, or whose source lives
/// outside the watched namespace, are left alone.
fn is_orphan<K: ManagedTarget>(
    target: &K,
    sources: &dyn ObjectCache<SyncSource>,
    scope: Option<&str>,
) -> bool {
    let Some(key) = target
        .annotations()
        .get(SOURCE_ANNOTATION)
        .and_then(|v| v.parse::<ObjectKey>().ok())
    else {
        return false;
    };
    if scope.is_some_and(|ns| ns != key.namespace) {
        return false;
    }
    sources.get(&key.namespace, &key.name).is_none()
}
