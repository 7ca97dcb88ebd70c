//! Converge the targets of one kind towards the desired set: create what is
//! absent, update what drifted, delete owned objects nobody wants anymore.

use std::collections::BTreeSet;
use std::sync::Arc;

use kube::ResourceExt;
use syncer_models::{OWNER_LABEL, ObjectKey, SyncSource};
use tracing::{debug, info, warn};

use super::ReconcileError;
use super::desired::target_ref;
use super::status::{BlockedTarget, SyncReport};
use super::target::{ManagedTarget, Owner, Ownership, managed_eq, merge_managed};
use crate::store::{KindStore, Selector, StoreError};

pub async fn converge<K: ManagedTarget>(
    store: &KindStore<K>,
    source: &SyncSource,
    mut desired: Vec<K>,
    report: &mut SyncReport,
) -> Result<(), ReconcileError> {
    let owner = Owner::of(source);
    desired.sort_by_key(ObjectKey::of);
    let mut keep = BTreeSet::new();

    for want in desired {
        let key = ObjectKey::of(&want);
        let observed = match store.cache.get(&key.namespace, &key.name) {
            Some(observed) => observed,
            None => match create_or_fetch(store, &want, &key, report).await? {
                Created::Done => {
                    keep.insert(key);
                    continue;
                }
                Created::Retry => {
                    keep.insert(key);
                    continue;
                }
                Created::Existing(live) => Arc::new(live),
            },
        };

        match owner.ownership(&*observed) {
            Ownership::Foreign(held_by) => {
                warn!(kind = %K::KIND, target = %key, %held_by, "target held by another owner");
                report.blocked.push(BlockedTarget {
                    target: target_ref(&want),
                    held_by,
                });
                continue;
            }
            Ownership::Adoptable => {
                info!(kind = %K::KIND, target = %key, "adopting target of an earlier incarnation");
            }
            Ownership::Owned => {}
        }
        keep.insert(key.clone());

        if managed_eq(&*observed, &want) {
            report.unchanged += 1;
            report.targets.push(target_ref(&want));
            continue;
        }
        let merged = merge_managed(&*observed, &want);
        match store.writer.update(&merged).await {
            Ok(_) => {
                info!(kind = %K::KIND, target = %key, "updated target");
                report.updated += 1;
                report.targets.push(target_ref(&want));
            }
            Err(StoreError::NotFound(_)) => {
                debug!(kind = %K::KIND, target = %key, "target deleted under us; will recreate");
                report.requeue = true;
            }
            Err(e) => return Err(ReconcileError::target("update", K::KIND, &key, e)),
        }
    }

    prune(store, &owner, &keep, report).await
}

enum Created<K> {
    Done,
    /// Raced with a concurrent delete; try again on the next pass
    Retry,
    /// An object the cache does not show already sits at the key
    Existing(K),
}

/// Create `want`. Unmanaged objects are not in the cache (targets are
/// watched by owner label), so a create conflict is resolved with a live
/// read and the object found there is classified by the caller.
async fn create_or_fetch<K: ManagedTarget>(
    store: &KindStore<K>,
    want: &K,
    key: &ObjectKey,
    report: &mut SyncReport,
) -> Result<Created<K>, ReconcileError> {
    match store.writer.create(want).await {
        Ok(_) => {
            info!(kind = %K::KIND, target = %key, "created target");
            report.created += 1;
            report.targets.push(target_ref(want));
            Ok(Created::Done)
        }
        Err(StoreError::NotFound(e)) => {
            debug!(kind = %K::KIND, target = %key, error = %e, "namespace vanished during create");
            report.requeue = true;
            Ok(Created::Retry)
        }
        Err(StoreError::Conflict(e)) => {
            debug!(kind = %K::KIND, target = %key, error = %e, "target exists outside the cache");
            match store.writer.get(&key.namespace, &key.name).await {
                Ok(Some(live)) => Ok(Created::Existing(live)),
                Ok(None) => {
                    report.requeue = true;
                    Ok(Created::Retry)
                }
                Err(e) => Err(ReconcileError::target("get", K::KIND, key, e)),
            }
        }
        Err(e) => Err(ReconcileError::target("create", K::KIND, key, e)),
    }
}

/// Delete every target of `owner` whose key is not in `keep`.
async fn prune<K: ManagedTarget>(
    store: &KindStore<K>,
    owner: &Owner,
    keep: &BTreeSet<ObjectKey>,
    report: &mut SyncReport,
) -> Result<(), ReconcileError> {
    let mut stale: Vec<Arc<K>> = store
        .cache
        .list(&Selector::has_label(OWNER_LABEL))
        .into_iter()
        .filter(|o| owner.owns(&**o) && !keep.contains(&ObjectKey::of(&**o)))
        .collect();
    stale.sort_by_key(|o| ObjectKey::of(&**o));

    for obj in stale {
        let ns = obj.namespace().unwrap_or_default();
        let name = obj.name_any();
        match store.writer.delete(&ns, &name).await {
            Ok(()) => {
                info!(kind = %K::KIND, target = %format!("{ns}/{name}"), "deleted target");
                report.deleted += 1;
            }
            Err(StoreError::NotFound(_)) => {}
            Err(e) => {
                return Err(ReconcileError::target(
                    "delete",
                    K::KIND,
                    &ObjectKey::new(ns, name),
                    e,
                ));
            }
        }
    }
    Ok(())
}

/// Delete every target `source` owns, of this kind.
pub async fn remove_all<K: ManagedTarget>(
    store: &KindStore<K>,
    source: &SyncSource,
    report: &mut SyncReport,
) -> Result<(), ReconcileError> {
    prune(store, &Owner::of(source), &BTreeSet::new(), report).await
}
