use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::ResourceExt;
use syncer_models::{FINALIZER, ObjectKey, SyncSource, SyncSourceStatus};
use tracing::{debug, info, instrument, trace, warn};

use super::desired;
use super::status::{self, SyncReport};
use super::desired::DesiredState;
use super::{Action, ControllerContext, ErrorClass, Reconcile, ReconcileError, apply};
use crate::store::StoreError;

/// Delay before looking again when a write raced with a concurrent delete.
const RACE_REQUEUE: Duration = Duration::from_secs(1);

/// Drives [`reconcile`] for every key the dispatcher hands out.
pub struct SyncReconciler {
    ctx: Arc<ControllerContext>,
}

impl SyncReconciler {
    pub fn new(ctx: Arc<ControllerContext>) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &Arc<ControllerContext> {
        &self.ctx
    }
}

#[async_trait]
impl Reconcile for SyncReconciler {
    async fn reconcile(&self, key: &ObjectKey) -> Result<Action, ReconcileError> {
        reconcile(&self.ctx, key).await
    }

    async fn retries_exhausted(&self, key: &ObjectKey, error: &ReconcileError) {
        if let Err(e) = record_failure(&self.ctx, key, error).await {
            warn!(%key, error = %e, "failed to record sync failure on status");
        }
    }
}

/// Bring every target of the source at `key` in line with its spec.
/// Reads come from the caches; the only side effects are writes.
#[instrument(level = "debug", skip_all, fields(source = %key))]
pub async fn reconcile(
    ctx: &ControllerContext,
    key: &ObjectKey,
) -> Result<Action, ReconcileError> {
    let Some(source) = ctx.sources.get(&key.namespace, &key.name) else {
        debug!("source no longer exists");
        return Ok(Action::await_change());
    };

    if source.is_deleting() {
        if source.has_finalizer() {
            finalize(ctx, &source).await?;
        }
        return Ok(Action::await_change());
    }

    let source = if source.has_finalizer() {
        source
    } else {
        Arc::new(add_finalizer(ctx, &source).await?)
    };

    let desired =
        match desired::compute(&source, ctx.namespaces.as_ref(), ctx.policy.as_ref()) {
            Ok(d) => d,
            Err(e) => {
                warn!(error = %e, "source rejected");
                let next = status::invalid(&source, &e.to_string(), &status::now_rfc3339());
                write_status(ctx, &source, next).await?;
                return Err(e.into());
            }
        };

    let mut report = SyncReport::new(desired.missing.clone());
    if let Err(e) = converge_all(ctx, &source, desired, &mut report).await {
        // retried errors get their status from the exhaustion hook
        if e.class() == ErrorClass::Permanent {
            warn!(error = %e, "store rejected a target");
            let next = status::rejected(&source, &e.to_string(), &status::now_rfc3339());
            write_status(ctx, &source, next).await?;
        }
        return Err(e);
    }
    report.targets.sort();

    if report.writes() > 0 || !report.blocked.is_empty() {
        info!(
            created = report.created,
            updated = report.updated,
            deleted = report.deleted,
            unchanged = report.unchanged,
            blocked = report.blocked.len(),
            "converged targets"
        );
    } else {
        trace!(unchanged = report.unchanged, "targets already in sync");
    }

    let next = status::synced(&source, &report, &status::now_rfc3339());
    write_status(ctx, &source, next).await?;

    Ok(if report.requeue {
        Action::requeue(RACE_REQUEUE)
    } else {
        Action::await_change()
    })
}

async fn converge_all(
    ctx: &ControllerContext,
    source: &SyncSource,
    desired: DesiredState,
    report: &mut SyncReport,
) -> Result<(), ReconcileError> {
    apply::converge(&ctx.config_maps, source, desired.config_maps, report).await?;
    apply::converge(&ctx.secrets, source, desired.secrets, report).await
}

async fn add_finalizer(
    ctx: &ControllerContext,
    source: &SyncSource,
) -> Result<SyncSource, ReconcileError> {
    let mut obj = source.clone();
    obj.finalizers_mut().push(FINALIZER.to_string());
    let updated = ctx
        .source_writer
        .update(&obj)
        .await
        .map_err(|e| ReconcileError::store("add finalizer to", "SyncSource", &source.key(), e))?;
    debug!("finalizer added");
    Ok(updated)
}

/// Delete all owned targets, then release the source.
async fn finalize(ctx: &ControllerContext, source: &SyncSource) -> Result<(), ReconcileError> {
    let mut report = SyncReport::default();
    apply::remove_all(&ctx.config_maps, source, &mut report).await?;
    apply::remove_all(&ctx.secrets, source, &mut report).await?;
    info!(deleted = report.deleted, "cleaned up targets of deleted source");

    let mut obj = source.clone();
    obj.finalizers_mut().retain(|f| f != FINALIZER);
    match ctx.source_writer.update(&obj).await {
        Ok(_) | Err(StoreError::NotFound(_)) => {
            debug!("finalizer removed");
            Ok(())
        }
        Err(e) => Err(ReconcileError::store(
            "remove finalizer from",
            "SyncSource",
            &source.key(),
            e,
        )),
    }
}

/// Write `next` unless the source already carries it.
async fn write_status(
    ctx: &ControllerContext,
    source: &SyncSource,
    next: SyncSourceStatus,
) -> Result<(), ReconcileError> {
    if !status::should_write(source, &next) {
        trace!("status unchanged");
        return Ok(());
    }
    let mut obj = source.clone();
    obj.status = Some(next);
    match ctx.source_writer.update_status(&obj).await {
        Ok(_) | Err(StoreError::NotFound(_)) => Ok(()),
        Err(e) => Err(ReconcileError::store(
            "update status of",
            "SyncSource",
            &source.key(),
            e,
        )),
    }
}

/// Mark the source failed after its retries ran out.
pub async fn record_failure(
    ctx: &ControllerContext,
    key: &ObjectKey,
    error: &ReconcileError,
) -> Result<(), ReconcileError> {
    let Some(source) = ctx.sources.get(&key.namespace, &key.name) else {
        return Ok(());
    };
    if source.is_deleting() {
        return Ok(());
    }
    let next = status::failed(&source, &error.to_string(), &status::now_rfc3339());
    write_status(ctx, &source, next).await
}
