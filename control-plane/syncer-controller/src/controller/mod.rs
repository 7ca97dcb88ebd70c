pub mod apply;
pub mod desired;
pub mod gc;
pub mod reconcile;
pub mod status;
pub mod target;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Secret};
use syncer_models::{ObjectKey, SyncSource, TargetKind};

use crate::store::{KindStore, ObjectCache, ObjectWriter, StoreError};
use desired::{DestinationPolicy, ValidationError};

pub use reconcile::SyncReconciler;

/// Process-wide state shared by every worker. Caches are read-only; all
/// mutation goes through the writers.
pub struct ControllerContext {
    pub sources: Arc<dyn ObjectCache<SyncSource>>,
    pub source_writer: Arc<dyn ObjectWriter<SyncSource>>,
    pub namespaces: Arc<dyn ObjectCache<Namespace>>,
    pub config_maps: KindStore<ConfigMap>,
    pub secrets: KindStore<Secret>,
    pub policy: Arc<dyn DestinationPolicy>,
    /// Namespace the source informer is restricted to, if any
    pub watch_namespace: Option<String>,
}

/// What the dispatcher should do with a key after a successful reconcile.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Action {
    pub requeue_after: Option<Duration>,
}

impl Action {
    pub fn await_change() -> Self {
        Self {
            requeue_after: None,
        }
    }

    pub fn requeue(after: Duration) -> Self {
        Self {
            requeue_after: Some(after),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// Object vanished; nothing left to do
    NotFound,
    /// Optimistic concurrency failure; re-read and retry
    Conflict,
    /// Store or network trouble; retry with backoff
    Transient,
    /// Retrying cannot help until the source changes
    Permanent,
}

#[derive(thiserror::Error, Debug, Clone)]
pub enum ReconcileError {
    #[error("{op} {kind} {target}: {source}")]
    Store {
        op: &'static str,
        kind: &'static str,
        target: String,
        #[source]
        source: StoreError,
    },
    #[error("invalid SyncSource: {0}")]
    Invalid(#[from] ValidationError),
    #[error("reconcile timed out after {0:?}")]
    Timeout(Duration),
}

impl ReconcileError {
    pub fn store(
        op: &'static str,
        kind: &'static str,
        target: &ObjectKey,
        source: StoreError,
    ) -> Self {
        ReconcileError::Store {
            op,
            kind,
            target: target.to_string(),
            source,
        }
    }

    pub fn target(
        op: &'static str,
        kind: TargetKind,
        target: &ObjectKey,
        source: StoreError,
    ) -> Self {
        Self::store(op, kind.as_str(), target, source)
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            ReconcileError::Store { source, .. } => match source {
                StoreError::NotFound(_) => ErrorClass::NotFound,
                StoreError::Conflict(_) => ErrorClass::Conflict,
                StoreError::Invalid(_) => ErrorClass::Permanent,
                StoreError::Unavailable(_) => ErrorClass::Transient,
            },
            ReconcileError::Invalid(_) => ErrorClass::Permanent,
            ReconcileError::Timeout(_) => ErrorClass::Transient,
        }
    }
}

/// The single entry point the dispatcher drives.
#[async_trait]
pub trait Reconcile: Send + Sync + 'static {
    async fn reconcile(&self, key: &ObjectKey) -> Result<Action, ReconcileError>;

    /// Called once a key has failed `max_retries` times and is dropped.
    async fn retries_exhausted(&self, _key: &ObjectKey, _error: &ReconcileError) {}
}
