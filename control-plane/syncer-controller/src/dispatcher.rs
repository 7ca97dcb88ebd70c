//! Worker pool pulling keys off the [`WorkQueue`] and feeding them to a
//! [`Reconcile`] implementation. The queue guarantees a key is processed by
//! at most one worker at a time.

use std::sync::Arc;
use std::time::Duration;

use syncer_models::ObjectKey;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::DispatchConfig;
use crate::controller::{Action, ErrorClass, Reconcile, ReconcileError};
use crate::queue::WorkQueue;

#[derive(Clone, Debug)]
pub struct DispatcherConfig {
    pub workers: usize,
    /// Failed attempts before a key is given up on
    pub max_retries: u32,
    pub reconcile_timeout: Duration,
    pub shutdown_grace: Duration,
}

impl From<&DispatchConfig> for DispatcherConfig {
    fn from(cfg: &DispatchConfig) -> Self {
        Self {
            workers: cfg.workers,
            max_retries: cfg.max_retries,
            reconcile_timeout: cfg.reconcile_timeout(),
            shutdown_grace: cfg.shutdown_grace(),
        }
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self::from(&DispatchConfig::default())
    }
}

pub struct Dispatcher<R> {
    queue: WorkQueue<ObjectKey>,
    reconciler: Arc<R>,
    cfg: DispatcherConfig,
}

impl<R: Reconcile> Dispatcher<R> {
    pub fn new(queue: WorkQueue<ObjectKey>, reconciler: Arc<R>, cfg: DispatcherConfig) -> Self {
        Self {
            queue,
            reconciler,
            cfg,
        }
    }

    /// Run workers until `shutdown` fires, then shut the queue down and give
    /// in-flight reconciles `shutdown_grace` to finish before aborting them.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut workers = JoinSet::new();
        let count = self.cfg.workers.max(1);
        for id in 0..count {
            workers.spawn(worker_loop(
                id,
                self.queue.clone(),
                self.reconciler.clone(),
                self.cfg.clone(),
            ));
        }
        info!(workers = count, "dispatcher started");

        shutdown.cancelled().await;
        info!("dispatcher stopping");
        self.queue.shut_down();

        let drained = tokio::time::timeout(self.cfg.shutdown_grace, async {
            while workers.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                grace = ?self.cfg.shutdown_grace,
                "in-flight reconciles did not finish in time; aborting"
            );
            workers.abort_all();
            while workers.join_next().await.is_some() {}
        }
        info!("dispatcher stopped");
    }
}

async fn worker_loop<R: Reconcile>(
    id: usize,
    queue: WorkQueue<ObjectKey>,
    reconciler: Arc<R>,
    cfg: DispatcherConfig,
) {
    debug!(worker = id, "worker started");
    while let Some(key) = queue.get().await {
        let result =
            match tokio::time::timeout(cfg.reconcile_timeout, reconciler.reconcile(&key)).await {
                Ok(res) => res,
                Err(_) => Err(ReconcileError::Timeout(cfg.reconcile_timeout)),
            };
        handle_result(&queue, reconciler.as_ref(), &cfg, key, result).await;
    }
    debug!(worker = id, "worker exiting");
}

/// Translate a reconcile result into queue operations.
async fn handle_result<R: Reconcile>(
    queue: &WorkQueue<ObjectKey>,
    reconciler: &R,
    cfg: &DispatcherConfig,
    key: ObjectKey,
    result: Result<Action, ReconcileError>,
) {
    let err = match result {
        Ok(action) => {
            queue.forget(&key);
            queue.done(&key);
            if let Some(after) = action.requeue_after {
                queue.add_after(key, after);
            }
            return;
        }
        Err(e) => e,
    };

    match err.class() {
        ErrorClass::NotFound => {
            debug!(%key, error = %err, "object gone; treating as done");
            queue.forget(&key);
            queue.done(&key);
        }
        ErrorClass::Permanent => {
            warn!(%key, error = %err, "reconcile failed permanently; waiting for a change");
            queue.forget(&key);
            queue.done(&key);
        }
        class @ (ErrorClass::Conflict | ErrorClass::Transient) => {
            let attempts = queue.num_requeues(&key);
            if attempts >= cfg.max_retries {
                error!(%key, attempts, error = %err, "giving up after repeated failures");
                reconciler.retries_exhausted(&key, &err).await;
                queue.forget(&key);
                queue.done(&key);
                return;
            }
            if class == ErrorClass::Conflict {
                debug!(%key, attempt = attempts + 1, error = %err, "conflict; retrying");
            } else {
                warn!(%key, attempt = attempts + 1, error = %err, "reconcile failed; retrying");
            }
            queue.done(&key);
            queue.add_rate_limited(key);
        }
    }
}
