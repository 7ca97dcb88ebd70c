use std::net::SocketAddr;
use std::sync::Arc;

use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::Client;
use syncer_models::SyncSource;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::SyncerConfig;
use crate::controller::desired::SpecDestinations;
use crate::controller::{ControllerContext, SyncReconciler};
use crate::dispatcher::{Dispatcher, DispatcherConfig};
use crate::informer::{self, Informers};
use crate::leader::{ElectionConfig, KubeLeaseLock, LeaderElector};
use crate::queue::{ExponentialBackoff, WorkQueue};
use crate::resync::run_resync;
use crate::store::KindStore;
use crate::store::cluster::ApiWriter;
use crate::web::{Readiness, run_http_server};

/// Compute the HTTP bind address based on config.
pub fn compute_http_addr(cfg: &SyncerConfig) -> SocketAddr {
    ([0, 0, 0, 0], cfg.http_port).into()
}

/// Wire informer caches and API writers into a reconcile context.
pub fn build_context(
    client: &Client,
    cfg: &SyncerConfig,
    informers: &Informers,
) -> ControllerContext {
    let fm = &cfg.field_manager;
    ControllerContext {
        sources: informer::cache(&informers.sources),
        source_writer: Arc::new(ApiWriter::<SyncSource>::new(client.clone(), fm)),
        namespaces: informer::cache(&informers.namespaces),
        config_maps: KindStore::new(
            informer::cache(&informers.config_maps),
            Arc::new(ApiWriter::<ConfigMap>::new(client.clone(), fm)),
        ),
        secrets: KindStore::new(
            informer::cache(&informers.secrets),
            Arc::new(ApiWriter::<Secret>::new(client.clone(), fm)),
        ),
        policy: Arc::new(SpecDestinations),
        watch_namespace: cfg.watch_namespace.clone(),
    }
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{SignalKind, signal};
    match signal(SignalKind::terminate()) {
        Ok(mut s) => {
            s.recv().await;
        }
        Err(_) => std::future::pending::<()>().await,
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await
}

/// Cancel `shutdown` on SIGINT or SIGTERM.
pub fn spawn_signal_handler(shutdown: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate() => {}
        }
        info!("shutdown signal received");
        shutdown.cancel();
    })
}

/// Run informers, the health server and, once elected (when leader
/// election is on), the dispatcher and resync loop. Returns an error when
/// leadership is lost so the process restarts with clean state.
pub async fn run_all(client: Client, cfg: SyncerConfig) -> anyhow::Result<()> {
    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    let readiness = Readiness::default();
    let http = {
        let addr = compute_http_addr(&cfg);
        let readiness = readiness.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = run_http_server(addr, readiness, shutdown).await {
                error!(error = %e, "HTTP server failed");
            }
        })
    };

    let queue = WorkQueue::new(ExponentialBackoff::new(
        cfg.dispatch.backoff_base(),
        cfg.dispatch.backoff_max(),
    ));
    let mut informers =
        Informers::start(client.clone(), cfg.watch_namespace.as_deref(), queue.clone());
    tokio::select! {
        res = informers.wait_until_ready() => res?,
        _ = shutdown.cancelled() => {
            informers.shutdown();
            return Ok(());
        }
    }
    readiness.set_ready(true);
    info!("informer caches synced");

    let ctx = Arc::new(build_context(&client, &cfg, &informers));

    let mut elector_task = None;
    let mut leading = None;
    if cfg.leader_election_enabled() {
        let lock = Arc::new(KubeLeaseLock::new(
            client.clone(),
            &cfg.leader.lease_namespace,
            &cfg.leader.lease_name,
        ));
        let elector = LeaderElector::new(lock, ElectionConfig::from(&cfg.leader));
        let mut rx = elector.subscribe();
        info!(identity = %elector.identity(), "waiting for leadership");
        elector_task = Some(tokio::spawn(elector.run(shutdown.clone())));
        tokio::select! {
            res = async { rx.wait_for(|l| *l).await.map(|_| ()) } => res?,
            _ = shutdown.cancelled() => {
                informers.shutdown();
                return Ok(());
            }
        }
        leading = Some(rx);
    }

    let stop_workers = shutdown.child_token();
    if let Some(mut rx) = leading {
        let stop = stop_workers.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = async {
                    while *rx.borrow() {
                        if rx.changed().await.is_err() {
                            break;
                        }
                    }
                } => warn!("leadership lost; stopping workers"),
                _ = stop.cancelled() => {}
            }
            stop.cancel();
        });
    }

    let resync = tokio::spawn(run_resync(
        ctx.clone(),
        queue.clone(),
        cfg.dispatch.resync_interval(),
        stop_workers.clone(),
    ));
    let reconciler = Arc::new(SyncReconciler::new(ctx));
    Dispatcher::new(queue, reconciler, DispatcherConfig::from(&cfg.dispatch))
        .run(stop_workers.clone())
        .await;

    let _ = resync.await;
    informers.shutdown();
    let lost_leadership = !shutdown.is_cancelled();
    shutdown.cancel();
    if let Some(task) = elector_task {
        let _ = task.await;
    }
    let _ = http.await;

    if lost_leadership {
        anyhow::bail!("lost leadership");
    }
    Ok(())
}
