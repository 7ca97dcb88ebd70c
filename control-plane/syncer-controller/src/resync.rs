use std::sync::Arc;
use std::time::Duration;

use syncer_models::ObjectKey;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::controller::{ControllerContext, gc};
use crate::queue::WorkQueue;
use crate::store::Selector;

/// Periodically enqueue every known source and sweep orphaned targets, so
/// drift that produced no watch event still converges.
pub async fn run_resync(
    ctx: Arc<ControllerContext>,
    queue: WorkQueue<ObjectKey>,
    every: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(every.max(Duration::from_secs(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // first tick completes immediately; informers already enqueued everything
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                resync_once(&ctx, &queue).await;
            }
        }
    }
}

/// One resync pass. Returns the number of sources enqueued.
pub async fn resync_once(ctx: &ControllerContext, queue: &WorkQueue<ObjectKey>) -> usize {
    let sources = ctx.sources.list(&Selector::everything());
    for source in &sources {
        queue.add(source.key());
    }
    debug!(sources = sources.len(), "resync enqueued sources");
    if let Err(e) = gc::collect_orphans(ctx).await {
        warn!(error = %e, "orphan collection failed");
    }
    sources.len()
}
