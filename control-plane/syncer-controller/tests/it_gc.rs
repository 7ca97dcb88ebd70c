mod common;

use std::time::Duration;

use common::{Harness, config_map, eventually, spec};
use kube::ResourceExt;
use syncer_controller::controller::gc::collect_orphans;
use syncer_controller::queue::{ExponentialBackoff, WorkQueue};
use syncer_controller::resync::{resync_once, run_resync};
use syncer_models::{OWNER_LABEL, ObjectKey, SOURCE_ANNOTATION};
use tokio_util::sync::CancellationToken;

fn queue() -> WorkQueue<ObjectKey> {
    WorkQueue::new(ExponentialBackoff::new(
        Duration::from_millis(1),
        Duration::from_millis(10),
    ))
}

#[test_log::test(tokio::test)]
async fn force_deleted_source_leaves_no_orphans() {
    let h = Harness::new(&["a", "b", "c"]);
    let k = h.apply("a", "foo", spec(&["b", "c"], &[("k", "v")]));
    let keep = h.apply("a", "bar", spec(&["b"], &[("k", "v")]));
    h.reconcile(&k).await.unwrap();
    h.reconcile(&keep).await.unwrap();

    // gone without its finalizer running
    h.sources.purge("a", "foo");
    h.reset_calls();

    let q = queue();
    assert_eq!(resync_once(&h.ctx, &q).await, 1);
    assert_eq!(q.len(), 1);
    assert_eq!(h.config_maps.calls().delete, 2);
    assert_eq!(h.config_map_namespaces("foo"), Vec::<String>::new());
    assert_eq!(h.config_map_namespaces("bar"), vec!["b"]);

    // nothing left to collect
    assert_eq!(collect_orphans(&h.ctx).await.unwrap(), 0);
}

#[test_log::test(tokio::test)]
async fn unannotated_and_out_of_scope_targets_are_kept() {
    let h = Harness::scoped(&["a", "b", "x"], Some("a"));

    // owned by a source in another namespace the controller does not watch
    let mut other = config_map("b", "theirs", &[("k", "v")]);
    other
        .labels_mut()
        .insert(OWNER_LABEL.to_string(), "uid-elsewhere".into());
    other
        .annotations_mut()
        .insert(SOURCE_ANNOTATION.to_string(), "x/theirs".into());
    h.config_maps.seed(other);

    // labelled but missing the source annotation
    let mut bare = config_map("b", "bare", &[]);
    bare.labels_mut()
        .insert(OWNER_LABEL.to_string(), "uid-unknown".into());
    h.config_maps.seed(bare);

    assert_eq!(collect_orphans(&h.ctx).await.unwrap(), 0);
    assert!(h.config_map("b", "theirs").is_some());
    assert!(h.config_map("b", "bare").is_some());

    // in scope and unknown: collected
    let mut stray = config_map("b", "stray", &[]);
    stray
        .labels_mut()
        .insert(OWNER_LABEL.to_string(), "uid-gone".into());
    stray
        .annotations_mut()
        .insert(SOURCE_ANNOTATION.to_string(), "a/gone".into());
    h.config_maps.seed(stray);

    assert_eq!(collect_orphans(&h.ctx).await.unwrap(), 1);
    assert!(h.config_map("b", "stray").is_none());
}

#[test_log::test(tokio::test)]
async fn orphaned_secrets_are_collected_too() {
    let h = Harness::new(&["a", "b"]);
    let mut s = spec(&["b"], &[("token", "abc")]);
    s.target_kind = syncer_models::TargetKind::Secret;
    let k = h.apply("a", "creds", s);
    h.reconcile(&k).await.unwrap();
    assert!(h.secret("b", "creds").is_some());

    h.sources.purge("a", "creds");
    assert_eq!(collect_orphans(&h.ctx).await.unwrap(), 1);
    assert!(h.secret("b", "creds").is_none());
}

#[test_log::test(tokio::test(start_paused = true))]
async fn periodic_resync_enqueues_sources() {
    let h = Harness::new(&["a", "b"]);
    h.apply("a", "foo", spec(&["b"], &[]));
    h.apply("a", "bar", spec(&["b"], &[]));

    let q = queue();
    let stop = CancellationToken::new();
    let task = tokio::spawn(run_resync(
        h.ctx.clone(),
        q.clone(),
        Duration::from_secs(30),
        stop.clone(),
    ));

    // the first tick is skipped
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(q.is_empty());

    assert!(eventually(Duration::from_secs(60), || q.len() == 2).await);

    stop.cancel();
    task.await.unwrap();
}
