//! Lease-based leader election. Only the holder of the lease runs workers;
//! everybody else waits. Expiry is judged against the local clock at the
//! time the current record was first observed, so clock skew between
//! replicas does not matter.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use k8s_openapi::api::coordination::v1::Lease;
use kube::api::{Api, PostParams};
use kube::{Client, ResourceExt};
use serde_json::json;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::LeaderElectionConfig;
use crate::store::StoreError;
use crate::store::cluster::map_kube_error;

/// Contents of the lease that matter for election.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LeaseRecord {
    pub holder: Option<String>,
    pub lease_duration: Duration,
    pub transitions: i32,
    /// Opaque version used for conditional updates
    pub version: Option<String>,
}

/// Storage for the election record.
#[async_trait]
pub trait LeaseLock: Send + Sync {
    async fn get(&self) -> Result<Option<LeaseRecord>, StoreError>;

    /// Fails with `Conflict` when the lease already exists.
    async fn create(&self, record: &LeaseRecord) -> Result<LeaseRecord, StoreError>;

    /// Conditional on `record.version`.
    async fn update(&self, record: &LeaseRecord) -> Result<LeaseRecord, StoreError>;

    fn describe(&self) -> String;
}

/// A `coordination.k8s.io/v1` Lease.
pub struct KubeLeaseLock {
    api: Api<Lease>,
    namespace: String,
    name: String,
}

impl KubeLeaseLock {
    pub fn new(client: Client, namespace: &str, name: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    fn to_lease(&self, record: &LeaseRecord, acquired: bool) -> Result<Lease, StoreError> {
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);
        let mut spec = json!({
            "holderIdentity": record.holder,
            "leaseDurationSeconds": record.lease_duration.as_secs(),
            "leaseTransitions": record.transitions,
            "renewTime": now,
        });
        if acquired {
            spec["acquireTime"] = json!(now);
        }
        let mut metadata = json!({"name": self.name, "namespace": self.namespace});
        if let Some(v) = &record.version {
            metadata["resourceVersion"] = json!(v);
        }
        serde_json::from_value(json!({
            "apiVersion": "coordination.k8s.io/v1",
            "kind": "Lease",
            "metadata": metadata,
            "spec": spec,
        }))
        .map_err(|e| StoreError::Invalid(e.to_string()))
    }
}

fn from_lease(lease: &Lease) -> LeaseRecord {
    let spec = lease.spec.clone().unwrap_or_default();
    LeaseRecord {
        holder: spec.holder_identity.filter(|h| !h.is_empty()),
        lease_duration: Duration::from_secs(
            spec.lease_duration_seconds.unwrap_or(0).max(0) as u64,
        ),
        transitions: spec.lease_transitions.unwrap_or(0),
        version: lease.resource_version(),
    }
}

#[async_trait]
impl LeaseLock for KubeLeaseLock {
    async fn get(&self) -> Result<Option<LeaseRecord>, StoreError> {
        let lease = self.api.get_opt(&self.name).await.map_err(map_kube_error)?;
        Ok(lease.as_ref().map(from_lease))
    }

    async fn create(&self, record: &LeaseRecord) -> Result<LeaseRecord, StoreError> {
        let lease = self.to_lease(record, true)?;
        let created = self
            .api
            .create(&PostParams::default(), &lease)
            .await
            .map_err(map_kube_error)?;
        Ok(from_lease(&created))
    }

    async fn update(&self, record: &LeaseRecord) -> Result<LeaseRecord, StoreError> {
        let current_holder = self.get().await?.and_then(|r| r.holder);
        let lease = self.to_lease(record, current_holder != record.holder)?;
        let updated = self
            .api
            .replace(&self.name, &PostParams::default(), &lease)
            .await
            .map_err(map_kube_error)?;
        Ok(from_lease(&updated))
    }

    fn describe(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

#[derive(Clone, Debug)]
pub struct ElectionConfig {
    pub identity: String,
    pub lease_duration: Duration,
    /// How long renewals may keep failing before leadership is given up
    pub renew_deadline: Duration,
    pub retry_period: Duration,
}

impl From<&LeaderElectionConfig> for ElectionConfig {
    fn from(cfg: &LeaderElectionConfig) -> Self {
        Self {
            identity: cfg.resolve_identity(),
            lease_duration: Duration::from_secs(cfg.lease_duration_secs),
            renew_deadline: Duration::from_secs(cfg.renew_deadline_secs),
            retry_period: Duration::from_secs(cfg.retry_period_secs),
        }
    }
}

pub struct LeaderElector {
    lock: Arc<dyn LeaseLock>,
    cfg: ElectionConfig,
    observed: Option<(LeaseRecord, Instant)>,
    tx: watch::Sender<bool>,
}

impl LeaderElector {
    pub fn new(lock: Arc<dyn LeaseLock>, cfg: ElectionConfig) -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            lock,
            cfg,
            observed: None,
            tx,
        }
    }

    /// `true` while this replica holds the lease.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    pub fn identity(&self) -> &str {
        &self.cfg.identity
    }

    fn observe(&mut self, record: LeaseRecord, at: Instant) {
        self.observed = Some((record, at));
    }

    /// One election round. Returns whether we hold the lease afterwards.
    pub async fn try_acquire_or_renew(&mut self) -> Result<bool, StoreError> {
        let now = Instant::now();
        let me = self.cfg.identity.clone();

        let Some(current) = self.lock.get().await? else {
            let created = self
                .lock
                .create(&LeaseRecord {
                    holder: Some(me),
                    lease_duration: self.cfg.lease_duration,
                    transitions: 0,
                    version: None,
                })
                .await?;
            self.observe(created, now);
            return Ok(true);
        };

        if self.observed.as_ref().is_none_or(|(r, _)| *r != current) {
            self.observe(current.clone(), now);
        }
        let observed_at = self.observed.as_ref().map_or(now, |(_, at)| *at);

        let held_by_other = current.holder.as_deref().is_some_and(|h| h != me);
        if held_by_other && observed_at + current.lease_duration > now {
            return Ok(false);
        }

        let transitions = if current.holder.as_deref() == Some(me.as_str()) {
            current.transitions
        } else {
            current.transitions + 1
        };
        let updated = self
            .lock
            .update(&LeaseRecord {
                holder: Some(me),
                lease_duration: self.cfg.lease_duration,
                transitions,
                version: current.version.clone(),
            })
            .await?;
        self.observe(updated, now);
        Ok(true)
    }

    /// Campaign until elected, then keep renewing. Publishes `true` on the
    /// status channel while leading and `false` once leadership ends. On
    /// shutdown the lease is released so a successor need not wait.
    pub async fn run(mut self, shutdown: CancellationToken) {
        if !self.acquire(&shutdown).await {
            return;
        }
        info!(identity = %self.cfg.identity, lease = %self.lock.describe(), "became leader");
        self.tx.send_replace(true);

        self.renew(&shutdown).await;
        self.tx.send_replace(false);

        if shutdown.is_cancelled() {
            self.release().await;
        }
    }

    async fn acquire(&mut self, shutdown: &CancellationToken) -> bool {
        loop {
            let round = tokio::select! {
                _ = shutdown.cancelled() => return false,
                r = self.try_acquire_or_renew() => r,
            };
            match round {
                Ok(true) => return true,
                Ok(false) => debug!(lease = %self.lock.describe(), "lease held by another replica"),
                Err(e) => debug!(error = %e, "failed to acquire lease"),
            }
            tokio::select! {
                _ = shutdown.cancelled() => return false,
                _ = tokio::time::sleep(self.cfg.retry_period) => {}
            }
        }
    }

    /// Renew every `retry_period`. Steps down once no renewal has succeeded
    /// for `renew_deadline`, including when a renewal call never returns.
    async fn renew(&mut self, shutdown: &CancellationToken) {
        let mut last_renew = Instant::now();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(self.cfg.retry_period) => {}
            }
            let budget = self.cfg.renew_deadline.saturating_sub(last_renew.elapsed());
            let round = tokio::select! {
                _ = shutdown.cancelled() => return,
                r = tokio::time::timeout(budget, self.try_acquire_or_renew()) => r,
            };
            match round {
                Ok(Ok(true)) => last_renew = Instant::now(),
                Ok(Ok(false)) => {
                    warn!("lease was taken over by another replica");
                    return;
                }
                Ok(Err(e)) if last_renew.elapsed() >= self.cfg.renew_deadline => {
                    error!(error = %e, "could not renew lease before the deadline");
                    return;
                }
                Ok(Err(e)) => warn!(error = %e, "lease renewal failed; retrying"),
                Err(_) => {
                    error!(deadline = ?self.cfg.renew_deadline, "lease renewal timed out");
                    return;
                }
            }
        }
    }

    async fn release(&mut self) {
        let Some((record, _)) = self.observed.clone() else {
            return;
        };
        if record.holder.as_deref() != Some(self.cfg.identity.as_str()) {
            return;
        }
        let released = LeaseRecord {
            holder: None,
            lease_duration: Duration::from_secs(1),
            ..record
        };
        match tokio::time::timeout(self.cfg.renew_deadline, self.lock.update(&released)).await {
            Ok(Ok(_)) => info!("released lease"),
            Ok(Err(e)) => debug!(error = %e, "failed to release lease"),
            Err(_) => debug!("timed out releasing lease"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct MemoryLease {
        record: Mutex<Option<LeaseRecord>>,
        version: Mutex<u64>,
        /// Reads never complete while set
        stalled: AtomicBool,
    }

    impl MemoryLease {
        fn bump(&self, record: &LeaseRecord) -> LeaseRecord {
            let mut v = self.version.lock().unwrap();
            *v += 1;
            LeaseRecord {
                version: Some(v.to_string()),
                ..record.clone()
            }
        }

        fn holder(&self) -> Option<String> {
            self.record.lock().unwrap().as_ref().and_then(|r| r.holder.clone())
        }
    }

    #[async_trait]
    impl LeaseLock for MemoryLease {
        async fn get(&self) -> Result<Option<LeaseRecord>, StoreError> {
            if self.stalled.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            Ok(self.record.lock().unwrap().clone())
        }

        async fn create(&self, record: &LeaseRecord) -> Result<LeaseRecord, StoreError> {
            if self.record.lock().unwrap().is_some() {
                return Err(StoreError::Conflict("lease exists".into()));
            }
            let stored = self.bump(record);
            *self.record.lock().unwrap() = Some(stored.clone());
            Ok(stored)
        }

        async fn update(&self, record: &LeaseRecord) -> Result<LeaseRecord, StoreError> {
            let current = self.record.lock().unwrap().clone();
            match current {
                None => Err(StoreError::NotFound("lease".into())),
                Some(c) if c.version != record.version => {
                    Err(StoreError::Conflict("stale lease".into()))
                }
                Some(_) => {
                    let stored = self.bump(record);
                    *self.record.lock().unwrap() = Some(stored.clone());
                    Ok(stored)
                }
            }
        }

        fn describe(&self) -> String {
            "memory".into()
        }
    }

    fn cfg(identity: &str) -> ElectionConfig {
        ElectionConfig {
            identity: identity.into(),
            lease_duration: Duration::from_secs(15),
            renew_deadline: Duration::from_secs(10),
            retry_period: Duration::from_secs(2),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn first_candidate_wins_and_second_waits() {
        let lock = Arc::new(MemoryLease::default());
        let mut a = LeaderElector::new(lock.clone(), cfg("a"));
        let mut b = LeaderElector::new(lock.clone(), cfg("b"));

        assert!(a.try_acquire_or_renew().await.unwrap());
        assert!(!b.try_acquire_or_renew().await.unwrap());
        assert_eq!(lock.holder().as_deref(), Some("a"));

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(a.try_acquire_or_renew().await.unwrap());
        assert!(!b.try_acquire_or_renew().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn takeover_after_lease_expires() {
        let lock = Arc::new(MemoryLease::default());
        let mut a = LeaderElector::new(lock.clone(), cfg("a"));
        let mut b = LeaderElector::new(lock.clone(), cfg("b"));

        assert!(a.try_acquire_or_renew().await.unwrap());
        assert!(!b.try_acquire_or_renew().await.unwrap());

        // a stops renewing
        tokio::time::advance(Duration::from_secs(16)).await;
        assert!(b.try_acquire_or_renew().await.unwrap());
        let record = lock.get().await.unwrap().unwrap();
        assert_eq!(record.holder.as_deref(), Some("b"));
        assert_eq!(record.transitions, 1);

        // a notices the new holder on its next round
        assert!(!a.try_acquire_or_renew().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn run_publishes_status_and_releases_on_shutdown() {
        let lock = Arc::new(MemoryLease::default());
        let elector = LeaderElector::new(lock.clone(), cfg("a"));
        let mut leading = elector.subscribe();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(elector.run(shutdown.clone()));

        leading.wait_for(|l| *l).await.unwrap();
        tokio::time::sleep(Duration::from_secs(7)).await;
        assert_eq!(lock.holder().as_deref(), Some("a"));

        shutdown.cancel();
        task.await.unwrap();
        assert!(!*leading.borrow());
        assert_eq!(lock.holder(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn leadership_lost_when_taken_over() {
        let lock = Arc::new(MemoryLease::default());
        let elector = LeaderElector::new(lock.clone(), cfg("a"));
        let mut leading = elector.subscribe();
        let task = tokio::spawn(elector.run(CancellationToken::new()));
        leading.wait_for(|l| *l).await.unwrap();

        // another replica force-writes the lease
        let current = lock.get().await.unwrap().unwrap();
        lock.update(&LeaseRecord {
            holder: Some("b".into()),
            ..current
        })
        .await
        .unwrap();

        leading.wait_for(|l| !*l).await.unwrap();
        task.await.unwrap();
        assert_eq!(lock.holder().as_deref(), Some("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn hung_renewal_steps_down_before_lease_expires() {
        let lock = Arc::new(MemoryLease::default());
        let elector = LeaderElector::new(lock.clone(), cfg("a"));
        let mut leading = elector.subscribe();
        let task = tokio::spawn(elector.run(CancellationToken::new()));
        leading.wait_for(|l| *l).await.unwrap();

        lock.stalled.store(true, Ordering::SeqCst);
        let started = Instant::now();
        tokio::time::timeout(Duration::from_secs(15), leading.wait_for(|l| !*l))
            .await
            .expect("stepped down within the lease duration")
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(15));
        task.await.unwrap();
    }
}
