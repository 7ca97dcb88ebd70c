use std::time::Duration;

use envconfig::Envconfig;

#[derive(Envconfig, Clone, Debug)]
pub struct SyncerConfig {
    #[envconfig(from = "SYNCER_PROFILE", default = "dev")]
    pub profile: String,

    #[envconfig(from = "HTTP_PORT", default = "8088")]
    pub http_port: u16,

    /// Restrict watched SyncSources to one namespace (all when unset)
    /// Env: SYNCER_WATCH_NAMESPACE
    #[envconfig(from = "SYNCER_WATCH_NAMESPACE")]
    pub watch_namespace: Option<String>,

    /// Field manager name sent with every write
    #[envconfig(from = "SYNCER_FIELD_MANAGER", default = "syncer-controller")]
    pub field_manager: String,

    #[envconfig(nested)]
    pub dispatch: DispatchConfig,

    #[envconfig(nested)]
    pub leader: LeaderElectionConfig,
}

#[derive(Envconfig, Clone, Debug)]
pub struct DispatchConfig {
    #[envconfig(from = "SYNCER_WORKERS", default = "4")]
    pub workers: usize,
    /// Retries of a failing key before it is parked with an Error condition
    #[envconfig(from = "SYNCER_MAX_RETRIES", default = "15")]
    pub max_retries: u32,
    #[envconfig(from = "SYNCER_BACKOFF_BASE_MS", default = "5")]
    pub backoff_base_ms: u64,
    #[envconfig(from = "SYNCER_BACKOFF_MAX_SECS", default = "300")]
    pub backoff_max_secs: u64,
    /// Full resync + orphan collection interval
    #[envconfig(from = "SYNCER_RESYNC_SECS", default = "600")]
    pub resync_secs: u64,
    #[envconfig(from = "SYNCER_RECONCILE_TIMEOUT_SECS", default = "30")]
    pub reconcile_timeout_secs: u64,
    /// Time in-flight reconciles get to finish on shutdown
    #[envconfig(from = "SYNCER_SHUTDOWN_GRACE_SECS", default = "30")]
    pub shutdown_grace_secs: u64,
}

#[derive(Envconfig, Clone, Debug)]
pub struct LeaderElectionConfig {
    /// If Some, env explicitly set; otherwise, profile defaults apply
    #[envconfig(from = "SYNCER_LEADER_ELECTION")]
    pub enabled: Option<bool>,
    #[envconfig(from = "SYNCER_LEASE_NAME", default = "syncer-controller")]
    pub lease_name: String,
    #[envconfig(from = "SYNCER_LEASE_NAMESPACE", default = "default")]
    pub lease_namespace: String,
    #[envconfig(from = "SYNCER_LEASE_DURATION_SECS", default = "15")]
    pub lease_duration_secs: u64,
    #[envconfig(from = "SYNCER_RENEW_DEADLINE_SECS", default = "10")]
    pub renew_deadline_secs: u64,
    #[envconfig(from = "SYNCER_RETRY_PERIOD_SECS", default = "2")]
    pub retry_period_secs: u64,
    /// Holder identity; falls back to POD_NAME, then HOSTNAME, then random
    #[envconfig(from = "SYNCER_IDENTITY")]
    pub identity: Option<String>,
}

impl SyncerConfig {
    /// Apply profile → defaults mapping, while respecting explicit env overrides.
    ///
    /// - dev: leader_election=false
    /// - prod/production/full: leader_election=true
    pub fn apply_profile_defaults(mut self) -> Self {
        let def_le = matches!(
            self.profile.as_str(),
            "prod" | "production" | "full"
        );
        if self.leader.enabled.is_none() {
            self.leader.enabled = Some(def_le);
        }
        self
    }

    pub fn leader_election_enabled(&self) -> bool {
        self.leader.enabled.unwrap_or(false)
    }
}

impl DispatchConfig {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_secs(self.backoff_max_secs)
    }

    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_secs)
    }

    pub fn reconcile_timeout(&self) -> Duration {
        Duration::from_secs(self.reconcile_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            max_retries: 15,
            backoff_base_ms: 5,
            backoff_max_secs: 300,
            resync_secs: 600,
            reconcile_timeout_secs: 30,
            shutdown_grace_secs: 30,
        }
    }
}

impl LeaderElectionConfig {
    /// Resolve the holder identity used in the Lease.
    pub fn resolve_identity(&self) -> String {
        self.identity
            .clone()
            .or_else(|| std::env::var("POD_NAME").ok())
            .or_else(|| std::env::var("HOSTNAME").ok())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| format!("syncer-{:08x}", rand::random::<u32>()))
    }
}
