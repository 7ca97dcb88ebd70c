use envconfig::Envconfig;
use kube::Client;
use syncer_controller::{config::SyncerConfig, init_tracing, runtime};
use tracing::info;

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    init_tracing("info");

    // Ensure rustls uses the aws-lc-rs provider explicitly.
    if let Err(e) = rustls::crypto::CryptoProvider::install_default(
        rustls::crypto::aws_lc_rs::default_provider(),
    ) {
        tracing::debug!(
            ?e,
            "CryptoProvider already installed or incompatible; proceeding"
        );
    }

    let cfg = SyncerConfig::init_from_env()?.apply_profile_defaults();
    info!(?cfg, "Starting syncer controller");

    let client = Client::try_default().await?;
    runtime::run_all(client, cfg).await
}
