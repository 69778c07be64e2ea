mod cli;
mod config;

use std::sync::Arc;

use anyhow::{anyhow, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

use policy_compiler::kms::DisabledKmsProvider;
use policy_compiler::tuf::ToughFetcher;
use policy_compiler::{clusterimagepolicy, trustroot, Context};
use policy_webhook::store::{run_config_watcher, SnapshotStore};

use config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    let matches = cli::build_cli().get_matches();
    let config = Config::from_args(&matches)?;

    setup_tracing(&config)?;
    info!(
        namespace = %config.namespace,
        no_match_policy = ?config.no_match_policy,
        "starting policy-controller"
    );

    let client = kube::Client::try_default()
        .await
        .map_err(|e| anyhow!("cannot build the Kubernetes client: {e}"))?;

    let mut ctx = Context::new(
        client.clone(),
        config.namespace.clone(),
        config.resync,
        Arc::new(DisabledKmsProvider),
        Arc::new(ToughFetcher),
    );
    ctx.image_policies_configmap = config.image_policies_configmap.clone();
    ctx.sigstore_keys_configmap = config.sigstore_keys_configmap.clone();
    let ctx = Arc::new(ctx);

    // The admission collaborator reads its policy snapshots from here; the
    // reconcilers keep the backing ConfigMaps current.
    let store = Arc::new(SnapshotStore::new());
    let watcher = tokio::spawn(run_config_watcher(
        client,
        config.namespace.clone(),
        config.image_policies_configmap.clone(),
        config.sigstore_keys_configmap.clone(),
        store,
    ));

    let cip_controller = tokio::spawn(clusterimagepolicy::run(ctx.clone()));
    let trust_root_controller = tokio::spawn(trustroot::run(ctx));

    tokio::select! {
        _ = watcher => Err(anyhow!("configuration watcher terminated")),
        _ = cip_controller => Err(anyhow!("ClusterImagePolicy reconciler terminated")),
        _ = trust_root_controller => Err(anyhow!("TrustRoot reconciler terminated")),
    }
}

fn setup_tracing(config: &Config) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    match config.log_fmt.as_str() {
        "json" => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .try_init()
            .map_err(|e| anyhow!("cannot initialize tracing: {e}")),
        _ => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .try_init()
            .map_err(|e| anyhow!("cannot initialize tracing: {e}")),
    }
}
