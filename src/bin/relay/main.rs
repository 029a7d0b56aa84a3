// System
use std::sync::Arc;

// Third Party
use anyhow::Context;
use kube::{Client, Config};
use tracing::info;

// Local
use kube_relay_rs::{
    config::RunEnv,
    utils::{init_tracing, setup_exit_hooks},
    HttpReportingSink, KubeClusterApi, RelayAgent, RelayConfig,
};

async fn kube_client(run_env: RunEnv) -> Result<Client, anyhow::Error> {
    let config = match run_env {
        RunEnv::Dev => Config::infer().await?,
        RunEnv::Cluster => Config::incluster()?,
    };
    Ok(Client::try_from(config)?)
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    init_tracing("kube_relay_rs", tracing::Level::DEBUG);
    let config = RelayConfig::from_env().context("Invalid configuration")?;
    info!(
        "Relaying cluster {} ({}) to {}",
        config.cluster_name, config.cloud, config.site_url
    );

    let client = kube_client(config.run_env)
        .await
        .context("Failed to initialise kube client")?;
    let version = client
        .apiserver_version()
        .await
        .context("Failed to reach the API server")?;
    info!("Cluster version: {}", version.git_version);

    let sink = HttpReportingSink::new(&config.site_url)?;
    let agent = RelayAgent::new(
        config,
        Arc::new(KubeClusterApi::new(&client)),
        Arc::new(sink),
    )?;
    setup_exit_hooks(agent.shutdown_token())?;

    agent.run().await
}
