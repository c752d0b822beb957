//! portaged — peer-to-peer file transfer daemon.

use std::sync::Arc;

use anyhow::Result;
use tracing_subscriber::EnvFilter;

use portage_core::config::NodeConfig;
use portage_services::LogObserver;
use portaged::Dispatcher;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path = NodeConfig::write_default_if_missing()?;
    let config = NodeConfig::load()?;
    tracing::info!(config = %config_path.display(), "portaged starting");

    let node = Dispatcher::start(config, Arc::new(LogObserver)).await?;
    tracing::info!(node = %node.node_id(), addr = %node.listen_addr(), "node ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested");
    node.shutdown();

    Ok(())
}
