//! `drover gateway` — start the HTTP gateway.

use anyhow::Result;
use tracing_subscriber::EnvFilter;

use drover::config::GatewayConfig;
use drover::gateway::start_server;

pub async fn cmd_gateway(port: Option<u16>) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut config = GatewayConfig::from_env()?;
    if let Some(port) = port {
        config.port = port;
    }
    start_server(config).await
}
