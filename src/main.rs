//! Sentinel Gateway - Main Entry Point

use sentinel_gateway::config::GatewayConfig;
use sentinel_gateway::Gateway;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Sentinel Gateway v{}", env!("CARGO_PKG_VERSION"));

    let config_path = std::env::var("GATEWAY_CONFIG").unwrap_or_else(|_| "/etc/sentinel-gateway/config.json".into());

    let config = GatewayConfig::load(std::path::Path::new(&config_path)).unwrap_or_else(|_| {
        tracing::warn!("config not found at {config_path}, using defaults");
        GatewayConfig::default()
    });

    let gateway = Gateway::new(config);
    gateway.init().await?;
    gateway.run().await?;

    Ok(())
}
