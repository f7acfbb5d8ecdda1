use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use tasmota_bridge::config;
use tasmota_bridge::mqtt::MqttTransport;
use tasmota_bridge::Bridge;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,tasmota_bridge=debug")),
        )
        .init();

    tracing::info!("Starting tasmota-bridge v{}", env!("CARGO_PKG_VERSION"));

    let config = config::from_env()?;
    tracing::info!(
        "Firmware variant table {} (minimum {})",
        config.firmware.revision,
        config.firmware.min_version
    );

    let transport = Arc::new(MqttTransport::connect(&config.mqtt));
    let bridge = Bridge::start(&config, transport).await?;
    let model = bridge.model();

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down with {} devices known", model.device_count());
    Ok(())
}
