use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use btleplug::api::Manager as _;
use btleplug::platform::Manager;
use clap::Parser;
use log::{info, warn};
use luba_sync::btle::BtleConnector;
use luba_sync::codec::JsonFrameCodec;

mod config;
mod manager;
mod mqtt;

#[derive(Parser, Debug)]
#[command(version, about = "Sync Mammotion Luba mowers over Bluetooth LE and bridge them to MQTT")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    pretty_env_logger::init();
    let args = Args::parse();

    let config_contents = std::fs::read_to_string(&args.config)
        .with_context(|| format!("reading {}", args.config.display()))?;
    let config: config::AppConfig = toml::de::from_str(&config_contents)?;

    let devices = config.devices.clone().unwrap_or_default();
    if devices.is_empty() {
        warn!("No devices configured");
    }
    info!("Devices: {:?}", devices);

    let (mqtt_client, eventloop) = mqtt::MqttClient::new(&config.mqtt);
    mqtt_client.subscribe().await?;

    let bt_manager = Manager::new().await?;

    // get the first bluetooth adapter
    let adapters = bt_manager.adapters().await?;
    let central = adapters
        .into_iter()
        .next()
        .context("no Bluetooth adapter found")?;
    let connector = BtleConnector::start(central, JsonFrameCodec).await?;

    let core = manager::Manager::new(
        Arc::new(connector),
        mqtt_client,
        eventloop,
        devices,
        config.poll.unwrap_or_default(),
    );
    core.run_loop().await
}
