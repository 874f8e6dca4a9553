use anyhow::Result;
use log::info;
use panel_daq::config::ConfigManager;
use panel_daq::relay::{spawn_transfer_tap, RelayChannel, RelayServer, DEFAULT_CAPACITY};
use panel_daq::relay::tap::TAP_CAPACITY;
use panel_daq::transfer;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("panel_daq.json"));
    let manager = ConfigManager::new(config_path);
    manager.load().await?;
    let config = manager.config().await;
    info!("Loaded configuration from {}", manager.path().display());

    let (tap_tx, tap_rx) = mpsc::channel(TAP_CAPACITY);
    let relay = Arc::new(RelayChannel::with_status_tap(DEFAULT_CAPACITY, tap_tx));
    let tap = spawn_transfer_tap(tap_rx, transfer::from_settings(&config.transfer));

    let server = RelayServer::bind(&config.relay, relay.clone()).await?;

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let serving = tokio::spawn(server.serve(shutdown_rx));

    tokio::signal::ctrl_c().await?;
    info!("Shutting down relay");
    let _ = shutdown_tx.send(());
    serving.await??;
    relay.shutdown().await;
    drop(relay);
    let _ = tap.await;

    Ok(())
}
