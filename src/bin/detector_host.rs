use anyhow::Result;
use log::info;
use panel_daq::background::BackgroundMedianCache;
use panel_daq::config::ConfigManager;
use panel_daq::hal::mock::SimulatedDetector;
use panel_daq::host::{HostClient, HostSession};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval, Duration};

/// Rate of the simulated external trigger line
const SIMULATED_TRIGGER_INTERVAL: Duration = Duration::from_millis(200);

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("panel_daq.json"));
    let manager = ConfigManager::new(config_path);
    manager.load().await?;
    let settings = manager.config().await.host;

    let cache = Arc::new(BackgroundMedianCache::new(settings.resolved_cache_path()?));
    info!("Background median cache at {}", cache.path().display());

    let detector = SimulatedDetector::new(settings.geometry()).with_ring_frames(settings.ring_frames);
    let trigger = detector.trigger_handle();
    tokio::spawn(async move {
        let mut ticks = interval(SIMULATED_TRIGGER_INTERVAL);
        loop {
            ticks.tick().await;
            trigger.fire();
        }
    });

    let (status_tx, status_rx) = mpsc::channel(64);
    let session = Arc::new(HostSession::new(
        settings.clone(),
        Box::new(detector),
        cache,
        status_tx,
    ));
    let client = HostClient::new(
        session,
        status_rx,
        settings.relay_address.clone(),
        settings.buffer_size,
    );

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let running = tokio::spawn(client.run(shutdown_rx));

    tokio::signal::ctrl_c().await?;
    info!("Shutting down detector host");
    let _ = shutdown_tx.send(());
    running.await??;

    Ok(())
}
