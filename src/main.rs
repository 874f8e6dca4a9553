use anyhow::{bail, Context, Result};
use log::info;
use panel_daq::background::BackgroundMedianCache;
use panel_daq::config::HostSettings;
use panel_daq::hal::mock::SimulatedDetector;
use panel_daq::host::{HostClient, HostSession};
use panel_daq::protocol::{StatusMessage, ACK_OK};
use panel_daq::relay::tap::TAP_CAPACITY;
use panel_daq::relay::{spawn_transfer_tap, PeerRole, RelayChannel, RelayServer, DEFAULT_CAPACITY};
use panel_daq::transfer::NoTransfer;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{sleep, timeout, Duration};

async fn read_message(stream: &mut TcpStream) -> Result<String> {
    let mut buf = vec![0u8; 4096];
    let n = timeout(Duration::from_secs(10), stream.read(&mut buf))
        .await
        .context("Timed out waiting for the detector host")??;
    Ok(String::from_utf8_lossy(&buf[..n]).into_owned())
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    println!("panel_daq - simulated acquisition over a loopback relay");
    println!("=======================================================\n");

    let work_dir = std::env::temp_dir().join("panel_daq_demo");
    let settings = HostSettings {
        write_dir: work_dir.join("Runs"),
        arm_delay_ms: 0,
        cache_path: Some(work_dir.join("background_median.bin")),
        frame_rows: 16,
        frame_columns: 16,
        ring_frames: 4,
        ..HostSettings::default()
    };

    // Relay on ephemeral loopback ports
    let (tap_tx, tap_rx) = mpsc::channel(TAP_CAPACITY);
    let relay = Arc::new(RelayChannel::with_status_tap(DEFAULT_CAPACITY, tap_tx));
    let tap = spawn_transfer_tap(tap_rx, Arc::new(NoTransfer));
    let server = RelayServer::from_listeners(
        relay.clone(),
        TcpListener::bind("127.0.0.1:0").await?,
        TcpListener::bind("127.0.0.1:0").await?,
        4096,
    );
    let controller_addr = server.local_addr(PeerRole::Controller)?;
    let detector_addr = server.local_addr(PeerRole::DetectorHost)?;
    let (shutdown_tx, _) = broadcast::channel(1);
    let serving = tokio::spawn(server.serve(shutdown_tx.subscribe()));

    // Detector host with a simulated panel
    let detector = SimulatedDetector::new(settings.geometry()).with_ring_frames(settings.ring_frames);
    let trigger = detector.trigger_handle();
    let cache = Arc::new(BackgroundMedianCache::new(settings.resolved_cache_path()?));
    let (status_tx, status_rx) = mpsc::channel(64);
    let session = Arc::new(HostSession::new(
        settings.clone(),
        Box::new(detector),
        cache,
        status_tx,
    ));
    let client = HostClient::new(session, status_rx, detector_addr.to_string(), 4096)
        .with_reconnect_interval(Duration::from_millis(50));
    let hosting = tokio::spawn(client.run(shutdown_tx.subscribe()));

    // Controller side
    let mut controller = TcpStream::connect(controller_addr).await?;
    while !(relay.is_live(PeerRole::Controller) && relay.is_live(PeerRole::DetectorHost)) {
        sleep(Duration::from_millis(10)).await;
    }

    let arm = serde_json::json!({
        "command": "arm",
        "experiment": "demo",
        "run_name": 1,
        "num_skip_frames": 2,
        "num_background_frames": 2,
        "num_data_frames": 1,
        "num_post_background_frames": 0,
        "includes_shot_frame": true,
        "gain": 4,
        "binning": 1
    });
    println!("Controller -> arm {}", arm);
    controller.write_all(arm.to_string().as_bytes()).await?;

    let reply = read_message(&mut controller).await?;
    println!("Detector host -> {}", reply);
    if reply != ACK_OK {
        bail!("Arm was rejected");
    }

    // Five external triggers: 2 skip, 2 background, 1 shot frame
    for pulse in 1..=5 {
        while !trigger.fire() {
            sleep(Duration::from_millis(5)).await;
        }
        info!("Trigger {} fired", pulse);
        sleep(Duration::from_millis(20)).await;
    }

    let status = read_message(&mut controller).await?;
    println!("Detector host -> {}", status);
    match StatusMessage::parse(status.as_bytes()) {
        Some(StatusMessage::CopyDir { copy_dir }) => {
            println!("\nRun directory {}:", copy_dir);
            let mut entries = std::fs::read_dir(&copy_dir)?
                .filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect::<Vec<_>>();
            entries.sort();
            for name in entries {
                println!("  {}", name);
            }
        }
        _ => println!("\nRun did not complete"),
    }

    let to_controller = relay.metrics(PeerRole::Controller);
    let to_host = relay.metrics(PeerRole::DetectorHost);
    println!(
        "\nRelay: {} -> {} msgs / {} bytes, {} -> {} msgs / {} bytes",
        to_host.direction(),
        to_host.messages_forwarded(),
        to_host.bytes_forwarded(),
        to_controller.direction(),
        to_controller.messages_forwarded(),
        to_controller.bytes_forwarded()
    );

    let _ = shutdown_tx.send(());
    hosting.await??;
    serving.await??;
    relay.shutdown().await;
    drop(relay);
    let _ = tap.await;

    Ok(())
}
