use async_trait::async_trait;
use panel_daq::background::BackgroundMedianCache;
use panel_daq::config::HostSettings;
use panel_daq::hal::mock::SimulatedDetector;
use panel_daq::hal::FrameGeometry;
use panel_daq::host::{HostClient, HostSession};
use panel_daq::protocol::{StatusMessage, ACK_OK};
use panel_daq::relay::{spawn_transfer_tap, PeerRole, RelayChannel, RelayServer, DEFAULT_CAPACITY};
use panel_daq::transfer::{TransferError, TransferTrigger};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::tempdir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{sleep, timeout, Duration};

struct ChannelTransfer {
    tx: mpsc::Sender<PathBuf>,
}

#[async_trait]
impl TransferTrigger for ChannelTransfer {
    fn destination(&self) -> String {
        "test channel".to_string()
    }

    async fn on_run_complete(&self, result_dir: &Path) -> Result<(), TransferError> {
        let _ = self.tx.send(result_dir.to_path_buf()).await;
        Ok(())
    }
}

async fn read_message(stream: &mut TcpStream) -> Vec<u8> {
    let mut buf = vec![0u8; 4096];
    let n = timeout(Duration::from_secs(5), stream.read(&mut buf))
        .await
        .unwrap()
        .unwrap();
    buf.truncate(n);
    buf
}

#[tokio::test]
async fn test_arm_run_and_copy_through_relay() {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = tempdir().unwrap();

    // relay with a tap feeding the transfer trigger
    let (tap_tx, tap_rx) = mpsc::channel(8);
    let (copied_tx, mut copied_rx) = mpsc::channel(8);
    let relay = Arc::new(RelayChannel::with_status_tap(DEFAULT_CAPACITY, tap_tx));
    let _tap = spawn_transfer_tap(tap_rx, Arc::new(ChannelTransfer { tx: copied_tx }));
    let server = RelayServer::from_listeners(
        relay.clone(),
        TcpListener::bind("127.0.0.1:0").await.unwrap(),
        TcpListener::bind("127.0.0.1:0").await.unwrap(),
        4096,
    );
    let controller_addr = server.local_addr(PeerRole::Controller).unwrap();
    let detector_addr = server.local_addr(PeerRole::DetectorHost).unwrap();
    let (shutdown_tx, _) = broadcast::channel(1);
    let serving = tokio::spawn(server.serve(shutdown_tx.subscribe()));

    // detector host
    let settings = HostSettings {
        write_dir: dir.path().join("Runs"),
        arm_delay_ms: 0,
        ..HostSettings::default()
    };
    let detector = SimulatedDetector::new(FrameGeometry { rows: 2, columns: 2 });
    let trigger = detector.trigger_handle();
    let cache = Arc::new(BackgroundMedianCache::new(dir.path().join("median.bin")));
    let (status_tx, status_rx) = mpsc::channel(16);
    let session = Arc::new(HostSession::new(settings, Box::new(detector), cache, status_tx));
    let client = HostClient::new(session, status_rx, detector_addr.to_string(), 4096)
        .with_reconnect_interval(Duration::from_millis(20));
    let hosting = tokio::spawn(client.run(shutdown_tx.subscribe()));

    // controller
    let mut controller = TcpStream::connect(controller_addr).await.unwrap();
    for _ in 0..400 {
        if relay.is_live(PeerRole::Controller) && relay.is_live(PeerRole::DetectorHost) {
            break;
        }
        sleep(Duration::from_millis(5)).await;
    }
    assert!(relay.is_live(PeerRole::DetectorHost));

    let arm = json!({
        "command": "arm",
        "experiment": "exp",
        "run_name": "r1",
        "num_skip_frames": 2,
        "num_background_frames": 2,
        "num_data_frames": 1,
        "num_post_background_frames": 0,
        "includes_shot_frame": true,
        "gain": 4,
        "binning": 1
    });
    controller.write_all(arm.to_string().as_bytes()).await.unwrap();
    assert_eq!(read_message(&mut controller).await, ACK_OK.as_bytes());

    for _ in 0..5 {
        while !trigger.fire() {
            sleep(Duration::from_millis(5)).await;
        }
        sleep(Duration::from_millis(5)).await;
    }

    let run_dir = std::fs::canonicalize(dir.path().join("Runs/exp/r1")).unwrap();
    assert_eq!(
        StatusMessage::parse(&read_message(&mut controller).await),
        Some(StatusMessage::copy_dir(&run_dir))
    );

    let copied = timeout(Duration::from_secs(5), copied_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(copied, run_dir);
    assert!(run_dir.join("r1_0005_data_ds.raw").exists());
    assert!(run_dir.join("r1_background_median.raw").exists());

    // host goes away; the controller is told
    shutdown_tx.send(()).unwrap();
    hosting.await.unwrap().unwrap();
    assert_eq!(
        StatusMessage::parse(&read_message(&mut controller).await),
        Some(StatusMessage::peer_disconnected(PeerRole::DetectorHost))
    );

    serving.await.unwrap().unwrap();
    assert_eq!(relay.metrics(PeerRole::DetectorHost).messages_forwarded(), 1);
    assert_eq!(relay.metrics(PeerRole::Controller).messages_forwarded(), 2);
}
