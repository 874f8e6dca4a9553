use super::session::{HostSession, SessionError};
use crate::protocol::StatusMessage;
use anyhow::Result;
use log::{debug, info, warn};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{sleep, Duration};

pub const RECONNECT_INTERVAL: Duration = Duration::from_secs(1);

/// Keeps the detector host connected to the relay.
///
/// Each chunk read from the relay is one controller message. Status produced
/// by the session is written back on whichever connection is current.
pub struct HostClient {
    session: Arc<HostSession>,
    status_rx: mpsc::Receiver<Vec<u8>>,
    relay_address: String,
    buffer_size: usize,
    reconnect_interval: Duration,
}

impl HostClient {
    pub fn new(
        session: Arc<HostSession>,
        status_rx: mpsc::Receiver<Vec<u8>>,
        relay_address: impl Into<String>,
        buffer_size: usize,
    ) -> Self {
        Self {
            session,
            status_rx,
            relay_address: relay_address.into(),
            buffer_size: buffer_size.max(1),
            reconnect_interval: RECONNECT_INTERVAL,
        }
    }

    pub fn with_reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = interval;
        self
    }

    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        loop {
            let stream = tokio::select! {
                _ = shutdown.recv() => break,
                stream = TcpStream::connect(&self.relay_address) => stream,
            };

            match stream {
                Ok(stream) => {
                    info!("Connected to relay at {}", self.relay_address);
                    if self.serve(stream, &mut shutdown).await? {
                        break;
                    }
                    warn!("Relay connection lost, reconnecting");
                }
                Err(e) => debug!("Relay at {} not reachable: {}", self.relay_address, e),
            }

            tokio::select! {
                _ = shutdown.recv() => break,
                _ = sleep(self.reconnect_interval) => {}
            }
        }

        self.session.cancel_active_run();
        info!("Host client stopped");
        Ok(())
    }

    /// Returns true when the client should stop for good
    async fn serve(
        &mut self,
        stream: TcpStream,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<bool> {
        let (mut reader, mut writer) = stream.into_split();
        let mut buf = vec![0u8; self.buffer_size];

        loop {
            tokio::select! {
                _ = shutdown.recv() => return Ok(true),
                status = self.status_rx.recv() => match status {
                    Some(bytes) => {
                        if let Err(e) = writer.write_all(&bytes).await {
                            warn!("Failed to send status to relay: {}", e);
                            return Ok(false);
                        }
                    }
                    None => return Ok(true),
                },
                read = reader.read(&mut buf) => match read {
                    Ok(0) => return Ok(false),
                    Ok(n) => self.dispatch(&buf[..n]).await,
                    Err(e) => {
                        debug!("Relay read failed: {}", e);
                        return Ok(false);
                    }
                },
            }
        }
    }

    async fn dispatch(&self, bytes: &[u8]) {
        if let Some(StatusMessage::RelayNotice { role, .. }) = StatusMessage::parse(bytes) {
            info!("Relay reports {} disconnected", role.name());
            return;
        }

        match self.session.handle_message(bytes).await {
            Ok(run) => info!("Run {} accepted, writing to {}", run.run_name, run.run_dir.display()),
            Err(SessionError::LinkClosed) => warn!("Status channel closed"),
            Err(e) => debug!("Arm rejected: {}", e),
        }
    }
}
