use super::channel::RelayChannel;
use super::connection::{PeerLink, PeerRole, RelayEvent};
use crate::config::RelaySettings;
use crate::protocol::StatusMessage;
use anyhow::{Context, Result};
use log::{debug, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

/// TCP front end: one listening port per role, bytes forwarded as read
pub struct RelayServer {
    relay: Arc<RelayChannel>,
    controller_listener: TcpListener,
    detector_listener: TcpListener,
    buffer_size: usize,
}

impl RelayServer {
    pub async fn bind(settings: &RelaySettings, relay: Arc<RelayChannel>) -> Result<Self> {
        let controller_listener = TcpListener::bind(settings.controller_addr())
            .await
            .with_context(|| format!("Failed to bind controller port {}", settings.controller_addr()))?;
        let detector_listener = TcpListener::bind(settings.detector_addr())
            .await
            .with_context(|| format!("Failed to bind detector port {}", settings.detector_addr()))?;

        Ok(Self::from_listeners(
            relay,
            controller_listener,
            detector_listener,
            settings.buffer_size,
        ))
    }

    pub fn from_listeners(
        relay: Arc<RelayChannel>,
        controller_listener: TcpListener,
        detector_listener: TcpListener,
        buffer_size: usize,
    ) -> Self {
        Self {
            relay,
            controller_listener,
            detector_listener,
            buffer_size: buffer_size.max(1),
        }
    }

    pub fn local_addr(&self, role: PeerRole) -> Result<SocketAddr> {
        let listener = match role {
            PeerRole::Controller => &self.controller_listener,
            PeerRole::DetectorHost => &self.detector_listener,
        };
        Ok(listener.local_addr()?)
    }

    /// Accept connections on both ports until `shutdown` fires
    pub async fn serve(self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        info!(
            "Relay listening: controller on {}, detector host on {}",
            self.local_addr(PeerRole::Controller)?,
            self.local_addr(PeerRole::DetectorHost)?
        );

        loop {
            let (role, accepted) = tokio::select! {
                _ = shutdown.recv() => break,
                accepted = self.controller_listener.accept() => (PeerRole::Controller, accepted),
                accepted = self.detector_listener.accept() => (PeerRole::DetectorHost, accepted),
            };

            match accepted {
                Ok((stream, addr)) => {
                    info!("{} connected from {}", role.name(), addr);
                    if let Err(e) = attach_stream(&self.relay, role, stream, self.buffer_size).await {
                        warn!("Could not attach {} from {}: {:#}", role.name(), addr, e);
                    }
                }
                Err(e) => warn!("Accept on {} port failed: {}", role.name(), e),
            }
        }

        info!("Relay server stopped");
        Ok(())
    }
}

/// Bridge one socket into the relay as `role`
pub async fn attach_stream(
    relay: &RelayChannel,
    role: PeerRole,
    stream: TcpStream,
    buffer_size: usize,
) -> Result<()> {
    let PeerLink { tx, mut rx, .. } = relay.attach(role).await?;
    let (mut reader, mut writer) = stream.into_split();

    let read_task = tokio::spawn(async move {
        let mut buf = vec![0u8; buffer_size];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    if tx.send(buf[..n].to_vec()).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!("{} read failed: {}", role.name(), e);
                    break;
                }
            }
        }
    });

    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let bytes = match event {
                RelayEvent::Message(bytes) => bytes,
                RelayEvent::PeerDisconnected(gone) => {
                    StatusMessage::peer_disconnected(gone).to_json().into_bytes()
                }
            };
            if let Err(e) = writer.write_all(&bytes).await {
                debug!("{} write failed: {}", role.name(), e);
                break;
            }
        }
        // replaced, shut down, or the socket broke
        read_task.abort();
    });

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::DEFAULT_CAPACITY;
    use tokio::time::{timeout, Duration};

    async fn read_some(stream: &mut TcpStream) -> Vec<u8> {
        let mut buf = vec![0u8; 1024];
        let n = timeout(Duration::from_secs(2), stream.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        buf.truncate(n);
        buf
    }

    #[tokio::test]
    async fn test_tcp_round_trip_and_disconnect_notice() {
        let relay = Arc::new(RelayChannel::new(DEFAULT_CAPACITY));
        let server = RelayServer::from_listeners(
            relay.clone(),
            TcpListener::bind("127.0.0.1:0").await.unwrap(),
            TcpListener::bind("127.0.0.1:0").await.unwrap(),
            4096,
        );
        let controller_addr = server.local_addr(PeerRole::Controller).unwrap();
        let detector_addr = server.local_addr(PeerRole::DetectorHost).unwrap();

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let serving = tokio::spawn(server.serve(shutdown_rx));

        let mut host = TcpStream::connect(detector_addr).await.unwrap();
        let mut controller = TcpStream::connect(controller_addr).await.unwrap();
        for _ in 0..200 {
            if relay.is_live(PeerRole::Controller) && relay.is_live(PeerRole::DetectorHost) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        controller.write_all(b"{\"command\":\"arm\"}").await.unwrap();
        assert_eq!(read_some(&mut host).await, b"{\"command\":\"arm\"}");

        host.write_all(b"OK").await.unwrap();
        assert_eq!(read_some(&mut controller).await, b"OK");

        drop(host);
        let notice = read_some(&mut controller).await;
        assert_eq!(
            StatusMessage::parse(&notice),
            Some(StatusMessage::peer_disconnected(PeerRole::DetectorHost))
        );

        shutdown_tx.send(()).unwrap();
        serving.await.unwrap().unwrap();
    }
}
