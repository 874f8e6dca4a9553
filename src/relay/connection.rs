use super::RelayError;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tokio::sync::mpsc;

/// The two logical peers the relay joins
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerRole {
    Controller,
    DetectorHost,
}

impl PeerRole {
    pub fn other(&self) -> PeerRole {
        match self {
            PeerRole::Controller => PeerRole::DetectorHost,
            PeerRole::DetectorHost => PeerRole::Controller,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            PeerRole::Controller => "controller",
            PeerRole::DetectorHost => "detector_host",
        }
    }
}

/// What the relay delivers to a connected peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    /// Bytes from the other peer, unmodified
    Message(Vec<u8>),
    /// The other peer went away; the relay waits for it to reconnect
    PeerDisconnected(PeerRole),
}

/// Bookkeeping for the current connection of one role
#[derive(Debug, Clone)]
pub struct RelayConnection {
    pub role: PeerRole,
    /// Increases with every attach; a newer connection replaces an older one
    pub generation: u64,
    pub live: bool,
    pub connected_at: Instant,
    pub last_activity: Instant,
}

impl RelayConnection {
    pub fn new(role: PeerRole, generation: u64) -> Self {
        let now = Instant::now();
        Self {
            role,
            generation,
            live: true,
            connected_at: now,
            last_activity: now,
        }
    }
}

/// Peer-side ends of an attached connection.
///
/// Dropping `tx` is how a peer disconnects.
pub struct PeerLink {
    pub role: PeerRole,
    pub tx: mpsc::Sender<Vec<u8>>,
    pub rx: mpsc::Receiver<RelayEvent>,
}

impl PeerLink {
    pub async fn send(&self, message: impl Into<Vec<u8>>) -> Result<(), RelayError> {
        self.tx
            .send(message.into())
            .await
            .map_err(|_| RelayError::Closed)
    }

    /// Next relayed message; a disconnect notice surfaces as `PeerDisconnected`
    pub async fn recv(&mut self) -> Result<Vec<u8>, RelayError> {
        match self.rx.recv().await {
            Some(RelayEvent::Message(bytes)) => Ok(bytes),
            Some(RelayEvent::PeerDisconnected(role)) => Err(RelayError::PeerDisconnected(role)),
            None => Err(RelayError::Closed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roles_pair_up() {
        assert_eq!(PeerRole::Controller.other(), PeerRole::DetectorHost);
        assert_eq!(PeerRole::DetectorHost.other(), PeerRole::Controller);
        assert_eq!(PeerRole::DetectorHost.name(), "detector_host");
    }

    #[test]
    fn test_role_serializes_snake_case() {
        let json = serde_json::to_string(&PeerRole::DetectorHost).unwrap();
        assert_eq!(json, "\"detector_host\"");
    }
}
