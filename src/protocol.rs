//! Messages exchanged between the controller and the detector host.
//!
//! The relay never interprets these; it only forwards bytes. The one
//! exception is its own disconnect notice, which it writes to the peer that
//! is still connected.

use crate::relay::PeerRole;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Reply to an accepted arm command
pub const ACK_OK: &str = "OK";
/// Reply to a rejected arm command
pub const ACK_NOT_OK: &str = "NOT OK";

/// Status the detector host sends when a run ends, or the relay's notice
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StatusMessage {
    /// Run complete; the controller side may copy this directory
    CopyDir { copy_dir: String },
    /// Run ended without a full set of frames
    Message { message: String },
    /// Written by the relay when the other peer's connection drops
    RelayNotice { relay: String, role: PeerRole },
}

impl StatusMessage {
    pub fn copy_dir(dir: &Path) -> Self {
        StatusMessage::CopyDir {
            copy_dir: posix_path(dir),
        }
    }

    pub fn message(text: impl Into<String>) -> Self {
        StatusMessage::Message {
            message: text.into(),
        }
    }

    pub fn peer_disconnected(role: PeerRole) -> Self {
        StatusMessage::RelayNotice {
            relay: "peer_disconnected".to_string(),
            role,
        }
    }

    pub fn parse(bytes: &[u8]) -> Option<Self> {
        serde_json::from_slice(bytes).ok()
    }

    pub fn to_json(&self) -> String {
        // untagged enums of strings always serialize
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Path with forward slashes regardless of the host platform
pub fn posix_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_copy_dir_wire_form() {
        let msg = StatusMessage::copy_dir(Path::new("/data/Runs/exp/12"));
        assert_eq!(msg.to_json(), r#"{"copy_dir":"/data/Runs/exp/12"}"#);
        assert_eq!(StatusMessage::parse(msg.to_json().as_bytes()), Some(msg));
    }

    #[test]
    fn test_message_wire_form() {
        let msg = StatusMessage::message("Only received 3 of 5 frames");
        assert_eq!(msg.to_json(), r#"{"message":"Only received 3 of 5 frames"}"#);
    }

    #[test]
    fn test_relay_notice() {
        let msg = StatusMessage::peer_disconnected(PeerRole::DetectorHost);
        let parsed = StatusMessage::parse(msg.to_json().as_bytes()).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn test_plain_text_is_not_status() {
        assert_eq!(StatusMessage::parse(ACK_OK.as_bytes()), None);
        assert_eq!(StatusMessage::parse(b"{\"command\":\"arm\"}"), None);
    }

    #[test]
    fn test_posix_path() {
        assert_eq!(posix_path(Path::new("C:\\Runs\\exp")), "C:/Runs/exp");
    }
}
