pub mod channel;
pub mod connection;
pub mod server;
pub mod tap;

pub use channel::{RelayChannel, DEFAULT_CAPACITY};
pub use connection::{PeerLink, PeerRole, RelayConnection, RelayEvent};
pub use server::{attach_stream, RelayServer};
pub use tap::spawn_transfer_tap;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("{} disconnected", .0.name())]
    PeerDisconnected(PeerRole),

    #[error("Relay is shut down")]
    Closed,

    #[error("Relay socket error: {0}")]
    Io(#[from] std::io::Error),
}
