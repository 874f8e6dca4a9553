pub mod client;
pub mod session;

pub use client::{HostClient, RECONNECT_INTERVAL};
pub use session::{HostSession, RunHandle, SessionError};
