pub mod background;
pub mod config;
pub mod core;
pub mod engine;
pub mod hal;
pub mod host;
pub mod observability;
pub mod protocol;
pub mod relay;
pub mod storage;
pub mod transfer;
