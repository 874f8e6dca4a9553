pub mod detector;

pub use detector::{SimulatedDetector, TriggerHandle, FREE_RUN_INTERVAL};
