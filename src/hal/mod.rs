pub mod frame_ring;
pub mod mock;
pub mod traits;
pub mod types;

pub use frame_ring::FrameRing;
pub use traits::Detector;
pub use types::{DetectorSettings, DetectorState, FrameGeometry, TriggerMode};
