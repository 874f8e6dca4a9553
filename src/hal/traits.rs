use super::types::{DetectorSettings, DetectorState, FrameGeometry};
use crate::core::FrameEvent;
use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Boundary to the flat-panel driver.
///
/// Implementations report exactly one `FrameEvent` per external trigger, in
/// trigger order, with ordinals restarting at 1 on every acquisition start.
#[async_trait]
pub trait Detector: Send {
    /// Stable identifier (e.g. sensor position on the bus)
    fn detector_id(&self) -> &str;

    fn geometry(&self) -> FrameGeometry;

    /// Push gain, binning, exposure and trigger mode to the hardware
    async fn apply(&mut self, settings: &DetectorSettings) -> Result<()>;

    /// Begin a continuous acquisition and hand back the frame stream
    async fn start_acquisition(&mut self) -> Result<mpsc::Receiver<FrameEvent>>;

    /// Abort any running acquisition; the frame stream closes
    async fn stop_acquisition(&mut self) -> Result<()>;

    fn state(&self) -> DetectorState;
}
