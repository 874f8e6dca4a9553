use crate::core::RunConfig;
use serde::{Deserialize, Serialize};

/// Frame synchronisation source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerMode {
    /// Detector free-runs on its own timer
    Internal,
    /// One frame per external trigger pulse
    External,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DetectorState {
    Ready,
    Acquiring,
    Stopped,
    Error(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameGeometry {
    pub rows: usize,
    pub columns: usize,
}

impl FrameGeometry {
    pub fn pixels(&self) -> usize {
        self.rows * self.columns
    }
}

/// Settings pushed to the detector before each run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectorSettings {
    pub gain: i64,
    pub binning: i64,
    pub exposure_ms: u64,
    pub trigger_mode: TriggerMode,
}

impl DetectorSettings {
    /// Externally triggered settings for one run
    pub fn for_run(config: &RunConfig, exposure_ms: u64) -> Self {
        Self {
            gain: config.gain,
            binning: config.binning,
            exposure_ms,
            trigger_mode: TriggerMode::External,
        }
    }
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            gain: 4,
            binning: 1,
            exposure_ms: 100,
            trigger_mode: TriggerMode::Internal,
        }
    }
}
